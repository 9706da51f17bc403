//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers can hold API keys without
//! depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
