//! # folio
//!
//! Rate-limited dispatch of OCR and translation work to an external
//! generative-AI service.
//!
//! Provides a sliding-window admission limiter, a FIFO work list with a
//! strict lifecycle, the dispatcher that ties them to the service, a local
//! key-value store for settings and history, and OpenTelemetry observability.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod limits;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod window;

pub use dispatcher::{Countdown, Dispatcher, Status};
pub use limits::Limits;
