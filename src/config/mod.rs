//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The API key is wrapped in `SecretString` to keep it out of logs.

pub mod secrets;

use serde::Deserialize;
use std::path::Path;

use self::secrets::SecretString;
use crate::error::{Error, Result};
use crate::service::{anthropic, gemini};

/// Which external service backs the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    Anthropic,
}

impl Provider {
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Gemini => gemini::DEFAULT_MODEL,
            Provider::Anthropic => anthropic::DEFAULT_MODEL,
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(Error::Config(format!("unknown provider: {other}"))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub api_key: SecretString,
    pub provider: Provider,
    pub model: String,
    pub database_url: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let provider: Provider = match std::env::var("FOLIO_PROVIDER") {
            Ok(p) => p.parse()?,
            Err(_) => Provider::Gemini,
        };
        Ok(Self {
            api_key: SecretString::from(required_var("FOLIO_API_KEY")?),
            provider,
            model: std::env::var("FOLIO_MODEL")
                .unwrap_or_else(|_| provider.default_model().to_string()),
            database_url: database_url_from_env(),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// `FOLIO_DATABASE_URL`, defaulting to `folio.db` in the working directory.
///
/// Separate from [`Config::from_env`] so store-only commands need no API key.
pub fn database_url_from_env() -> String {
    std::env::var("FOLIO_DATABASE_URL").unwrap_or_else(|_| "sqlite://folio.db".to_string())
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Reusable request settings loaded from a TOML file.
///
/// ```toml
/// model = "gemini-2.5-pro"
/// instructions = "Transcribe the text, then translate it to English."
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub model: Option<String>,
    pub instructions: Option<String>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad profile {}: {e}", path.display())))
    }
}
