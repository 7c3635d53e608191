//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub storage_root: PathBuf,
    pub cors_origin: String,

    // --- Collaborators ---
    pub openai_api_key: String,
    pub annotation_model: String,
    pub books_api_url: String,

    // --- Uploads ---
    pub max_declared_upload_bytes: u64,
    pub max_file_bytes: u64,

    // --- Rate limiting ---
    pub rate_limit_capacity: u32,
    pub rate_limit_refill: Duration,
    pub rate_limit_max_clients: usize,
    pub rate_limit_idle: Duration,

    // --- Pipeline ---
    pub pipeline_workers: usize,
    pub pipeline_max_attempts: u32,
    pub pipeline_retry_base: Duration,
}

pub const DEFAULT_BOOKS_API_URL: &str = "https://www.googleapis.com/books/v1/volumes";

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // --- Load Server and Database Settings ---
        let bind_address = parse_var("BIND_ADDRESS", &var("BIND_ADDRESS", "0.0.0.0:3000"))?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let log_level_str = var("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let storage_root = PathBuf::from(var("STORAGE_ROOT", "/tmp/textlift/uploads"));
        let cors_origin = var("CORS_ORIGIN", "http://localhost:5173");

        // --- Load API Keys ---
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let annotation_model = var("ANNOTATION_MODEL", "gpt-4o-mini");
        let books_api_url = var("BOOKS_API_URL", DEFAULT_BOOKS_API_URL);

        // --- Limits ---
        let max_declared_upload_bytes = parse_var(
            "MAX_DECLARED_UPLOAD_BYTES",
            &var("MAX_DECLARED_UPLOAD_BYTES", "250000000"),
        )?;
        let max_file_bytes = parse_var("MAX_FILE_BYTES", &var("MAX_FILE_BYTES", "26214400"))?;

        let rate_limit_capacity: u32 = parse_positive("RATE_LIMIT_CAPACITY", &var("RATE_LIMIT_CAPACITY", "60"))?;
        let rate_limit_refill_secs: u64 =
            parse_positive("RATE_LIMIT_REFILL_SECS", &var("RATE_LIMIT_REFILL_SECS", "60"))?;
        let rate_limit_max_clients: usize =
            parse_positive("RATE_LIMIT_MAX_CLIENTS", &var("RATE_LIMIT_MAX_CLIENTS", "10000"))?;
        let rate_limit_idle_secs: u64 = parse_positive("RATE_LIMIT_IDLE_SECS", &var("RATE_LIMIT_IDLE_SECS", "600"))?;

        let pipeline_workers: usize = parse_positive("PIPELINE_WORKERS", &var("PIPELINE_WORKERS", "4"))?;
        let pipeline_max_attempts: u32 =
            parse_positive("PIPELINE_MAX_ATTEMPTS", &var("PIPELINE_MAX_ATTEMPTS", "3"))?;
        let pipeline_retry_base_ms: u64 = parse_var("PIPELINE_RETRY_BASE_MS", &var("PIPELINE_RETRY_BASE_MS", "500"))?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            storage_root,
            cors_origin,
            openai_api_key,
            annotation_model,
            books_api_url,
            max_declared_upload_bytes,
            max_file_bytes,
            rate_limit_capacity,
            rate_limit_refill: Duration::from_secs(rate_limit_refill_secs),
            rate_limit_max_clients,
            rate_limit_idle: Duration::from_secs(rate_limit_idle_secs),
            pipeline_workers,
            pipeline_max_attempts,
            pipeline_retry_base: Duration::from_millis(pipeline_retry_base_ms),
        })
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value: T = parse_var(key, raw)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue(key.to_string(), "must be greater than zero".to_string()));
    }
    Ok(value)
}
