//! Environment-driven configuration structures shared by all binaries.

use std::env;

use thiserror::Error;

/// API-specific configuration (HTTP bind + shared database + OCR endpoint)
/// so the HTTP surface does not depend on settlement-only environment
/// variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    database_url: String,
    api_bind_address: String,
    api_unix_socket: Option<String>,
    internal_bind_address: Option<String>,
    internal_unix_socket: Option<String>,
    ocr_endpoint: String,
}

impl ApiConfig {
    /// Loads only the environment variables required by the API binary.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            api_bind_address: get_required_var("API_BIND_ADDRESS")?,
            api_unix_socket: get_optional_var("API_UNIX_SOCKET"),
            internal_bind_address: get_optional_var("API_INTERNAL_BIND_ADDRESS"),
            internal_unix_socket: get_optional_var("API_INTERNAL_UNIX_SOCKET"),
            ocr_endpoint: get_required_var("OCR_ENDPOINT")?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn api_unix_socket(&self) -> Option<&str> {
        self.api_unix_socket.as_deref()
    }

    pub fn internal_bind_address(&self) -> Option<&str> {
        self.internal_bind_address.as_deref()
    }

    pub fn internal_unix_socket(&self) -> Option<&str> {
        self.internal_unix_socket.as_deref()
    }

    pub fn has_internal_listener(&self) -> bool {
        self.internal_bind_address.is_some() || self.internal_unix_socket.is_some()
    }

    pub fn ocr_endpoint(&self) -> &str {
        &self.ocr_endpoint
    }
}

/// Configuration for the settlement worker binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementConfig {
    database_url: String,
    reward_endpoint: String,
    poll_interval_secs: u64,
    max_retries: i32,
    backoff_base_secs: i64,
    claim_batch_size: u64,
    stuck_after_secs: i64,
}

impl SettlementConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// required process variables. Missing or malformed entries surface as
    /// `ConfigError` so binaries can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            reward_endpoint: get_required_var("REWARD_ENDPOINT")?,
            poll_interval_secs: get_numeric_var("SETTLEMENT_POLL_INTERVAL_SECS", 5)?,
            max_retries: get_numeric_var("SETTLEMENT_MAX_RETRIES", 5)?,
            backoff_base_secs: get_numeric_var("SETTLEMENT_BACKOFF_BASE_SECS", 30)?,
            claim_batch_size: get_numeric_var("SETTLEMENT_CLAIM_BATCH_SIZE", 20)?,
            stuck_after_secs: get_numeric_var("RECONCILE_STUCK_AFTER_SECS", 300)?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn reward_endpoint(&self) -> &str {
        &self.reward_endpoint
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn backoff_base_secs(&self) -> i64 {
        self.backoff_base_secs
    }

    pub fn claim_batch_size(&self) -> u64 {
        self.claim_batch_size
    }

    pub fn stuck_after_secs(&self) -> i64 {
        self.stuck_after_secs
    }
}

/// Verification policy constants. Loaded from optional environment
/// variables with defaults, then passed explicitly into the verifiers —
/// nothing here lives on a process-wide singleton.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    geofence_max_accuracy_m: f64,
    default_token_ttl_sec: i64,
    receipt_min_confidence: f64,
    receipt_total_tolerance: i64,
    ocr_timeout_secs: u64,
    rate_limit: u32,
    rate_window_secs: i64,
    idempotency_ttl_hours: i64,
}

impl PolicyConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            geofence_max_accuracy_m: get_float_var("GEOFENCE_MAX_ACCURACY_M", 50.0)?,
            default_token_ttl_sec: get_numeric_var("QR_TOKEN_TTL_SEC", 600)?,
            receipt_min_confidence: get_float_var("RECEIPT_MIN_CONFIDENCE", 0.8)?,
            receipt_total_tolerance: get_numeric_var("RECEIPT_TOTAL_TOLERANCE", 1_000)?,
            ocr_timeout_secs: get_numeric_var("OCR_TIMEOUT_SECS", 20)?,
            rate_limit: get_numeric_var("RATE_LIMIT_MAX_REQUESTS", 30)?,
            rate_window_secs: get_numeric_var("RATE_LIMIT_WINDOW_SECS", 60)?,
            idempotency_ttl_hours: get_numeric_var("IDEMPOTENCY_TTL_HOURS", 24)?,
        })
    }

    pub fn geofence_max_accuracy_m(&self) -> f64 {
        self.geofence_max_accuracy_m
    }

    pub fn default_token_ttl_sec(&self) -> i64 {
        self.default_token_ttl_sec
    }

    pub fn receipt_min_confidence(&self) -> f64 {
        self.receipt_min_confidence
    }

    pub fn receipt_total_tolerance(&self) -> i64 {
        self.receipt_total_tolerance
    }

    pub fn ocr_timeout_secs(&self) -> u64 {
        self.ocr_timeout_secs
    }

    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    pub fn rate_window_secs(&self) -> i64 {
        self.rate_window_secs
    }

    pub fn idempotency_ttl_hours(&self) -> i64 {
        self.idempotency_ttl_hours
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            geofence_max_accuracy_m: 50.0,
            default_token_ttl_sec: 600,
            receipt_min_confidence: 0.8,
            receipt_total_tolerance: 1_000,
            ocr_timeout_secs: 20,
            rate_limit: 30,
            rate_window_secs: 60,
            idempotency_ttl_hours: 24,
        }
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(ConfigError::MissingVar { key })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Err(_) => Err(ConfigError::MissingVar { key }),
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_numeric_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        _ => Ok(default),
    }
}

fn get_float_var(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidFloat { key, source }),
        _ => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("VISITPROOF_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid float in `{key}`: {source}")]
    InvalidFloat {
        key: &'static str,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
