//! Application error types

use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Exchange error: {0}")]
    Exchange(#[from] FetchError),

    #[error("Storage write error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single exchange request.
///
/// The variant decides whether the retry coordinator tries again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network hiccup, rate limit, exchange-side 5xx
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Unknown exchange, bad symbol, unsupported timeframe, malformed body
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        FetchError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        FetchError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            FetchError::Transient(err.to_string())
        } else if err.is_decode() {
            FetchError::Permanent(format!("malformed response: {}", err))
        } else {
            FetchError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
        // 418 is Binance's escalated rate-limit ban; it lifts after Retry-After
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
            || status.is_server_error()
        {
            FetchError::Transient(msg)
        } else {
            FetchError::Permanent(msg)
        }
    }
}

/// Terminal failure of one download after the retry coordinator gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: FetchError },

    #[error("aborted without retry: {0}")]
    Permanent(FetchError),
}

impl DownloadError {
    /// The underlying exchange error.
    pub fn source_error(&self) -> &FetchError {
        match self {
            DownloadError::RetriesExhausted { last, .. } => last,
            DownloadError::Permanent(err) => err,
        }
    }
}

/// Serializable error record for the metrics ledger
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Http(_) => "HTTP_ERROR",
            AppError::Csv(_) => "CSV_ERROR",
            AppError::ConfigParse(_) | AppError::Config(_) => "CONFIG_ERROR",
            AppError::Exchange(_) => "EXCHANGE_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&DownloadError> for ErrorResponse {
    fn from(err: &DownloadError) -> Self {
        let code = match err {
            DownloadError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            DownloadError::Permanent(_) => "PERMANENT_FETCH_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
