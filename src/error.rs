//! Application error types

use thiserror::Error;

/// Validation failure while mapping a vendor record to a canonical row
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("stock symbol missing")]
    MissingSymbol,

    #[error("company profile ticker missing for {symbol:?}")]
    MissingTicker { symbol: String },

    #[error("len({field}) = {actual}, len(timestamp) = {expected} for stock {symbol:?}")]
    LengthMismatch {
        symbol: String,
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("timestamp {value} out of range for stock {symbol:?}")]
    InvalidTimestamp { symbol: String, value: i64 },

    #[error("invalid {field} date {value:?} for {symbol:?}")]
    InvalidDate {
        symbol: String,
        field: &'static str,
        value: String,
    },
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] TransformError),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Retries exhausted after {elapsed_secs}s: {last}")]
    BackoffExceeded { elapsed_secs: u64, last: Box<AppError> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(e) => is_busy(e),
            AppError::Pool(_) => true,
            AppError::Http(_) => true,
            AppError::RateLimited(_) => true,
            AppError::Upstream { status, .. } => *status >= 500,
            AppError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Errors that must abort the whole worker loop instead of skipping a
    /// symbol. A symbol that exhausts its retries is skipped like any other
    /// extraction failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited(_))
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_database_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(AppError::Database(busy).is_transient());
        assert!(!AppError::Database(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }

    #[test]
    fn test_classification() {
        assert!(AppError::RateLimited("429".into()).is_transient());
        assert!(AppError::Upstream { status: 502, message: String::new() }.is_transient());
        assert!(!AppError::Upstream { status: 403, message: String::new() }.is_transient());
        assert!(AppError::Cancelled("run".into()).is_fatal());
        let exhausted = AppError::BackoffExceeded {
            elapsed_secs: 300,
            last: Box::new(AppError::RateLimited("429".into())),
        };
        assert!(!exhausted.is_fatal());
        assert!(!exhausted.is_transient());
        assert!(!AppError::Payload("bad".into()).is_transient());
    }

    #[test]
    fn test_length_mismatch_message_names_field() {
        let err = TransformError::LengthMismatch {
            symbol: "AAPL".into(),
            field: "close",
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "len(close) = 2, len(timestamp) = 3 for stock \"AAPL\""
        );
    }
}
