use sinkwatch_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Scan failed: {0}")]
    Scan(ScanError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ScanError> for CoreError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::InvalidUrl(msg) => CoreError::Validation(msg),
            other => CoreError::Scan(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
