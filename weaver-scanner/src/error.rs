use thiserror::Error;
use weaver_core::StoreError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Failures reported by a fetcher, either when dispatching or through `on_error`
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Fetcher cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transport timeouts, connection failures and 5xx responses
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect(),
            FetchError::Status(status) => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
