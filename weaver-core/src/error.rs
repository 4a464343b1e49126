use crate::model::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Errors raised by the in-memory graph cache
#[derive(Error, Debug)]
pub enum GraphError {
    /// A crawl count or edge referenced a node that was never upserted
    #[error("Unknown node id: {0}")]
    UnknownNode(NodeId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
