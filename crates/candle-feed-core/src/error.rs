use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Required connection settings are absent.
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    /// A timeframe definition or request parameter is malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error on {table}: {message}")]
    Storage { table: String, message: String },

    #[error("Upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
}

impl FeedError {
    pub fn storage(table: &str, message: impl Into<String>) -> Self {
        FeedError::Storage {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Failures that the next scheduled pass may resolve on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Storage { .. } | FeedError::UpstreamFetch(_) | FeedError::Timeout { .. }
        )
    }
}
