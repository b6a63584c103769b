use candle_feed_core::FeedError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider configuration error: {0}")]
    Config(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("No data for {symbol} at {bucket_start}")]
    NoData { symbol: String, bucket_start: i64 },

    #[error("Unsupported bucket width: {0}s")]
    UnsupportedInterval(i64),
}

impl ProviderError {
    /// Failure of a market-data fetch.
    pub fn into_upstream(self) -> FeedError {
        match self {
            ProviderError::UnsupportedInterval(width) => {
                FeedError::InvalidConfig(format!("unsupported bucket width: {width}s"))
            }
            other => FeedError::UpstreamFetch(other.to_string()),
        }
    }

    /// Failure of a call against a candle table.
    pub fn into_storage(self, table: &str) -> FeedError {
        match self {
            ProviderError::Config(msg) => FeedError::ConfigMissing(msg),
            other => FeedError::storage(table, other.to_string()),
        }
    }
}

/// Turn a non-success response into an `Api` or `RateLimited` error.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(ProviderError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Api {
            status,
            message: body,
        });
    }

    Ok(response)
}
