use tracing::{debug, warn};

use crate::error::FeedError;
use crate::store::CandleStore;
use crate::timeframe::TimeframeConfig;

/// Keep only the newest `retention_count` candles of a timeframe table.
///
/// The cutoff is the bucket at rank `retention_count - 1` from the newest;
/// only buckets strictly older than it are deleted, so the newest bucket
/// always survives. Returns the number of deleted candles.
pub async fn trim(
    store: &dyn CandleStore,
    timeframe: &TimeframeConfig,
    symbol: &str,
) -> Result<u64, FeedError> {
    let table = timeframe.table.as_str();
    let count = store.count(table, symbol).await?;
    if count <= timeframe.retention_count as u64 {
        return Ok(0);
    }

    let rank = timeframe.retention_count.saturating_sub(1);
    let Some(cutoff) = store.bucket_at_rank(table, symbol, rank).await? else {
        warn!(
            table,
            symbol,
            count,
            "store returned no cutoff inside retention window, skipping trim"
        );
        return Ok(0);
    };

    let removed = store.delete_older_than(table, symbol, cutoff).await?;
    debug!(
        table,
        symbol,
        cutoff,
        removed,
        "trimmed candles outside retention window"
    );
    Ok(removed)
}
