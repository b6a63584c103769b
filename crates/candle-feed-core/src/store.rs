use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::candle::Candle;
use crate::error::FeedError;

/// Persistent home of the per-timeframe candle tables.
///
/// Every table is keyed by `(bucket_start, symbol)`. Reads return candles in
/// ascending `bucket_start` order.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Backend name (for logging/display).
    fn name(&self) -> &str;

    /// Insert or replace candles on `(bucket_start, symbol)`.
    async fn upsert(&self, table: &str, candles: &[Candle]) -> Result<(), FeedError>;

    /// Most recent candle by `bucket_start`, if any.
    async fn select_latest(&self, table: &str, symbol: &str) -> Result<Option<Candle>, FeedError>;

    /// The newest `limit` candles, returned oldest first.
    async fn select_recent(
        &self,
        table: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;

    /// Candles with `from <= bucket_start <= to`.
    async fn select_range(
        &self,
        table: &str,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, FeedError>;

    async fn count(&self, table: &str, symbol: &str) -> Result<u64, FeedError>;

    /// `bucket_start` of the candle at `rank` from the newest (0 is the
    /// newest), or `None` if the table holds `rank` candles or fewer.
    ///
    /// The default reads the newest `rank + 1` rows and reports `None` when
    /// the backend returns fewer, so a row-capped backend never yields a
    /// cutoff inside the window. Backends with a cheap offset query should
    /// override it.
    async fn bucket_at_rank(
        &self,
        table: &str,
        symbol: &str,
        rank: usize,
    ) -> Result<Option<i64>, FeedError> {
        let recent = self.select_recent(table, symbol, rank.saturating_add(1)).await?;
        if recent.len() <= rank {
            return Ok(None);
        }
        Ok(recent.first().map(|c| c.bucket_start))
    }

    /// Delete candles strictly older than `bucket_start`. Returns the number removed.
    async fn delete_older_than(
        &self,
        table: &str,
        symbol: &str,
        bucket_start: i64,
    ) -> Result<u64, FeedError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), FeedError> {
        Ok(())
    }
}

type Series = BTreeMap<i64, Candle>;

/// In-process store, used for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<(String, String), Series>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(table: &str) -> FeedError {
        FeedError::storage(table, "memory store lock poisoned")
    }

    fn read<T>(
        &self,
        table: &str,
        symbol: &str,
        f: impl FnOnce(Option<&Series>) -> T,
    ) -> Result<T, FeedError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned(table))?;
        Ok(f(tables.get(&(table.to_string(), symbol.to_string()))))
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, table: &str, candles: &[Candle]) -> Result<(), FeedError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned(table))?;
        for candle in candles {
            tables
                .entry((table.to_string(), candle.symbol.clone()))
                .or_default()
                .insert(candle.bucket_start, candle.clone());
        }
        Ok(())
    }

    async fn select_latest(&self, table: &str, symbol: &str) -> Result<Option<Candle>, FeedError> {
        self.read(table, symbol, |series| {
            series.and_then(|s| s.values().next_back().cloned())
        })
    }

    async fn select_recent(
        &self,
        table: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        self.read(table, symbol, |series| {
            let Some(series) = series else {
                return Vec::new();
            };
            let skip = series.len().saturating_sub(limit);
            series.values().skip(skip).cloned().collect()
        })
    }

    async fn select_range(
        &self,
        table: &str,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.read(table, symbol, |series| {
            series
                .map(|s| s.range(from..=to).map(|(_, c)| c.clone()).collect())
                .unwrap_or_default()
        })
    }

    async fn count(&self, table: &str, symbol: &str) -> Result<u64, FeedError> {
        self.read(table, symbol, |series| {
            series.map(|s| s.len() as u64).unwrap_or(0)
        })
    }

    async fn bucket_at_rank(
        &self,
        table: &str,
        symbol: &str,
        rank: usize,
    ) -> Result<Option<i64>, FeedError> {
        self.read(table, symbol, |series| {
            series.and_then(|s| s.keys().rev().nth(rank).copied())
        })
    }

    async fn delete_older_than(
        &self,
        table: &str,
        symbol: &str,
        bucket_start: i64,
    ) -> Result<u64, FeedError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned(table))?;
        let Some(series) = tables.get_mut(&(table.to_string(), symbol.to_string())) else {
            return Ok(0);
        };
        let kept = series.split_off(&bucket_start);
        let removed = series.len() as u64;
        *series = kept;
        Ok(removed)
    }
}
