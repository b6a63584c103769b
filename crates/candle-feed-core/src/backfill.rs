use serde::Serialize;
use tracing::info;

use crate::error::FeedError;
use crate::reconciler::Reconciler;
use crate::timeframe::{TimeframeConfig, bucket_count, contiguous_runs, missing_buckets};

/// Largest range one backfill call will plan, in buckets.
pub const MAX_BACKFILL_BUCKETS: u64 = 100_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Buckets in the requested range.
    pub buckets_in_range: usize,
    /// Buckets that were written.
    pub written: usize,
    /// Contiguous runs fetched or synthesized.
    pub runs: usize,
}

impl Reconciler {
    /// Fill the buckets between `from` and `to` (epoch seconds, inclusive) for
    /// one timeframe. Existing buckets are left alone unless `force` is set.
    /// Each run of missing buckets continues the walk from the stored bucket
    /// before it. Store calls run under the store timeout.
    pub async fn backfill_range(
        &self,
        timeframe: &TimeframeConfig,
        from: i64,
        to: i64,
        force: bool,
    ) -> Result<BackfillReport, FeedError> {
        timeframe.validate()?;
        let symbol = self.symbol();
        let store = self.store();
        let width = timeframe.bucket_width_secs;
        let table = timeframe.table.as_str();
        let first = timeframe.bucket_start(from)?;
        let last = timeframe.bucket_start(to)?;
        if first > last {
            return Err(FeedError::InvalidConfig(format!(
                "backfill range start {from} is after end {to}"
            )));
        }

        let buckets_in_range = bucket_count(first, last, width)
            .filter(|&n| n <= MAX_BACKFILL_BUCKETS)
            .ok_or_else(|| {
                FeedError::InvalidConfig(format!(
                    "backfill range {from}..{to} spans more than {MAX_BACKFILL_BUCKETS} {} buckets",
                    timeframe.name
                ))
            })? as usize;

        let existing: Vec<i64> = if force {
            Vec::new()
        } else {
            self.bounded(
                &format!("select range from {table}"),
                store.select_range(table, symbol, first, last),
            )
            .await?
            .iter()
            .map(|c| c.bucket_start)
            .collect()
        };

        let missing = missing_buckets(&existing, first, last, width);
        if missing.is_empty() {
            info!(
                "{symbol} {}: all {buckets_in_range} bucket(s) present, skipping",
                timeframe.name
            );
            return Ok(BackfillReport {
                buckets_in_range,
                ..Default::default()
            });
        }

        let runs = contiguous_runs(&missing, width);
        info!(
            "{symbol} {}: {} missing bucket(s) in {} run(s)",
            timeframe.name,
            missing.len(),
            runs.len()
        );

        let mut written = 0;
        for &(run_start, run_end) in &runs {
            let before = run_start - width;
            let previous_close = self
                .bounded(
                    &format!("select range from {table}"),
                    store.select_range(table, symbol, before, before),
                )
                .await?
                .pop()
                .map(|c| c.close);
            let count = ((run_end - run_start) / width + 1) as usize;

            let candles = self
                .source()
                .fetch_series(symbol, timeframe, run_end, count, previous_close)
                .await?;
            self.bounded(&format!("upsert into {table}"), store.upsert(table, &candles))
                .await?;
            written += candles.len();
            info!(
                "{symbol} {}: {run_start} to {run_end}: wrote {} candle(s)",
                timeframe.name,
                candles.len()
            );
        }

        Ok(BackfillReport {
            buckets_in_range,
            written,
            runs: runs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::candle::Candle;
    use crate::source::SyntheticSource;
    use crate::store::{CandleStore, MemoryStore};
    use crate::synth::CandleSynthesizer;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    fn tf() -> TimeframeConfig {
        TimeframeConfig::new("1min", 60, 1440, "candles_1min")
    }

    fn reconciler(store: Arc<dyn CandleStore>) -> Reconciler {
        let source = Arc::new(SyntheticSource::seeded(
            CandleSynthesizer::default(),
            dec!(95000),
            3,
        ));
        Reconciler::new(store, source, "BTCUSDT", vec![tf()]).unwrap()
    }

    fn make_candle(bucket_start: i64) -> Candle {
        Candle {
            bucket_start,
            symbol: "BTCUSDT".to_string(),
            open: dec!(100.00),
            high: dec!(101.00),
            low: dec!(99.00),
            close: dec!(100.50),
            volume: dec!(10),
        }
    }

    #[tokio::test]
    async fn fills_empty_range() {
        let store = Arc::new(MemoryStore::new());
        let report = reconciler(store.clone())
            .backfill_range(&tf(), 0, 599, false)
            .await
            .unwrap();

        assert_eq!(report.buckets_in_range, 10);
        assert_eq!(report.written, 10);
        assert_eq!(report.runs, 1);
        assert_eq!(store.count("candles_1min", "BTCUSDT").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn skips_existing_buckets() {
        let store = Arc::new(MemoryStore::new());
        let existing = make_candle(180);
        store.upsert("candles_1min", &[existing.clone()]).await.unwrap();

        let report = reconciler(store.clone())
            .backfill_range(&tf(), 0, 300, false)
            .await
            .unwrap();

        assert_eq!(report.written, 5);
        assert_eq!(report.runs, 2);
        let kept = store.select_range("candles_1min", "BTCUSDT", 180, 180).await.unwrap();
        assert_eq!(kept, vec![existing]);
    }

    #[tokio::test]
    async fn run_continues_from_previous_close() {
        let store = Arc::new(MemoryStore::new());
        store.upsert("candles_1min", &[make_candle(0)]).await.unwrap();

        reconciler(store.clone())
            .backfill_range(&tf(), 60, 60, false)
            .await
            .unwrap();

        let added = store.select_latest("candles_1min", "BTCUSDT").await.unwrap().unwrap();
        // 1min volatility is 0.001: open stays within a few cents of 100.50.
        assert!((added.open - dec!(100.50)).abs() <= dec!(0.06));
    }

    #[tokio::test]
    async fn force_overwrites_everything() {
        let store = Arc::new(MemoryStore::new());
        store.upsert("candles_1min", &[make_candle(60)]).await.unwrap();

        let report = reconciler(store.clone())
            .backfill_range(&tf(), 0, 120, true)
            .await
            .unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.runs, 1);
        assert_eq!(store.count("candles_1min", "BTCUSDT").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn complete_range_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert("candles_1min", &[make_candle(0), make_candle(60)])
            .await
            .unwrap();

        let report = reconciler(store.clone())
            .backfill_range(&tf(), 0, 60, false)
            .await
            .unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.runs, 0);
    }

    #[tokio::test]
    async fn inverted_range_is_invalid() {
        let store = Arc::new(MemoryStore::new());
        let err = reconciler(store.clone())
            .backfill_range(&tf(), 600, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn oversized_range_is_rejected_before_reading() {
        let store = Arc::new(MemoryStore::new());
        let span = 60 * MAX_BACKFILL_BUCKETS as i64;
        let err = reconciler(store.clone())
            .backfill_range(&tf(), 0, span, false)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidConfig(_)));

        let err = reconciler(store.clone())
            .backfill_range(&tf(), i64::MIN / 2, i64::MAX / 2, true)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidConfig(_)));
        assert_eq!(store.count("candles_1min", "BTCUSDT").await.unwrap(), 0);
    }

    /// Hangs on every upsert.
    struct StuckWrites(MemoryStore);

    #[async_trait]
    impl CandleStore for StuckWrites {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn upsert(&self, _: &str, _: &[Candle]) -> Result<(), FeedError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }

        async fn select_latest(
            &self,
            table: &str,
            symbol: &str,
        ) -> Result<Option<Candle>, FeedError> {
            self.0.select_latest(table, symbol).await
        }

        async fn select_recent(
            &self,
            table: &str,
            symbol: &str,
            limit: usize,
        ) -> Result<Vec<Candle>, FeedError> {
            self.0.select_recent(table, symbol, limit).await
        }

        async fn select_range(
            &self,
            table: &str,
            symbol: &str,
            from: i64,
            to: i64,
        ) -> Result<Vec<Candle>, FeedError> {
            self.0.select_range(table, symbol, from, to).await
        }

        async fn count(&self, table: &str, symbol: &str) -> Result<u64, FeedError> {
            self.0.count(table, symbol).await
        }

        async fn delete_older_than(
            &self,
            table: &str,
            symbol: &str,
            bucket_start: i64,
        ) -> Result<u64, FeedError> {
            self.0.delete_older_than(table, symbol, bucket_start).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_store_write_times_out() {
        let rec = reconciler(Arc::new(StuckWrites(MemoryStore::new())))
            .with_store_timeout(Duration::from_secs(3));

        let err = rec.backfill_range(&tf(), 0, 120, false).await.unwrap_err();
        assert!(matches!(err, FeedError::Timeout { secs: 3, .. }));
    }
}
