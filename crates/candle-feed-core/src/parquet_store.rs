use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::candle::Candle;
use crate::error::FeedError;
use crate::schema;
use crate::store::CandleStore;

/// Filesystem-backed candle store in Parquet format.
///
/// Directory layout: `{root}/data/{table}/{SYMBOL}.parquet`. Each file holds the
/// whole series for one table and symbol, sorted by `bucket_start`; writes
/// rewrite the file. File I/O runs on the blocking thread pool; the
/// synchronous helpers (`read_series`, `write_series`) block the caller.
#[derive(Clone)]
pub struct ParquetStore {
    data_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ParquetStore {
    /// Create a store rooted at the given directory.
    /// The `data/` subdirectory is used automatically.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            data_dir: root.as_ref().join("data"),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Path to the Parquet file for a table and symbol.
    pub fn file_path(&self, table: &str, symbol: &str) -> PathBuf {
        self.data_dir.join(table).join(format!("{symbol}.parquet"))
    }

    pub fn has_data(&self, table: &str, symbol: &str) -> bool {
        self.file_path(table, symbol).exists()
    }

    /// Read the full series for a table and symbol. Missing files read as empty.
    pub fn read_series(&self, table: &str, symbol: &str) -> Result<Vec<Candle>, FeedError> {
        let path = self.file_path(table, symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut candles = schema::read_parquet(&path)?;
        candles.sort_by_key(|c| c.bucket_start);
        Ok(candles)
    }

    /// Replace the series for a table and symbol.
    /// Creates parent directories as needed.
    pub fn write_series(
        &self,
        table: &str,
        symbol: &str,
        candles: &[Candle],
    ) -> Result<(), FeedError> {
        let path = self.file_path(table, symbol);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        schema::write_parquet(&path, candles)
    }

    /// Read-modify-write under the store's write lock.
    fn modify<T>(
        &self,
        table: &str,
        symbol: &str,
        f: impl FnOnce(&mut BTreeMap<i64, Candle>) -> T,
    ) -> Result<T, FeedError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| FeedError::storage(table, "parquet store lock poisoned"))?;

        let mut series: BTreeMap<i64, Candle> = self
            .read_series(table, symbol)?
            .into_iter()
            .map(|c| (c.bucket_start, c))
            .collect();
        let result = f(&mut series);
        let candles: Vec<Candle> = series.into_values().collect();
        self.write_series(table, symbol, &candles)?;
        Ok(result)
    }

    /// Run `f` against a clone of the store on the blocking thread pool.
    async fn blocking<T, F>(&self, table: &str, f: F) -> Result<T, FeedError>
    where
        T: Send + 'static,
        F: FnOnce(&ParquetStore) -> Result<T, FeedError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| FeedError::storage(table, format!("parquet task failed: {e}")))?
    }

    /// Full series read off the runtime threads.
    async fn series(&self, table: &str, symbol: &str) -> Result<Vec<Candle>, FeedError> {
        let (t, s) = (table.to_string(), symbol.to_string());
        self.blocking(table, move |store| store.read_series(&t, &s))
            .await
    }
}

#[async_trait]
impl CandleStore for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn upsert(&self, table: &str, candles: &[Candle]) -> Result<(), FeedError> {
        let mut by_symbol: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            by_symbol
                .entry(candle.symbol.clone())
                .or_default()
                .push(candle.clone());
        }

        let t = table.to_string();
        self.blocking(table, move |store| {
            for (symbol, group) in by_symbol {
                store.modify(&t, &symbol, |series| {
                    for candle in group {
                        series.insert(candle.bucket_start, candle);
                    }
                })?;
            }
            Ok(())
        })
        .await
    }

    async fn select_latest(&self, table: &str, symbol: &str) -> Result<Option<Candle>, FeedError> {
        Ok(self.series(table, symbol).await?.pop())
    }

    async fn select_recent(
        &self,
        table: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let mut candles = self.series(table, symbol).await?;
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.split_off(skip))
    }

    async fn select_range(
        &self,
        table: &str,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        Ok(self
            .series(table, symbol)
            .await?
            .into_iter()
            .filter(|c| c.bucket_start >= from && c.bucket_start <= to)
            .collect())
    }

    async fn count(&self, table: &str, symbol: &str) -> Result<u64, FeedError> {
        Ok(self.series(table, symbol).await?.len() as u64)
    }

    async fn bucket_at_rank(
        &self,
        table: &str,
        symbol: &str,
        rank: usize,
    ) -> Result<Option<i64>, FeedError> {
        let series = self.series(table, symbol).await?;
        Ok(series.iter().rev().nth(rank).map(|c| c.bucket_start))
    }

    async fn delete_older_than(
        &self,
        table: &str,
        symbol: &str,
        bucket_start: i64,
    ) -> Result<u64, FeedError> {
        let (t, s) = (table.to_string(), symbol.to_string());
        self.blocking(table, move |store| {
            if !store.has_data(&t, &s) {
                return Ok(0);
            }
            store.modify(&t, &s, |series| {
                let kept = series.split_off(&bucket_start);
                let removed = series.len() as u64;
                *series = kept;
                removed
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), FeedError> {
        self.blocking("data dir", |store| {
            std::fs::create_dir_all(&store.data_dir)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_candle(bucket_start: i64) -> Candle {
        Candle {
            bucket_start,
            symbol: "BTCUSDT".to_string(),
            open: dec!(95000.00),
            high: dec!(95100.00),
            low: dec!(94900.00),
            close: dec!(95050.00),
            volume: dec!(1000),
        }
    }

    #[test]
    fn file_path_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let path = store.file_path("candles_1h", "BTCUSDT");
        let expected = dir.path().join("data/candles_1h/BTCUSDT.parquet");
        assert_eq!(path, expected);
    }

    #[test]
    fn has_data_false_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        assert!(!store.has_data("candles_1h", "BTCUSDT"));
        assert!(store.read_series("candles_1h", "BTCUSDT").unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_creates_directories_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());

        store
            .upsert("candles_1h", &[make_candle(3600), make_candle(7200)])
            .await
            .unwrap();
        assert!(dir.path().join("data/candles_1h").exists());

        let mut replaced = make_candle(7200);
        replaced.close = dec!(96000.00);
        replaced.high = dec!(96000.00);
        store
            .upsert("candles_1h", &[replaced.clone(), make_candle(10800)])
            .await
            .unwrap();

        let series = store.read_series("candles_1h", "BTCUSDT").unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[1], replaced);
    }

    #[tokio::test]
    async fn upsert_same_batch_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let batch = vec![make_candle(60), make_candle(120)];

        store.upsert("candles_1min", &batch).await.unwrap();
        store.upsert("candles_1min", &batch).await.unwrap();

        assert_eq!(store.count("candles_1min", "BTCUSDT").await.unwrap(), 2);
        assert_eq!(store.read_series("candles_1min", "BTCUSDT").unwrap(), batch);
    }

    #[tokio::test]
    async fn reads_are_sorted_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store
            .upsert(
                "candles_1min",
                &[make_candle(300), make_candle(60), make_candle(180)],
            )
            .await
            .unwrap();

        let latest = store.select_latest("candles_1min", "BTCUSDT").await.unwrap();
        assert_eq!(latest.unwrap().bucket_start, 300);

        let recent = store.select_recent("candles_1min", "BTCUSDT", 2).await.unwrap();
        let buckets: Vec<i64> = recent.iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![180, 300]);

        let range = store
            .select_range("candles_1min", "BTCUSDT", 60, 180)
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
    }

    #[tokio::test]
    async fn delete_older_than_keeps_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let candles: Vec<Candle> = (1..=4).map(|i| make_candle(i * 60)).collect();
        store.upsert("candles_1min", &candles).await.unwrap();

        let removed = store
            .delete_older_than("candles_1min", "BTCUSDT", 180)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let series = store.read_series("candles_1min", "BTCUSDT").unwrap();
        assert_eq!(series.first().unwrap().bucket_start, 180);
        assert_eq!(
            store
                .delete_older_than("candles_4h", "BTCUSDT", 180)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn bucket_at_rank_reads_from_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let candles: Vec<Candle> = (1..=3).map(|i| make_candle(i * 3600)).collect();
        store.upsert("candles_1h", &candles).await.unwrap();

        assert_eq!(
            store.bucket_at_rank("candles_1h", "BTCUSDT", 0).await.unwrap(),
            Some(10800)
        );
        assert_eq!(
            store.bucket_at_rank("candles_1h", "BTCUSDT", 2).await.unwrap(),
            Some(3600)
        );
        assert_eq!(store.bucket_at_rank("candles_1h", "BTCUSDT", 3).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_upserts_from_clones_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());

        let mut handles = Vec::new();
        for i in 1..=8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert("candles_1min", &[make_candle(i * 60)]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.count("candles_1min", "BTCUSDT").await.unwrap(), 8);
    }
}
