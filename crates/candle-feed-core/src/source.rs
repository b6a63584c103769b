use std::sync::Mutex;

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::FeedError;
use crate::synth::CandleSynthesizer;
use crate::timeframe::TimeframeConfig;

/// Where new candles come from: the synthetic generator or a market-data API.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Source name (for logging/display).
    fn name(&self) -> &str;

    /// True when a candle for the still-open bucket is partial and later
    /// fetches of that bucket return revised values. Synthetic bars are final.
    fn revises_open_bucket(&self) -> bool {
        false
    }

    /// Produce the candle for one bucket. `previous_close` is the close of the
    /// stored bucket before it, when one exists.
    async fn fetch_or_synthesize(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        bucket_start: i64,
        previous_close: Option<Decimal>,
    ) -> Result<Candle, FeedError>;

    /// Produce `count` consecutive candles ending at `end_bucket`, oldest first.
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        end_bucket: i64,
        count: usize,
        previous_close: Option<Decimal>,
    ) -> Result<Vec<Candle>, FeedError> {
        let width = timeframe.bucket_width_secs;
        let first = end_bucket - (count as i64 - 1) * width;
        let mut candles = Vec::with_capacity(count);
        let mut close = previous_close;
        for i in 0..count as i64 {
            let candle = self
                .fetch_or_synthesize(symbol, timeframe, first + i * width, close)
                .await?;
            close = Some(candle.close);
            candles.push(candle);
        }
        Ok(candles)
    }
}

/// Default source: a bounded random walk. Output is placeholder data.
pub struct SyntheticSource {
    synthesizer: CandleSynthesizer,
    base_price: Decimal,
    rng: Mutex<StdRng>,
}

impl SyntheticSource {
    /// `base_price` seeds the walk when a table has no history yet.
    pub fn new(synthesizer: CandleSynthesizer, base_price: Decimal) -> Self {
        Self {
            synthesizer,
            base_price,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic source for reproducible runs.
    pub fn seeded(synthesizer: CandleSynthesizer, base_price: Decimal, seed: u64) -> Self {
        Self {
            synthesizer,
            base_price,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> Result<T, FeedError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| FeedError::InvalidData("synthetic rng lock poisoned".into()))?;
        Ok(f(&mut rng))
    }
}

#[async_trait]
impl DataSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn fetch_or_synthesize(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        bucket_start: i64,
        previous_close: Option<Decimal>,
    ) -> Result<Candle, FeedError> {
        let base = previous_close.unwrap_or(self.base_price);
        self.with_rng(|rng| {
            self.synthesizer
                .synthesize(rng, symbol, bucket_start, base, timeframe.volatility)
        })
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        end_bucket: i64,
        count: usize,
        previous_close: Option<Decimal>,
    ) -> Result<Vec<Candle>, FeedError> {
        let base = previous_close.unwrap_or(self.base_price);
        self.with_rng(|rng| {
            self.synthesizer.synthesize_series(
                rng,
                symbol,
                end_bucket,
                count,
                timeframe.bucket_width_secs,
                base,
                timeframe.volatility,
            )
        })
    }
}
