use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV candle for one timeframe bucket.
///
/// `bucket_start` is epoch seconds aligned to the timeframe width. Within one
/// timeframe table a candle is identified by `(bucket_start, symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_start: i64,
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Whether high/low bracket open/close and prices are positive.
    pub fn is_consistent(&self) -> bool {
        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);
        self.low > Decimal::ZERO
            && self.low <= body_low
            && self.high >= body_high
            && self.volume >= Decimal::ZERO
    }
}
