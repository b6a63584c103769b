use std::time::Duration;

use async_trait::async_trait;
use candle_feed_core::candle::Candle;
use candle_feed_core::error::FeedError;
use candle_feed_core::source::DataSource;
use candle_feed_core::timeframe::TimeframeConfig;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::{ProviderError, check_status};

const BINANCE_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";

/// Binance caps a single klines request at this many rows.
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Real candles from the Binance public klines endpoint. No authentication.
pub struct BinanceSource {
    client: Client,
    base_url: String,
}

impl BinanceSource {
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_base_url(BINANCE_KLINES_URL.to_string(), timeout)
    }

    /// Create with a custom klines URL (for testing).
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url,
        })
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let mut request = self.client.get(&self.base_url).query(&[
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ]);
        if let Some(start) = start_ms {
            request = request.query(&[("startTime", start.to_string())]);
        }
        if let Some(end) = end_ms {
            request = request.query(&[("endTime", end.to_string())]);
        }

        let response = check_status(request.send().await?).await?;
        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("failed to parse klines: {e}")))?;

        rows.iter().map(|row| parse_kline(symbol, row)).collect()
    }

    /// Page backwards from `end_bucket` until `count` klines are collected or
    /// the exchange runs out of history.
    async fn fetch_klines_ending_at(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        end_bucket: i64,
        count: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let interval = interval_for(timeframe.bucket_width_secs)?;
        let mut end_ms = (end_bucket + timeframe.bucket_width_secs) * 1000 - 1;
        let mut pages: Vec<Vec<Candle>> = Vec::new();
        let mut remaining = count;

        while remaining > 0 {
            let limit = remaining.min(MAX_KLINES_PER_REQUEST);
            let page = self
                .fetch_klines(symbol, interval, None, Some(end_ms), limit)
                .await?;
            let Some(first) = page.first() else {
                break;
            };
            end_ms = first.bucket_start * 1000 - 1;
            remaining = remaining.saturating_sub(page.len());
            let short = page.len() < limit;
            pages.push(page);
            if short {
                break;
            }
        }

        let mut candles: Vec<Candle> = pages.into_iter().rev().flatten().collect();
        candles.sort_by_key(|c| c.bucket_start);
        candles.dedup_by_key(|c| c.bucket_start);
        Ok(candles)
    }
}

/// Binance interval code for a bucket width.
pub fn interval_for(width_secs: i64) -> Result<&'static str, ProviderError> {
    match width_secs {
        60 => Ok("1m"),
        180 => Ok("3m"),
        300 => Ok("5m"),
        900 => Ok("15m"),
        1800 => Ok("30m"),
        3600 => Ok("1h"),
        7200 => Ok("2h"),
        14400 => Ok("4h"),
        21600 => Ok("6h"),
        43200 => Ok("12h"),
        86400 => Ok("1d"),
        other => Err(ProviderError::UnsupportedInterval(other)),
    }
}

fn decimal_field(row: &[Value], index: usize, name: &str) -> Result<Decimal, ProviderError> {
    let value = row
        .get(index)
        .ok_or_else(|| ProviderError::Parse(format!("kline missing {name}")))?;
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|e| ProviderError::Parse(format!("invalid {name} '{s}': {e}"))),
        Value::Number(n) => n
            .to_string()
            .parse()
            .map_err(|e| ProviderError::Parse(format!("invalid {name} '{n}': {e}"))),
        other => Err(ProviderError::Parse(format!("invalid {name}: {other}"))),
    }
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_kline(symbol: &str, row: &[Value]) -> Result<Candle, ProviderError> {
    let open_time_ms = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| ProviderError::Parse("kline missing open time".into()))?;

    Ok(Candle {
        bucket_start: open_time_ms.div_euclid(1000),
        symbol: symbol.to_string(),
        open: decimal_field(row, 1, "open")?,
        high: decimal_field(row, 2, "high")?,
        low: decimal_field(row, 3, "low")?,
        close: decimal_field(row, 4, "close")?,
        volume: decimal_field(row, 5, "volume")?,
    })
}

#[async_trait]
impl DataSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    /// The newest kline is the live one; its close and volume keep moving
    /// until the interval ends.
    fn revises_open_bucket(&self) -> bool {
        true
    }

    async fn fetch_or_synthesize(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        bucket_start: i64,
        _previous_close: Option<Decimal>,
    ) -> Result<Candle, FeedError> {
        let interval =
            interval_for(timeframe.bucket_width_secs).map_err(ProviderError::into_upstream)?;
        let klines = self
            .fetch_klines(symbol, interval, Some(bucket_start * 1000), None, 1)
            .await
            .map_err(ProviderError::into_upstream)?;

        klines
            .into_iter()
            .find(|c| c.bucket_start == bucket_start)
            .ok_or_else(|| {
                ProviderError::NoData {
                    symbol: symbol.to_string(),
                    bucket_start,
                }
                .into_upstream()
            })
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: &TimeframeConfig,
        end_bucket: i64,
        count: usize,
        _previous_close: Option<Decimal>,
    ) -> Result<Vec<Candle>, FeedError> {
        self.fetch_klines_ending_at(symbol, timeframe, end_bucket, count)
            .await
            .map_err(ProviderError::into_upstream)
    }
}
