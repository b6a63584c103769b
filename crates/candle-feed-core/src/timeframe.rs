use std::collections::HashSet;

use serde::Serialize;

use crate::error::FeedError;

/// Start of the bucket of width `width_secs` that contains `now`.
///
/// Uses Euclidean division so pre-epoch timestamps still align downward.
pub fn bucket_start(now: i64, width_secs: i64) -> Result<i64, FeedError> {
    if width_secs <= 0 {
        return Err(FeedError::InvalidConfig(format!(
            "bucket width must be a positive number of seconds, got {width_secs}"
        )));
    }
    now.div_euclid(width_secs)
        .checked_mul(width_secs)
        .ok_or_else(|| FeedError::InvalidConfig(format!("timestamp {now} out of range")))
}

/// Number of `width_secs` buckets between two aligned bucket starts,
/// inclusive. `None` if `last < first` or the span overflows.
pub fn bucket_count(first: i64, last: i64, width_secs: i64) -> Option<u64> {
    let span = last.checked_sub(first)?;
    if span < 0 || width_secs <= 0 {
        return None;
    }
    u64::try_from(span / width_secs).ok()?.checked_add(1)
}

/// Static description of one timeframe series and the table it is stored in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeframeConfig {
    pub name: String,
    pub bucket_width_secs: i64,
    pub retention_count: usize,
    pub table: String,
    /// Relative price range of a synthetic bar in this timeframe.
    pub volatility: f64,
}

impl TimeframeConfig {
    pub fn new(name: &str, bucket_width_secs: i64, retention_count: usize, table: &str) -> Self {
        Self {
            name: name.to_string(),
            bucket_width_secs,
            retention_count,
            table: table.to_string(),
            volatility: default_volatility(bucket_width_secs),
        }
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }

    /// The four series served by default: 4H, 1H, 15min and 1min.
    pub fn defaults() -> Vec<TimeframeConfig> {
        vec![
            TimeframeConfig::new("4H", 4 * 3600, 100, "candles_4h"),
            TimeframeConfig::new("1H", 3600, 168, "candles_1h"),
            TimeframeConfig::new("15min", 15 * 60, 200, "candles_15min"),
            TimeframeConfig::new("1min", 60, 1440, "candles_1min"),
        ]
    }

    pub fn bucket_start(&self, now: i64) -> Result<i64, FeedError> {
        bucket_start(now, self.bucket_width_secs)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.name.trim().is_empty() {
            return Err(FeedError::InvalidConfig("timeframe name is empty".into()));
        }
        if self.table.trim().is_empty() {
            return Err(FeedError::InvalidConfig(format!(
                "timeframe {} has no table",
                self.name
            )));
        }
        if self.bucket_width_secs <= 0 {
            return Err(FeedError::InvalidConfig(format!(
                "timeframe {} has non-positive bucket width {}",
                self.name, self.bucket_width_secs
            )));
        }
        if self.retention_count == 0 {
            return Err(FeedError::InvalidConfig(format!(
                "timeframe {} must retain at least one candle",
                self.name
            )));
        }
        if !(0.0..1.0).contains(&self.volatility) {
            return Err(FeedError::InvalidConfig(format!(
                "timeframe {} volatility {} outside [0, 1)",
                self.name, self.volatility
            )));
        }
        Ok(())
    }
}

/// Volatility grows linearly with the bucket width in minutes.
fn default_volatility(bucket_width_secs: i64) -> f64 {
    (bucket_width_secs as f64 / 60.0 * 0.001).clamp(0.0, 0.5)
}

/// Validate every timeframe and reject duplicate names or tables.
pub fn validate_timeframes(timeframes: &[TimeframeConfig]) -> Result<(), FeedError> {
    if timeframes.is_empty() {
        return Err(FeedError::InvalidConfig("no timeframes configured".into()));
    }

    let mut names = HashSet::new();
    let mut tables = HashSet::new();
    for tf in timeframes {
        tf.validate()?;
        if !names.insert(tf.name.to_ascii_lowercase()) {
            return Err(FeedError::InvalidConfig(format!(
                "duplicate timeframe name {}",
                tf.name
            )));
        }
        if !tables.insert(tf.table.as_str()) {
            return Err(FeedError::InvalidConfig(format!(
                "duplicate timeframe table {}",
                tf.table
            )));
        }
    }
    Ok(())
}

/// Look up a timeframe by name, case-insensitively.
pub fn find<'a>(timeframes: &'a [TimeframeConfig], name: &str) -> Option<&'a TimeframeConfig> {
    timeframes.iter().find(|tf| tf.name.eq_ignore_ascii_case(name))
}

/// Aligned buckets in the inclusive range `[from, to]` not present in `existing`.
/// `from` and `to` must already be aligned to `width_secs`.
pub fn missing_buckets(existing: &[i64], from: i64, to: i64, width_secs: i64) -> Vec<i64> {
    if width_secs <= 0 || from > to {
        return Vec::new();
    }
    let present: HashSet<i64> = existing.iter().copied().collect();
    let mut missing = Vec::new();
    let mut current = from;
    while current <= to {
        if !present.contains(&current) {
            missing.push(current);
        }
        current += width_secs;
    }
    missing
}

/// Group sorted buckets into runs of consecutive buckets, returned as
/// inclusive `(first, last)` pairs.
pub fn contiguous_runs(buckets: &[i64], width_secs: i64) -> Vec<(i64, i64)> {
    if buckets.is_empty() {
        return Vec::new();
    }

    let mut runs = Vec::new();
    let mut run_start = buckets[0];
    let mut prev = buckets[0];

    for &bucket in &buckets[1..] {
        if bucket - prev != width_secs {
            runs.push((run_start, prev));
            run_start = bucket;
        }
        prev = bucket;
    }
    runs.push((run_start, prev));
    runs
}
