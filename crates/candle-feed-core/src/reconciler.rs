use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::candle::Candle;
use crate::error::FeedError;
use crate::retention;
use crate::source::DataSource;
use crate::store::CandleStore;
use crate::timeframe::{TimeframeConfig, validate_timeframes};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a timeframe table needs, given its latest stored bucket and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Table is empty: write `count` buckets ending at `end_bucket`.
    NeedsBackfill { end_bucket: i64, count: usize },
    /// Table is behind: write buckets `from_bucket..=to_bucket`.
    NeedsAppend {
        from_bucket: i64,
        to_bucket: i64,
        missing: usize,
    },
    /// Latest stored bucket already covers the current one.
    UpToDate { bucket: i64 },
}

/// Decide what a timeframe table needs at `now`.
///
/// Missing buckets after downtime are filled in one go, capped at the
/// retention window. A stored bucket ahead of the clock counts as up to date.
pub fn plan(
    latest_stored_bucket: Option<i64>,
    now: i64,
    timeframe: &TimeframeConfig,
) -> Result<SyncState, FeedError> {
    let current = timeframe.bucket_start(now)?;
    let width = timeframe.bucket_width_secs;

    let Some(latest) = latest_stored_bucket else {
        return Ok(SyncState::NeedsBackfill {
            end_bucket: current,
            count: timeframe.retention_count,
        });
    };

    if current <= latest {
        return Ok(SyncState::UpToDate { bucket: latest });
    }

    let behind = ((current - latest) / width).max(1) as usize;
    let missing = behind.min(timeframe.retention_count);
    Ok(SyncState::NeedsAppend {
        from_bucket: current - (missing as i64 - 1) * width,
        to_bucket: current,
        missing,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Backfilled,
    Appended,
    /// The open bucket was fetched again from a revising source.
    Refreshed,
    UpToDate,
}

/// Result of reconciling one timeframe.
#[derive(Debug, Clone, Serialize)]
pub struct TimeframeReport {
    pub action: SyncAction,
    pub written: Vec<Candle>,
    pub trimmed: u64,
}

impl TimeframeReport {
    pub fn summary(&self) -> String {
        let n = self.written.len();
        let noun = if n == 1 { "candle" } else { "candles" };
        let mut summary = match self.action {
            SyncAction::Backfilled => format!("Backfilled {n} {noun}"),
            SyncAction::Appended => format!("Appended {n} {noun}"),
            SyncAction::Refreshed => format!("Refreshed {n} open {noun}"),
            SyncAction::UpToDate => "Up to date".to_string(),
        };
        if self.trimmed > 0 {
            summary.push_str(&format!(", trimmed {}", self.trimmed));
        }
        summary
    }
}

/// Per-timeframe entry of a pass. Failures are kept as strings so one
/// timeframe's error never hides the others.
#[derive(Debug, Clone, Serialize)]
pub struct TimeframeOutcome {
    pub timeframe: String,
    pub table: String,
    pub message: String,
    pub error: Option<String>,
    pub written: Vec<Candle>,
}

impl TimeframeOutcome {
    fn from_result(
        timeframe: &TimeframeConfig,
        result: Result<TimeframeReport, FeedError>,
    ) -> Self {
        match result {
            Ok(report) => Self {
                timeframe: timeframe.name.clone(),
                table: timeframe.table.clone(),
                message: report.summary(),
                error: None,
                written: report.written,
            },
            Err(e) => Self {
                timeframe: timeframe.name.clone(),
                table: timeframe.table.clone(),
                message: format!("Error: {e}"),
                error: Some(e.to_string()),
                written: Vec::new(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub now: i64,
    pub outcomes: Vec<TimeframeOutcome>,
}

impl PassReport {
    /// `"<timeframe>: <error>"` for every failed timeframe.
    pub fn errors(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.timeframe)))
            .collect()
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(TimeframeOutcome::is_ok)
    }
}

/// Keeps every timeframe table of one symbol current.
///
/// Built once at startup and shared by the HTTP handlers and the scheduler.
pub struct Reconciler {
    store: Arc<dyn CandleStore>,
    source: Arc<dyn DataSource>,
    symbol: String,
    timeframes: Vec<TimeframeConfig>,
    store_timeout: Duration,
    trim: bool,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CandleStore>,
        source: Arc<dyn DataSource>,
        symbol: impl Into<String>,
        timeframes: Vec<TimeframeConfig>,
    ) -> Result<Self, FeedError> {
        validate_timeframes(&timeframes)?;
        Ok(Self {
            store,
            source,
            symbol: symbol.into(),
            timeframes,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            trim: true,
        })
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Enable or disable retention trimming after writes.
    pub fn with_trim(mut self, trim: bool) -> Self {
        self.trim = trim;
        self
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframes(&self) -> &[TimeframeConfig] {
        &self.timeframes
    }

    /// Run a store call under the configured timeout.
    pub async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, FeedError>
    where
        F: Future<Output = Result<T, FeedError>>,
    {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| FeedError::Timeout {
                operation: operation.to_string(),
                secs: self.store_timeout.as_secs(),
            })?
    }

    /// Bring one timeframe table up to date at `now`.
    pub async fn reconcile_timeframe(
        &self,
        timeframe: &TimeframeConfig,
        now: i64,
    ) -> Result<TimeframeReport, FeedError> {
        let table = timeframe.table.as_str();
        let latest = self
            .bounded(
                &format!("select latest from {table}"),
                self.store.select_latest(table, &self.symbol),
            )
            .await?;

        let state = plan(latest.as_ref().map(|c| c.bucket_start), now, timeframe)?;
        debug!(timeframe = %timeframe.name, ?state, "planned reconciliation");

        let revises = self.source.revises_open_bucket();
        let current = timeframe.bucket_start(now)?;
        let (action, candles) = match state {
            SyncState::UpToDate { bucket } if revises && bucket == current => {
                let previous_close = latest.map(|c| c.close);
                let candles = self
                    .source
                    .fetch_series(&self.symbol, timeframe, bucket, 1, previous_close)
                    .await?;
                (SyncAction::Refreshed, candles)
            }
            SyncState::UpToDate { .. } => {
                return Ok(TimeframeReport {
                    action: SyncAction::UpToDate,
                    written: Vec::new(),
                    trimmed: 0,
                });
            }
            SyncState::NeedsBackfill { end_bucket, count } => {
                let candles = self
                    .source
                    .fetch_series(&self.symbol, timeframe, end_bucket, count, None)
                    .await?;
                (SyncAction::Backfilled, candles)
            }
            SyncState::NeedsAppend {
                from_bucket,
                to_bucket,
                missing,
            } => {
                let latest_bucket = latest.as_ref().map(|c| c.bucket_start);
                // the stored latest was written while still open; rewrite it
                // along with the new buckets when it sits right before them
                let count = if revises
                    && latest_bucket == Some(from_bucket - timeframe.bucket_width_secs)
                {
                    missing + 1
                } else {
                    missing
                };
                let previous_close = latest.map(|c| c.close);
                let candles = self
                    .source
                    .fetch_series(&self.symbol, timeframe, to_bucket, count, previous_close)
                    .await?;
                (SyncAction::Appended, candles)
            }
        };

        if !candles.is_empty() {
            self.bounded(
                &format!("upsert into {table}"),
                self.store.upsert(table, &candles),
            )
            .await?;
        }

        let trimmed = if self.trim && action != SyncAction::Refreshed && !candles.is_empty() {
            self.bounded(
                &format!("trim {table}"),
                retention::trim(self.store.as_ref(), timeframe, &self.symbol),
            )
            .await?
        } else {
            0
        };

        Ok(TimeframeReport {
            action,
            written: candles,
            trimmed,
        })
    }

    /// Reconcile every timeframe in order. A failure in one timeframe is
    /// recorded in its outcome and the pass moves on.
    pub async fn run_pass(&self, now: i64) -> PassReport {
        let mut outcomes = Vec::with_capacity(self.timeframes.len());

        for timeframe in &self.timeframes {
            let result = self.reconcile_timeframe(timeframe, now).await;
            match &result {
                Ok(report) => info!("{}: {}", timeframe.name, report.summary()),
                Err(e) if e.is_retryable() => {
                    warn!("{}: reconciliation failed, retrying next pass: {e}", timeframe.name)
                }
                Err(e) => error!("{}: reconciliation failed: {e}", timeframe.name),
            }
            outcomes.push(TimeframeOutcome::from_result(timeframe, result));
        }

        PassReport { now, outcomes }
    }
}
