use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use candle_feed_core::timeframe::{self, TimeframeConfig};
use candle_feed_core::{FeedError, Reconciler};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::scheduler::unix_now;

/// Upper bound on buckets returned by one `/range` call.
const MAX_RANGE_BUCKETS: u64 = 10_000;

/// Shared state, passed to every handler via `axum::extract::State`.
pub struct AppState {
    pub config: ServerConfig,
    pub store_name: String,
    pub timeframes: Vec<TimeframeConfig>,
    reconciler: Option<Arc<Reconciler>>,
    setup_error: Option<String>,
}

impl AppState {
    pub fn ready(config: ServerConfig, reconciler: Arc<Reconciler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store_name: reconciler.store().name().to_string(),
            timeframes: reconciler.timeframes().to_vec(),
            reconciler: Some(reconciler),
            setup_error: None,
        })
    }

    /// State for a server whose store could not be built. Diagnostics still
    /// work; everything touching the store answers 500.
    pub fn unconfigured(
        config: ServerConfig,
        store_name: &str,
        timeframes: Vec<TimeframeConfig>,
        error: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store_name: store_name.to_string(),
            timeframes,
            reconciler: None,
            setup_error: Some(error),
        })
    }

    fn reconciler(&self) -> Result<&Arc<Reconciler>, ApiError> {
        self.reconciler.as_ref().ok_or_else(|| {
            ApiError::NotConfigured(
                self.setup_error
                    .clone()
                    .unwrap_or_else(|| "store not configured".to_string()),
            )
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotConfigured(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::NotConfigured(msg) => write!(f, "store not configured: {msg}"),
            Self::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotConfigured(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = json!({
            "success": false,
            "error": self.to_string(),
            "timestamp": timestamp(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::ConfigMissing(msg) => Self::NotConfigured(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Epoch seconds from an integer, an RFC 3339 timestamp, or a `YYYY-MM-DD`
/// date (midnight UTC).
pub fn parse_time_bound(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp());
    }
    Err(format!("invalid time '{value}': expected epoch seconds, RFC 3339 or YYYY-MM-DD"))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/test", get(diagnostics))
        .route("/extract", get(extract))
        .route("/latest", get(latest))
        .route("/range", get(range))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Candle feed listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        return;
    }
    info!("Shutdown signal received, gracefully stopping");
}

async fn index() -> Json<Value> {
    Json(json!({
        "message": "Candle feed service",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/extract", "/latest", "/range", "/health", "/test"],
        "timestamp": timestamp(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": timestamp() }))
}

/// Configuration and connectivity report. Never fails.
async fn diagnostics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (connected, error) = match state.reconciler() {
        Ok(reconciler) => match reconciler.bounded("ping", reconciler.store().ping()).await {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        },
        Err(e) => (false, Some(e.to_string())),
    };

    Json(json!({
        "success": connected,
        "store": state.store_name,
        "store_connected": connected,
        "error": error,
        "credentials_set": state.config.credentials_set(),
        "env_vars": {
            "supabase_url": state.config.supabase_url_set,
            "supabase_key": state.config.supabase_key_set,
        },
        "timestamp": timestamp(),
    }))
}

async fn extract(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let reconciler = state.reconciler()?;
    let report = reconciler.run_pass(unix_now()).await;

    let mut storage = Map::new();
    let mut data = Map::new();
    for outcome in &report.outcomes {
        storage.insert(outcome.timeframe.clone(), Value::String(outcome.message.clone()));
        data.insert(
            outcome.timeframe.clone(),
            serde_json::to_value(&outcome.written).map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }

    Ok(Json(json!({
        "success": true,
        "timestamp": timestamp(),
        "storage": storage,
        "errors": report.errors(),
        "data": data,
    })))
}

async fn latest(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let reconciler = state.reconciler()?;
    let symbol = reconciler.symbol();

    let mut data = Map::new();
    for tf in reconciler.timeframes() {
        let table = tf.table.as_str();
        let candles = match reconciler
            .bounded(
                &format!("select recent from {table}"),
                reconciler.store().select_recent(table, symbol, tf.retention_count),
            )
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!("{}: latest read failed: {e}", tf.name);
                Vec::new()
            }
        };
        data.insert(
            tf.name.clone(),
            serde_json::to_value(&candles).map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }

    Ok(Json(json!({
        "success": true,
        "timestamp": timestamp(),
        "data": data,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub timeframe: Option<String>,
}

async fn range(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Value>, ApiError> {
    let name = params
        .timeframe
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing 'timeframe'".into()))?;
    let tf = timeframe::find(&state.timeframes, name)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown timeframe '{name}'")))?;

    let bound = |key: &str, value: Option<&str>| -> Result<i64, ApiError> {
        let value = value.ok_or_else(|| ApiError::BadRequest(format!("missing '{key}'")))?;
        parse_time_bound(value).map_err(ApiError::BadRequest)
    };
    let from = bound("from", params.from.as_deref())?;
    let to = bound("to", params.to.as_deref())?;
    if from > to {
        return Err(ApiError::BadRequest(format!("'from' {from} is after 'to' {to}")));
    }
    let buckets = timeframe::bucket_count(from, to, tf.bucket_width_secs)
        .ok_or_else(|| ApiError::BadRequest(format!("range {from}..{to} is out of bounds")))?;
    if buckets > MAX_RANGE_BUCKETS {
        return Err(ApiError::BadRequest(format!(
            "range spans more than {MAX_RANGE_BUCKETS} {} buckets",
            tf.name
        )));
    }

    let reconciler = state.reconciler()?;
    let table = tf.table.as_str();
    let candles = reconciler
        .bounded(
            &format!("select range from {table}"),
            reconciler
                .store()
                .select_range(table, reconciler.symbol(), from, to),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "timestamp": timestamp(),
        "timeframe": tf.name,
        "from": from,
        "to": to,
        "data": candles,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_feed_core::synth::CandleSynthesizer;
    use candle_feed_core::{CandleStore, MemoryStore, SyntheticSource};
    use rust_decimal_macros::dec;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 3000,
            supabase_url_set: false,
            supabase_key_set: false,
        }
    }

    fn timeframes() -> Vec<TimeframeConfig> {
        vec![
            TimeframeConfig::new("1H", 3600, 4, "candles_1h"),
            TimeframeConfig::new("15min", 900, 6, "candles_15min"),
        ]
    }

    fn ready_state(store: Arc<MemoryStore>) -> Arc<AppState> {
        let source = Arc::new(SyntheticSource::seeded(
            CandleSynthesizer::default(),
            dec!(95000),
            21,
        ));
        let reconciler = Reconciler::new(store, source, "BTCUSDT", timeframes()).unwrap();
        AppState::ready(config(), Arc::new(reconciler))
    }

    fn unconfigured_state() -> Arc<AppState> {
        AppState::unconfigured(
            config(),
            "postgrest",
            timeframes(),
            "SUPABASE_URL not set".to_string(),
        )
    }

    fn params(from: Option<&str>, to: Option<&str>, timeframe: Option<&str>) -> RangeParams {
        RangeParams {
            from: from.map(str::to_string),
            to: to.map(str::to_string),
            timeframe: timeframe.map(str::to_string),
        }
    }

    #[test]
    fn parse_time_bound_formats() {
        assert_eq!(parse_time_bound("1736956800").unwrap(), 1_736_956_800);
        assert_eq!(parse_time_bound("2025-01-15T16:00:00Z").unwrap(), 1_736_956_800);
        assert_eq!(parse_time_bound("2025-01-15T17:00:00+01:00").unwrap(), 1_736_956_800);
        assert_eq!(parse_time_bound("2025-01-15").unwrap(), 1_736_899_200);
        assert!(parse_time_bound("yesterday").is_err());
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotConfigured("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let err: ApiError = FeedError::ConfigMissing("SUPABASE_KEY not set".into()).into();
        assert!(matches!(err, ApiError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn health_shape() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn extract_reports_every_timeframe() {
        let store = Arc::new(MemoryStore::new());
        let state = ready_state(store.clone());

        let Json(body) = extract(State(state.clone())).await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["storage"]["1H"], "Backfilled 4 candles");
        assert_eq!(body["storage"]["15min"], "Backfilled 6 candles");
        assert_eq!(body["errors"].as_array().unwrap().len(), 0);
        assert_eq!(body["data"]["1H"].as_array().unwrap().len(), 4);
        assert_eq!(store.count("candles_15min", "BTCUSDT").await.unwrap(), 6);

        let Json(again) = extract(State(state)).await.unwrap();
        assert_eq!(again["storage"]["1H"], "Up to date");
        assert_eq!(again["data"]["1H"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn latest_returns_chronological_windows() {
        let store = Arc::new(MemoryStore::new());
        let state = ready_state(store);
        extract(State(state.clone())).await.unwrap();

        let Json(body) = latest(State(state)).await.unwrap();
        let hourly = body["data"]["1H"].as_array().unwrap();
        assert_eq!(hourly.len(), 4);
        let starts: Vec<i64> = hourly
            .iter()
            .map(|c| c["bucket_start"].as_i64().unwrap())
            .collect();
        assert!(starts.windows(2).all(|w| w[1] - w[0] == 3600));
    }

    #[tokio::test]
    async fn range_reads_inclusive_window() {
        let store = Arc::new(MemoryStore::new());
        let state = ready_state(store.clone());
        extract(State(state.clone())).await.unwrap();

        // anchor on what the pass wrote, not on a second clock read
        let newest = store
            .select_latest("candles_1h", "BTCUSDT")
            .await
            .unwrap()
            .unwrap()
            .bucket_start;
        let from = (newest - 3600).to_string();
        let to = newest.to_string();
        let Json(body) = range(
            State(state),
            Query(params(Some(&from), Some(&to), Some("1h"))),
        )
        .await
        .unwrap();
        assert_eq!(body["timeframe"], "1H");
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn range_rejects_bad_params() {
        let state = ready_state(Arc::new(MemoryStore::new()));

        let missing_tf = range(State(state.clone()), Query(params(Some("0"), Some("60"), None))).await;
        assert!(matches!(missing_tf, Err(ApiError::BadRequest(_))));

        let unknown_tf =
            range(State(state.clone()), Query(params(Some("0"), Some("60"), Some("2H")))).await;
        assert!(matches!(unknown_tf, Err(ApiError::BadRequest(_))));

        let bad_bound =
            range(State(state.clone()), Query(params(Some("soon"), Some("60"), Some("1H")))).await;
        assert!(matches!(bad_bound, Err(ApiError::BadRequest(_))));

        let inverted =
            range(State(state), Query(params(Some("7200"), Some("0"), Some("1H")))).await;
        assert!(matches!(inverted, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn range_rejects_extreme_bounds() {
        let state = ready_state(Arc::new(MemoryStore::new()));
        let (min, max) = (i64::MIN.to_string(), i64::MAX.to_string());

        let full = range(
            State(state.clone()),
            Query(params(Some(&min), Some(&max), Some("1H"))),
        )
        .await;
        assert!(matches!(full, Err(ApiError::BadRequest(_))));

        let too_wide = range(
            State(state.clone()),
            Query(params(Some("0"), Some(&(3600 * 10_000).to_string()), Some("1H"))),
        )
        .await;
        assert!(matches!(too_wide, Err(ApiError::BadRequest(_))));

        let at_cap = range(
            State(state),
            Query(params(Some("0"), Some(&(3600 * 9_999).to_string()), Some("1H"))),
        )
        .await;
        assert!(at_cap.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_store_fails_with_500_but_diagnostics_answer() {
        let state = unconfigured_state();

        let err = extract(State(state.clone())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(latest(State(state.clone())).await.is_err());

        let Json(body) = diagnostics(State(state)).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["store_connected"], false);
        assert_eq!(body["env_vars"]["supabase_url"], false);
        assert_eq!(body["credentials_set"], false);
        assert!(body["error"].as_str().unwrap().contains("SUPABASE_URL"));
    }

    #[tokio::test]
    async fn diagnostics_pings_store() {
        let state = ready_state(Arc::new(MemoryStore::new()));
        let Json(body) = diagnostics(State(state)).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["store"], "memory");
        assert!(body["error"].is_null());
    }
}
