mod config;
mod scheduler;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use candle_feed_core::parquet_store::ParquetStore;
use candle_feed_core::synth::CandleSynthesizer;
use candle_feed_core::timeframe::{self, TimeframeConfig, validate_timeframes};
use candle_feed_core::{
    CandleStore, DataSource, FeedError, MemoryStore, Reconciler, SyntheticSource,
};
use candle_feed_providers::binance::BinanceSource;
use candle_feed_providers::postgrest::PostgrestStore;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn};

use config::ServerConfig;
use scheduler::{ExtractionScheduler, unix_now};
use server::AppState;

#[derive(Parser)]
#[command(
    name = "candle-feed",
    about = "Synthesize and store multi-timeframe candle data"
)]
struct Cli {
    /// Candle store: postgrest, parquet, memory
    #[arg(long, default_value = "postgrest")]
    store: String,

    /// Root directory for the parquet store (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Candle source: synthetic, binance
    #[arg(long, default_value = "synthetic")]
    source: String,

    /// Trading pair
    #[arg(long, default_value = "BTCUSDT")]
    symbol: String,

    /// Starting price of the synthetic walk when a table is empty
    #[arg(long, default_value = "95000")]
    base_price: Decimal,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Timeout for a single store call, in seconds
    #[arg(long, default_value_t = 10)]
    store_timeout_secs: u64,

    /// Keep candles beyond each timeframe's retention window
    #[arg(long)]
    no_trim: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server and the periodic extraction
    Serve {
        /// Listen port (default: $PORT or 3000)
        #[arg(long)]
        port: Option<u16>,

        /// Seconds between scheduled passes
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },

    /// Run a single reconciliation pass
    Extract,

    /// Print the stored candles of one or all timeframes
    Latest {
        /// Timeframe name, e.g. 1H (all if omitted)
        #[arg(short, long)]
        timeframe: Option<String>,
    },

    /// Show row counts and the newest bucket per timeframe
    Status,

    /// Fill a time range for one timeframe
    Backfill {
        /// Timeframe name, e.g. 15min
        #[arg(short, long)]
        timeframe: String,

        /// Range start (epoch seconds, RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        from: String,

        /// Range end, inclusive
        #[arg(long)]
        to: String,

        /// Rewrite buckets that already exist
        #[arg(long)]
        force: bool,
    },
}

fn create_store(
    name: &str,
    data_dir: &Path,
    timeout: Duration,
) -> Result<Arc<dyn CandleStore>, FeedError> {
    match name {
        "postgrest" => Ok(Arc::new(
            PostgrestStore::from_env(timeout).map_err(|e| e.into_storage("postgrest"))?,
        )),
        "parquet" => Ok(Arc::new(ParquetStore::new(data_dir))),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(FeedError::InvalidConfig(format!(
            "unknown store: {other}. Expected: postgrest, parquet, memory"
        ))),
    }
}

fn create_source(name: &str, base_price: Decimal, timeout: Duration) -> Result<Arc<dyn DataSource>> {
    match name {
        "synthetic" => {
            if base_price <= Decimal::ZERO {
                anyhow::bail!("base price must be positive, got {base_price}");
            }
            Ok(Arc::new(SyntheticSource::new(
                CandleSynthesizer::default(),
                base_price,
            )))
        }
        "binance" => Ok(Arc::new(
            BinanceSource::new(timeout).context("failed to create Binance source")?,
        )),
        other => anyhow::bail!("unknown source: {other}. Expected: synthetic, binance"),
    }
}

fn format_time(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn select_timeframes<'a>(
    timeframes: &'a [TimeframeConfig],
    name: Option<&str>,
) -> Result<Vec<&'a TimeframeConfig>> {
    match name {
        Some(name) => timeframe::find(timeframes, name)
            .map(|tf| vec![tf])
            .with_context(|| format!("unknown timeframe: {name}")),
        None => Ok(timeframes.iter().collect()),
    }
}

async fn cmd_serve(cli: &Cli, port: Option<u16>, interval_secs: u64) -> Result<()> {
    let config = ServerConfig::from_env().with_port(port);
    let timeout = Duration::from_secs(cli.store_timeout_secs);
    let timeframes = TimeframeConfig::defaults();

    let mut scheduler = None;
    let state = match create_store(&cli.store, &cli.data_dir, timeout) {
        Ok(store) => {
            let source = create_source(&cli.source, cli.base_price, timeout)?;
            info!("Using store: {}, source: {}", store.name(), source.name());
            let reconciler = Arc::new(
                Reconciler::new(store, source, cli.symbol.to_uppercase(), timeframes)
                    .context("invalid timeframe table")?
                    .with_store_timeout(timeout)
                    .with_trim(!cli.no_trim),
            );

            let mut extraction = ExtractionScheduler::new(reconciler.clone());
            extraction.start(Duration::from_secs(interval_secs.max(1)));
            scheduler = Some(extraction);
            AppState::ready(config, reconciler)
        }
        Err(FeedError::ConfigMissing(msg)) => {
            warn!("Store not configured ({msg}); serving without extraction");
            AppState::unconfigured(config, &cli.store, timeframes, msg)
        }
        Err(e) => return Err(e).context("failed to create store"),
    };

    let served = server::run(state).await;
    if let Some(mut extraction) = scheduler {
        extraction.stop().await;
    }
    served
}

fn build_reconciler(cli: &Cli) -> Result<Reconciler> {
    let timeout = Duration::from_secs(cli.store_timeout_secs);
    let store = create_store(&cli.store, &cli.data_dir, timeout).context("failed to create store")?;
    let source = create_source(&cli.source, cli.base_price, timeout)?;
    info!("Using store: {}, source: {}", store.name(), source.name());

    Ok(Reconciler::new(
        store,
        source,
        cli.symbol.to_uppercase(),
        TimeframeConfig::defaults(),
    )
    .context("invalid timeframe table")?
    .with_store_timeout(timeout)
    .with_trim(!cli.no_trim))
}

async fn cmd_extract(reconciler: &Reconciler) -> Result<()> {
    let report = reconciler.run_pass(unix_now()).await;
    for outcome in &report.outcomes {
        println!("{} ({}): {}", outcome.timeframe, outcome.table, outcome.message);
    }

    let errors = report.errors();
    if !errors.is_empty() {
        anyhow::bail!("{} timeframe(s) failed", errors.len());
    }
    Ok(())
}

async fn cmd_latest(reconciler: &Reconciler, timeframe: Option<&str>) -> Result<()> {
    let store = reconciler.store();
    let symbol = reconciler.symbol();

    for tf in select_timeframes(reconciler.timeframes(), timeframe)? {
        let candles = store
            .select_recent(&tf.table, symbol, tf.retention_count)
            .await
            .with_context(|| format!("failed to read {}", tf.table))?;

        println!("{symbol} {}: {} candle(s)", tf.name, candles.len());
        for c in &candles {
            println!(
                "  {}  O:{} H:{} L:{} C:{} V:{}",
                format_time(c.bucket_start),
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume
            );
        }
    }

    Ok(())
}

async fn cmd_status(reconciler: &Reconciler) -> Result<()> {
    let store = reconciler.store();
    let symbol = reconciler.symbol();
    println!("Store: {}", store.name());

    for tf in reconciler.timeframes() {
        let count = store
            .count(&tf.table, symbol)
            .await
            .with_context(|| format!("failed to count {}", tf.table))?;
        if count == 0 {
            println!("{} ({}): no data", tf.name, tf.table);
            continue;
        }

        let latest = store
            .select_latest(&tf.table, symbol)
            .await
            .with_context(|| format!("failed to read {}", tf.table))?;
        let newest = latest
            .map(|c| format_time(c.bucket_start))
            .unwrap_or_default();
        println!(
            "{} ({}): {count}/{} candle(s), newest {newest}",
            tf.name, tf.table, tf.retention_count
        );
    }

    Ok(())
}

async fn cmd_backfill(
    reconciler: &Reconciler,
    timeframe: &str,
    from: &str,
    to: &str,
    force: bool,
) -> Result<()> {
    let tf = timeframe::find(reconciler.timeframes(), timeframe)
        .with_context(|| format!("unknown timeframe: {timeframe}"))?;
    let from = server::parse_time_bound(from).map_err(anyhow::Error::msg)?;
    let to = server::parse_time_bound(to).map_err(anyhow::Error::msg)?;

    let report = reconciler
        .backfill_range(tf, from, to, force)
        .await
        .with_context(|| format!("backfill of {} failed", tf.name))?;

    println!(
        "{}: {} bucket(s) in range, wrote {} in {} run(s)",
        tf.name, report.buckets_in_range, report.written, report.runs
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    validate_timeframes(&TimeframeConfig::defaults()).context("invalid timeframe table")?;

    match &cli.command {
        Commands::Serve {
            port,
            interval_secs,
        } => {
            cmd_serve(&cli, *port, *interval_secs).await?;
        }
        Commands::Extract => {
            let reconciler = build_reconciler(&cli)?;
            cmd_extract(&reconciler).await?;
        }
        Commands::Latest { timeframe } => {
            let reconciler = build_reconciler(&cli)?;
            cmd_latest(&reconciler, timeframe.as_deref()).await?;
        }
        Commands::Status => {
            let reconciler = build_reconciler(&cli)?;
            cmd_status(&reconciler).await?;
        }
        Commands::Backfill {
            timeframe,
            from,
            to,
            force,
        } => {
            let reconciler = build_reconciler(&cli)?;
            cmd_backfill(&reconciler, timeframe, from, to, *force).await?;
        }
    }

    Ok(())
}
