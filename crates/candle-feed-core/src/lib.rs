//! Multi-timeframe OHLCV feed: candle types, the synthetic random-walk
//! generator, the storage abstraction and the logic that keeps each
//! timeframe table current.

pub mod backfill;
pub mod candle;
pub mod error;
pub mod parquet_store;
pub mod reconciler;
pub mod retention;
pub mod schema;
pub mod source;
pub mod store;
pub mod synth;
pub mod timeframe;

pub use candle::Candle;
pub use error::FeedError;
pub use reconciler::{PassReport, Reconciler};
pub use source::{DataSource, SyntheticSource};
pub use store::{CandleStore, MemoryStore};
pub use timeframe::TimeframeConfig;
