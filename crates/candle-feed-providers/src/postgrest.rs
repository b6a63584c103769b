use std::time::Duration;

use async_trait::async_trait;
use candle_feed_core::candle::Candle;
use candle_feed_core::error::FeedError;
use candle_feed_core::store::CandleStore;
use reqwest::{Client, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, check_status};

/// Rows requested per select. Deployments commonly cap responses at
/// `db-max-rows = 1000`, so larger reads are paged with `offset`.
pub const PAGE_SIZE: usize = 1000;

/// Candle tables on a hosted Postgres, reached through its PostgREST
/// interface. Authenticates via the `apikey` and `Authorization` headers.
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PostgrestStore {
    /// Create from environment variables `SUPABASE_URL` and `SUPABASE_KEY`.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| ProviderError::Config("SUPABASE_URL not set".into()))?;
        let api_key = std::env::var("SUPABASE_KEY")
            .map_err(|_| ProviderError::Config("SUPABASE_KEY not set".into()))?;
        Self::new(&url, api_key, timeout)
    }

    /// Create with an explicit project URL. The REST root is `{url}/rest/v1`.
    pub fn new(url: &str, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(ProviderError::Config("store URL is empty".into()));
        }
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config("store key is empty".into()));
        }

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: format!("{url}/rest/v1"),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.base_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        check_status(self.authed(request).send().await?).await
    }

    async fn fetch_rows(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<Candle>, ProviderError> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "time,open,high,low,close,volume,symbol")])
            .query(query);
        let rows: Vec<CandleRow> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("failed to parse {table} rows: {e}")))?;
        Ok(rows.into_iter().map(CandleRow::into_candle).collect())
    }

    /// Read up to `limit` rows in `PAGE_SIZE` pages. Stops early when a page
    /// comes back short, which means the table ran out of rows.
    async fn fetch_paged(
        &self,
        table: &str,
        query: &[(&str, String)],
        limit: usize,
    ) -> Result<Vec<Candle>, ProviderError> {
        let mut rows = Vec::new();
        for (offset, len) in pages(limit, PAGE_SIZE) {
            let mut page_query = query.to_vec();
            page_query.push(("offset", offset.to_string()));
            page_query.push(("limit", len.to_string()));
            let page = self.fetch_rows(table, &page_query).await?;
            let short = page.len() < len;
            rows.extend(page);
            if short {
                break;
            }
        }
        Ok(rows)
    }

    fn content_range_total(response: &Response) -> Result<u64, ProviderError> {
        let header = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProviderError::Parse("missing Content-Range header".into()))?;
        parse_content_range_total(header)
    }
}

/// Row shape of the `candles_*` tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CandleRow {
    time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    symbol: String,
}

impl CandleRow {
    fn from_candle(candle: &Candle) -> Self {
        Self {
            time: candle.bucket_start,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            symbol: candle.symbol.clone(),
        }
    }

    fn into_candle(self) -> Candle {
        Candle {
            bucket_start: self.time,
            symbol: self.symbol,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// `(offset, len)` pairs covering `limit` rows in pages of at most `page_size`.
pub fn pages(limit: usize, page_size: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..limit)
        .step_by(page_size.max(1))
        .map(move |offset| (offset, page_size.max(1).min(limit - offset)))
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(header: &str) -> Result<u64, ProviderError> {
    let (_, total) = header
        .split_once('/')
        .ok_or_else(|| ProviderError::Parse(format!("malformed Content-Range '{header}'")))?;
    total
        .trim()
        .parse()
        .map_err(|_| ProviderError::Parse(format!("Content-Range '{header}' has no exact total")))
}

#[async_trait]
impl CandleStore for PostgrestStore {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn upsert(&self, table: &str, candles: &[Candle]) -> Result<(), FeedError> {
        if candles.is_empty() {
            return Ok(());
        }
        let rows: Vec<CandleRow> = candles.iter().map(CandleRow::from_candle).collect();
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", "time,symbol")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.send(request)
            .await
            .map_err(|e| e.into_storage(table))?;
        debug!(table, rows = rows.len(), "upserted candles");
        Ok(())
    }

    async fn select_latest(&self, table: &str, symbol: &str) -> Result<Option<Candle>, FeedError> {
        let rows = self
            .fetch_rows(
                table,
                &[
                    ("symbol", format!("eq.{symbol}")),
                    ("order", "time.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await
            .map_err(|e| e.into_storage(table))?;
        Ok(rows.into_iter().next())
    }

    async fn select_recent(
        &self,
        table: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let mut rows = self
            .fetch_paged(
                table,
                &[
                    ("symbol", format!("eq.{symbol}")),
                    ("order", "time.desc".to_string()),
                ],
                limit,
            )
            .await
            .map_err(|e| e.into_storage(table))?;
        rows.reverse();
        Ok(rows)
    }

    async fn bucket_at_rank(
        &self,
        table: &str,
        symbol: &str,
        rank: usize,
    ) -> Result<Option<i64>, FeedError> {
        let rows = self
            .fetch_rows(
                table,
                &[
                    ("symbol", format!("eq.{symbol}")),
                    ("order", "time.desc".to_string()),
                    ("offset", rank.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await
            .map_err(|e| e.into_storage(table))?;
        Ok(rows.first().map(|c| c.bucket_start))
    }

    async fn select_range(
        &self,
        table: &str,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.fetch_paged(
            table,
            &[
                ("symbol", format!("eq.{symbol}")),
                ("time", format!("gte.{from}")),
                ("time", format!("lte.{to}")),
                ("order", "time.asc".to_string()),
            ],
            usize::MAX,
        )
        .await
        .map_err(|e| e.into_storage(table))
    }

    async fn count(&self, table: &str, symbol: &str) -> Result<u64, FeedError> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[
                ("select", "time".to_string()),
                ("symbol", format!("eq.{symbol}")),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact");
        let response = self
            .send(request)
            .await
            .map_err(|e| e.into_storage(table))?;
        Self::content_range_total(&response).map_err(|e| e.into_storage(table))
    }

    async fn delete_older_than(
        &self,
        table: &str,
        symbol: &str,
        bucket_start: i64,
    ) -> Result<u64, FeedError> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[
                ("symbol", format!("eq.{symbol}")),
                ("time", format!("lt.{bucket_start}")),
            ])
            .header("Prefer", "count=exact,return=minimal");
        let response = self
            .send(request)
            .await
            .map_err(|e| e.into_storage(table))?;
        Self::content_range_total(&response).map_err(|e| e.into_storage(table))
    }

    async fn ping(&self) -> Result<(), FeedError> {
        let request = self.client.get(format!("{}/", self.base_url));
        self.send(request)
            .await
            .map(|_| ())
            .map_err(|e| e.into_storage("rest root"))
    }
}
