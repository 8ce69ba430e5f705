use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::{MacroRow, MarketDataBundle, OhlcRow};

/// A point-in-time view of storage health, returned by `health_snapshot`
/// for the scheduler's periodic logging and for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StoreHealth {
    pub ohlc_row_count: i64,
    pub macro_row_count: i64,
    pub oldest_ohlc_timestamp_ms: Option<i64>,
    pub newest_ohlc_timestamp_ms: Option<i64>,
}

/// Persistence boundary for market data. A single implementation
/// (`SqliteStore`) backs production; the trait exists so strategy and
/// scheduler tests can substitute an in-memory fake without a real database.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_ohlc(&self, rows: &[OhlcRow]) -> Result<usize>;

    async fn insert_macro(&self, rows: &[MacroRow]) -> Result<usize>;

    /// Most recent `timestamp_ms` stored for `asset_id`, if any.
    async fn latest_ohlc_timestamp(&self, asset_id: &str) -> Result<Option<i64>>;

    /// Most recent `date` stored for `indicator_id`, if any.
    async fn latest_macro_date(&self, indicator_id: &str) -> Result<Option<NaiveDate>>;

    async fn read_ohlc_window(
        &self,
        asset_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<OhlcRow>>;

    async fn read_macro_window(
        &self,
        indicator_id: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<MacroRow>>;

    /// Assembles a single consistent-as-of-`as_of` bundle across every
    /// asset and indicator the caller names, read under one connection so
    /// no row straddles a different "now" than its neighbors.
    async fn read_market_bundle(
        &self,
        asset_ids: &[String],
        indicator_ids: &[String],
        lookback: chrono::Duration,
        as_of: DateTime<Utc>,
    ) -> Result<MarketDataBundle>;

    async fn health_snapshot(&self) -> Result<StoreHealth>;
}
