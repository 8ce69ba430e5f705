use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use common::{Error, MacroRow, MarketDataBundle, OhlcRow, Result, Store, StoreHealth};

/// `Store` over a single SQLite database, shared by every collector and by
/// the strategy runner's read path.
///
/// Inserts are idempotent: the primary key is `(asset_id, timestamp_ms)` for
/// OHLC rows and `(indicator_id, date)` for macro rows, so a re-collected
/// window that overlaps what's already stored is a no-op on the overlap.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations. Call once at startup.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_ohlc(&self, rows: &[OhlcRow]) -> Result<usize> {
        let mut inserted = 0usize;
        for row in rows {
            if !row.is_valid() {
                warn!(asset_id = %row.asset_id, timestamp_ms = row.timestamp_ms, "dropping invalid OHLC row");
                continue;
            }
            let result = sqlx::query!(
                r#"
                INSERT INTO ohlc_rows (asset_id, timestamp_ms, open, high, low, close, volume, date)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(asset_id, timestamp_ms) DO NOTHING
                "#,
                row.asset_id,
                row.timestamp_ms,
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
                row.date,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    async fn insert_macro(&self, rows: &[MacroRow]) -> Result<usize> {
        let mut inserted = 0usize;
        for row in rows {
            let date = row.date.to_string();
            let result = sqlx::query!(
                r#"
                INSERT INTO macro_rows (indicator_id, date, value, is_interpolated, is_forward_filled)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(indicator_id, date) DO NOTHING
                "#,
                row.indicator_id,
                date,
                row.value,
                row.is_interpolated,
                row.is_forward_filled,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    async fn latest_ohlc_timestamp(&self, asset_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query!(
            "SELECT MAX(timestamp_ms) AS ts FROM ohlc_rows WHERE asset_id = ?1",
            asset_id
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(row.ts)
    }

    async fn latest_macro_date(&self, indicator_id: &str) -> Result<Option<NaiveDate>> {
        let row = sqlx::query!(
            "SELECT MAX(date) AS d FROM macro_rows WHERE indicator_id = ?1",
            indicator_id
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(row
            .d
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()))
    }

    async fn read_ohlc_window(
        &self,
        asset_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<OhlcRow>> {
        let since_ms = since.timestamp_millis();
        let until_ms = until.timestamp_millis();
        let rows = sqlx::query!(
            r#"
            SELECT asset_id, timestamp_ms, open, high, low, close, volume, date
            FROM ohlc_rows
            WHERE asset_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
            ORDER BY timestamp_ms ASC
            "#,
            asset_id,
            since_ms,
            until_ms,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| OhlcRow {
                asset_id: r.asset_id,
                timestamp_ms: r.timestamp_ms,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: r.volume,
                date: r.date,
            })
            .collect())
    }

    async fn read_macro_window(
        &self,
        indicator_id: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<MacroRow>> {
        let since_s = since.to_string();
        let until_s = until.to_string();
        let rows = sqlx::query!(
            r#"
            SELECT indicator_id, date, value, is_interpolated, is_forward_filled
            FROM macro_rows
            WHERE indicator_id = ?1 AND date >= ?2 AND date < ?3
            ORDER BY date ASC
            "#,
            indicator_id,
            since_s,
            until_s,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let date = NaiveDate::parse_from_str(&r.date, "%Y-%m-%d").ok()?;
                Some(MacroRow {
                    indicator_id: r.indicator_id,
                    date,
                    value: r.value,
                    is_interpolated: r.is_interpolated != 0,
                    is_forward_filled: r.is_forward_filled != 0,
                })
            })
            .collect())
    }

    async fn read_market_bundle(
        &self,
        asset_ids: &[String],
        indicator_ids: &[String],
        lookback: chrono::Duration,
        as_of: DateTime<Utc>,
    ) -> Result<MarketDataBundle> {
        let since = as_of - lookback;
        let mut bundle = MarketDataBundle::default();
        for asset_id in asset_ids {
            let rows = self.read_ohlc_window(asset_id, since, as_of).await?;
            bundle.ohlc.insert(asset_id.clone(), rows);
        }
        let since_date = since.date_naive();
        let until_date = as_of.date_naive();
        for indicator_id in indicator_ids {
            let rows = self
                .read_macro_window(indicator_id, since_date, until_date)
                .await?;
            bundle.macro_series.insert(indicator_id.clone(), rows);
        }
        debug!(assets = asset_ids.len(), indicators = indicator_ids.len(), "assembled market bundle");
        Ok(bundle)
    }

    async fn health_snapshot(&self) -> Result<StoreHealth> {
        let counts = sqlx::query!(
            r#"SELECT
                (SELECT COUNT(*) FROM ohlc_rows) AS "ohlc_count!",
                (SELECT COUNT(*) FROM macro_rows) AS "macro_count!",
                (SELECT MIN(timestamp_ms) FROM ohlc_rows) AS oldest,
                (SELECT MAX(timestamp_ms) FROM ohlc_rows) AS newest
            "#
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(StoreHealth {
            ohlc_row_count: counts.ohlc_count,
            macro_row_count: counts.macro_count,
            oldest_ohlc_timestamp_ms: counts.oldest,
            newest_ohlc_timestamp_ms: counts.newest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OhlcRow;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_read_back() {
        let store = test_store().await;
        let row = OhlcRow::new("BTC", 1_700_000_000_000, 100.0, 110.0, 95.0, 105.0, 10.0);
        let n = store.insert_ohlc(&[row.clone()]).await.unwrap();
        assert_eq!(n, 1);

        let since = DateTime::<Utc>::from_timestamp_millis(0).unwrap();
        let until = DateTime::<Utc>::from_timestamp_millis(2_000_000_000_000).unwrap();
        let rows = store.read_ohlc_window("BTC", since, until).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 105.0);
    }

    #[tokio::test]
    async fn duplicate_insert_is_idempotent() {
        let store = test_store().await;
        let row = OhlcRow::new("BTC", 1_700_000_000_000, 100.0, 110.0, 95.0, 105.0, 10.0);
        store.insert_ohlc(&[row.clone()]).await.unwrap();
        let n = store.insert_ohlc(&[row]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn invalid_row_is_dropped() {
        let store = test_store().await;
        let bad = OhlcRow::new("BTC", 1_700_000_000_000, 100.0, 50.0, 95.0, 105.0, 10.0);
        let n = store.insert_ohlc(&[bad]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn latest_timestamp_tracks_inserts() {
        let store = test_store().await;
        assert_eq!(store.latest_ohlc_timestamp("BTC").await.unwrap(), None);
        let row = OhlcRow::new("BTC", 1_700_000_000_000, 100.0, 110.0, 95.0, 105.0, 10.0);
        store.insert_ohlc(&[row]).await.unwrap();
        assert_eq!(
            store.latest_ohlc_timestamp("BTC").await.unwrap(),
            Some(1_700_000_000_000)
        );
    }
}
