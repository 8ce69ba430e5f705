use async_trait::async_trait;

use crate::error::CollectionError;
use crate::types::{MacroRow, OhlcRow, TaskKind};

/// What a single collection run produced, independent of how many rows
/// that turned out to be — the scheduler only needs the count and kind to
/// update task bookkeeping and logs.
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub task_kind: TaskKind,
    pub rows_collected: usize,
}

impl CollectionOutcome {
    pub fn new(task_kind: TaskKind, rows_collected: usize) -> Self {
        Self {
            task_kind,
            rows_collected,
        }
    }
}

/// Narrow interface a concrete upstream (CoinGecko-shaped crypto API,
/// FRED-shaped macro API, ...) implements. Collectors validate rows before
/// returning them; callers never see a row that fails `OhlcRow::is_valid`.
#[async_trait]
pub trait OhlcCollector: Send + Sync {
    /// Fetch and validate OHLC rows for `asset_id` newer than `since_ms`
    /// (`None` means "as far back as the upstream will give us").
    async fn collect_ohlc(
        &self,
        asset_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<OhlcRow>, CollectionError>;
}

#[async_trait]
pub trait MacroCollector: Send + Sync {
    /// Fetch macro-indicator observations for `indicator_id` newer than
    /// `since`; `since` of `None` means the upstream's full history.
    async fn collect_macro(
        &self,
        indicator_id: &str,
        since: Option<chrono::NaiveDate>,
    ) -> Result<Vec<MacroRow>, CollectionError>;
}
