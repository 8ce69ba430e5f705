use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLC candle for one asset, keyed by `(asset_id, timestamp_ms)`.
///
/// Invariants (enforced by collectors before a row ever reaches the store):
/// `low <= open <= high`, `low <= close <= high`, `volume >= 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcRow {
    pub asset_id: String,
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// YYYY-MM-DD (UTC), derived from `timestamp_ms`, carried so
    /// date-keyed joins against macro rows don't need to recompute it.
    pub date: String,
}

impl OhlcRow {
    pub fn new(
        asset_id: impl Into<String>,
        timestamp_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        let date = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        Self {
            asset_id: asset_id.into(),
            timestamp_ms,
            open,
            high,
            low,
            close,
            volume,
            date,
        }
    }

    /// True if the row satisfies the row-level invariants in the data model.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// A single macro-indicator observation, keyed by `(indicator_id, date)`.
/// `value` is `None` when the upstream reports a missing observation —
/// missing is preserved, never coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroRow {
    pub indicator_id: String,
    pub date: NaiveDate,
    pub value: Option<f64>,
    pub is_interpolated: bool,
    pub is_forward_filled: bool,
}

/// One of the three scheduling tiers, each with a fixed cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    HighFrequency,
    Hourly,
    Macro,
}

impl Tier {
    pub fn cadence(self) -> chrono::Duration {
        match self {
            Tier::HighFrequency => chrono::Duration::minutes(15),
            Tier::Hourly => chrono::Duration::minutes(60),
            Tier::Macro => chrono::Duration::hours(24),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::HighFrequency => "high_frequency",
            Tier::Hourly => "hourly",
            Tier::Macro => "macro",
        };
        write!(f, "{s}")
    }
}

/// The kind of upstream a task collects from; folded into the task id as
/// `"{kind}_{asset_or_indicator_id}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Crypto,
    Macro,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Crypto => "crypto",
            TaskKind::Macro => "macro",
        };
        write!(f, "{s}")
    }
}

/// A declared periodic collection task, owned exclusively by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub kind: TaskKind,
    pub asset_or_indicator_id: String,
    pub tier: Tier,
    pub last_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub enabled: bool,
}

impl TaskDescriptor {
    pub fn new(kind: TaskKind, asset_or_indicator_id: impl Into<String>, tier: Tier) -> Self {
        let asset_or_indicator_id = asset_or_indicator_id.into();
        Self {
            task_id: format!("{kind}_{asset_or_indicator_id}"),
            kind,
            asset_or_indicator_id,
            tier,
            last_run: None,
            consecutive_failures: 0,
            enabled: true,
        }
    }

    pub fn cadence(&self) -> chrono::Duration {
        self.tier.cadence()
    }
}

/// A transient, read-only snapshot of windowed market data handed to the
/// strategy runner. Rows are already deduplicated and sorted ascending.
#[derive(Debug, Clone, Default)]
pub struct MarketDataBundle {
    pub ohlc: HashMap<String, Vec<OhlcRow>>,
    pub macro_series: HashMap<String, Vec<MacroRow>>,
}

impl MarketDataBundle {
    pub fn ohlc_for(&self, asset_id: &str) -> &[OhlcRow] {
        self.ohlc.get(asset_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn closes(&self, asset_id: &str) -> Vec<f64> {
        self.ohlc_for(asset_id).iter().map(|r| r.close).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Hold,
}

impl Direction {
    /// +1 / -1 / 0, used by the weighted-average conflict resolution.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Hold => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

impl Strength {
    fn rank(self) -> u8 {
        match self {
            Strength::Weak => 0,
            Strength::Moderate => 1,
            Strength::Strong => 2,
        }
    }

    pub fn max(self, other: Strength) -> Strength {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

/// A per-asset directional recommendation, produced by a strategy or by
/// the aggregator merging several strategies' recommendations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub asset_id: String,
    pub direction: Direction,
    pub timestamp_ms: i64,
    pub reference_price: f64,
    pub strategy_name: String,
    pub strength: Strength,
    pub confidence: f64,
    pub position_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_risk: Option<f64>,
    pub analysis: serde_json::Value,
}

impl Signal {
    /// `confidence` clamped into `[0, 1]`, as the aggregator's invariant
    /// requires of everything it emits.
    pub fn clamp_confidence(&mut self) {
        self.confidence = self.confidence.clamp(0.0, 1.0);
    }
}

/// The position direction vocabulary used by alert records — distinct from
/// `Direction` because it also encodes confidence via the BUY/SELL tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionDirection {
    StrongBuy,
    Buy,
    WeakBuy,
    Hold,
    WeakSell,
    Sell,
    StrongSell,
}

/// An immutable, persisted projection of a signal that crossed its source
/// metric's threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp_ms: i64,
    pub asset_id: String,
    pub current_price: f64,
    pub metric_value: f64,
    pub threshold_value: f64,
    pub percentile: f64,
    pub position_direction: PositionDirection,
    pub signal_direction: Direction,
    pub alert_kind: String,
    pub threshold_exceeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ohlc_row_validity() {
        let ok = OhlcRow::new("BTC", 0, 100.0, 110.0, 95.0, 105.0, 10.0);
        assert!(ok.is_valid());

        let bad = OhlcRow::new("BTC", 0, 100.0, 90.0, 95.0, 105.0, 10.0);
        assert!(!bad.is_valid());

        let negative_volume = OhlcRow::new("BTC", 0, 100.0, 110.0, 95.0, 105.0, -1.0);
        assert!(!negative_volume.is_valid());
    }

    #[test]
    fn ohlc_row_date_derived_from_timestamp() {
        let row = OhlcRow::new("BTC", 1_700_000_000_000, 1.0, 1.0, 1.0, 1.0, 1.0);
        assert_eq!(row.date, "2023-11-14");
    }

    #[test]
    fn tier_cadence_ordering() {
        assert!(Tier::HighFrequency.cadence() < Tier::Hourly.cadence());
        assert!(Tier::Hourly.cadence() < Tier::Macro.cadence());
    }

    #[test]
    fn strength_max_picks_strongest() {
        assert_eq!(Strength::Weak.max(Strength::Strong), Strength::Strong);
        assert_eq!(Strength::Strong.max(Strength::Weak), Strength::Strong);
        assert_eq!(Strength::Moderate.max(Strength::Weak), Strength::Moderate);
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::Hold.sign(), 0.0);
    }

    #[test]
    fn signal_confidence_clamps_into_unit_range() {
        let mut signal = Signal {
            asset_id: "BTC".to_string(),
            direction: Direction::Long,
            timestamp_ms: 0,
            reference_price: 100.0,
            strategy_name: "test".to_string(),
            strength: Strength::Weak,
            confidence: 1.5,
            position_size: 1.0,
            stop_loss: None,
            take_profit: None,
            max_risk: None,
            analysis: serde_json::json!({}),
        };
        signal.clamp_confidence();
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn task_descriptor_id_encodes_kind_and_target() {
        let task = TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency);
        assert_eq!(task.task_id, "crypto_BTC");
        assert_eq!(task.cadence(), Tier::HighFrequency.cadence());
    }

    #[test]
    fn market_data_bundle_missing_asset_returns_empty() {
        let bundle = MarketDataBundle::default();
        assert!(bundle.ohlc_for("BTC").is_empty());
        assert!(bundle.closes("BTC").is_empty());
    }
}
