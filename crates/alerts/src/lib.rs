use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use common::{AlertRecord, Direction, PositionDirection, Signal};

/// Builds and persists `AlertRecord`s from signals whose analysis payload
/// carries a volatility percentile past the configured threshold.
///
/// Grounded on the reference implementation's JSON alert system: one file
/// per alert, named `volatility_alert_{asset}_{YYYYMMDD_HHMMSS}.json`, plus
/// a retention sweep that deletes files older than a configured window.
pub struct AlertBuilder {
    alert_dir: PathBuf,
    threshold_percentile: f64,
    enabled_assets: Vec<String>,
}

impl AlertBuilder {
    pub fn new(
        alert_dir: impl Into<PathBuf>,
        threshold_percentile: f64,
        enabled_assets: Vec<String>,
    ) -> Self {
        Self {
            alert_dir: alert_dir.into(),
            threshold_percentile,
            enabled_assets,
        }
    }

    /// Build an `AlertRecord` from `signal` if (a) its asset is on the
    /// enabled-asset whitelist and (b) its analysis carries a
    /// `volatility_percentile` at or above the configured threshold.
    /// Signals without that field (RSI/MACD signals, for instance) never
    /// produce an alert.
    pub fn build(&self, signal: &Signal) -> Option<AlertRecord> {
        if !self.enabled_assets.iter().any(|a| a == &signal.asset_id) {
            return None;
        }
        let percentile = signal.analysis.get("volatility_percentile")?.as_f64()?;
        if percentile < self.threshold_percentile {
            return None;
        }
        let metric_value = signal
            .analysis
            .get("volatility")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let threshold_value = signal
            .analysis
            .get("volatility_threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(self.threshold_percentile);

        Some(AlertRecord {
            timestamp_ms: signal.timestamp_ms,
            asset_id: signal.asset_id.clone(),
            current_price: signal.reference_price,
            metric_value,
            threshold_value,
            percentile,
            position_direction: determine_position_direction(signal.direction, percentile),
            signal_direction: signal.direction,
            alert_kind: "volatility_spike".to_string(),
            threshold_exceeded: percentile >= self.threshold_percentile,
        })
    }

    /// `build` for every signal in `signals`, dropping the ones that don't
    /// qualify.
    pub fn build_all(&self, signals: &[Signal]) -> Vec<AlertRecord> {
        signals.iter().filter_map(|s| self.build(s)).collect()
    }

    pub fn save(&self, alert: &AlertRecord) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.alert_dir)?;
        let path = self.alert_dir.join(alert_filename(alert));
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, alert)?;
        info!(path = %path.display(), "alert saved");
        Ok(path)
    }

    pub fn save_all(&self, alerts: &[AlertRecord]) -> Vec<PathBuf> {
        alerts
            .iter()
            .filter_map(|a| match self.save(a) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(asset_id = %a.asset_id, error = %e, "failed to save alert");
                    None
                }
            })
            .collect()
    }

    /// Alerts written in the last `hours`, newest first.
    pub fn recent(&self, hours: i64) -> Vec<AlertRecord> {
        let cutoff_ms = (Utc::now() - chrono::Duration::hours(hours)).timestamp_millis();
        let mut alerts = self.read_all();
        alerts.retain(|a| a.timestamp_ms >= cutoff_ms);
        alerts.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        alerts
    }

    /// Delete alert files older than `days`. Returns the number deleted.
    pub fn clear_older_than(&self, days: i64) -> usize {
        let cutoff_ms = (Utc::now() - chrono::Duration::days(days)).timestamp_millis();
        let mut deleted = 0;
        let Ok(entries) = fs::read_dir(&self.alert_dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_alert_file(&path) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(alert) = serde_json::from_str::<AlertRecord>(&content) else {
                continue;
            };
            if alert.timestamp_ms < cutoff_ms {
                if fs::remove_file(&path).is_ok() {
                    deleted += 1;
                    debug!(path = %path.display(), "deleted old alert");
                }
            }
        }
        info!(deleted, "cleared old alerts");
        deleted
    }

    fn read_all(&self) -> Vec<AlertRecord> {
        let Ok(entries) = fs::read_dir(&self.alert_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_alert_file(p))
            .filter_map(|p| fs::read_to_string(&p).ok())
            .filter_map(|content| match serde_json::from_str(&content) {
                Ok(alert) => Some(alert),
                Err(e) => {
                    warn!(error = %e, "skipping malformed alert file");
                    None
                }
            })
            .collect()
    }
}

fn is_alert_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("volatility_alert_") && n.ends_with(".json"))
        .unwrap_or(false)
}

fn alert_filename(alert: &AlertRecord) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(alert.timestamp_ms).unwrap_or_else(Utc::now);
    format!(
        "volatility_alert_{}_{}.json",
        alert.asset_id,
        dt.format("%Y%m%d_%H%M%S")
    )
}

/// Maps a signal direction and its volatility percentile to the
/// position-direction vocabulary alerts are reported in.
fn determine_position_direction(direction: Direction, percentile: f64) -> PositionDirection {
    match direction {
        Direction::Long => {
            if percentile >= 95.0 {
                PositionDirection::StrongBuy
            } else if percentile >= 90.0 {
                PositionDirection::Buy
            } else {
                PositionDirection::WeakBuy
            }
        }
        Direction::Short => {
            if percentile >= 98.0 {
                PositionDirection::StrongSell
            } else if percentile >= 95.0 {
                PositionDirection::Sell
            } else {
                PositionDirection::WeakSell
            }
        }
        Direction::Hold => PositionDirection::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn volatility_signal(direction: Direction, percentile: f64) -> Signal {
        Signal {
            asset_id: "BTC".to_string(),
            direction,
            timestamp_ms: Utc::now().timestamp_millis(),
            reference_price: 42_000.0,
            strategy_name: "vol-90".to_string(),
            strength: common::Strength::Strong,
            confidence: 0.9,
            position_size: 0.0,
            stop_loss: None,
            take_profit: None,
            max_risk: None,
            analysis: json!({
                "volatility_percentile": percentile,
                "volatility": 0.04,
                "volatility_threshold": 80.0,
            }),
        }
    }

    #[test]
    fn signal_without_volatility_field_yields_no_alert() {
        let builder = AlertBuilder::new("/tmp/does-not-matter", 80.0, vec!["BTC".to_string()]);
        let signal = Signal {
            analysis: json!({}),
            ..volatility_signal(Direction::Hold, 99.0)
        };
        assert!(builder.build(&signal).is_none());
    }

    #[test]
    fn asset_not_on_whitelist_yields_no_alert() {
        let builder = AlertBuilder::new("/tmp/does-not-matter", 80.0, vec!["ETH".to_string()]);
        let signal = volatility_signal(Direction::Long, 96.0);
        assert!(builder.build(&signal).is_none());
    }

    #[test]
    fn below_threshold_yields_no_alert() {
        let builder = AlertBuilder::new("/tmp/does-not-matter", 80.0, vec!["BTC".to_string()]);
        let signal = volatility_signal(Direction::Long, 70.0);
        assert!(builder.build(&signal).is_none());
    }

    #[test]
    fn strong_buy_at_high_percentile() {
        let builder = AlertBuilder::new("/tmp/does-not-matter", 80.0, vec!["BTC".to_string()]);
        let signal = volatility_signal(Direction::Long, 96.0);
        let alert = builder.build(&signal).unwrap();
        assert_eq!(alert.position_direction, PositionDirection::StrongBuy);
        assert!(alert.threshold_exceeded);
    }

    #[test]
    fn weak_sell_just_above_threshold() {
        let builder = AlertBuilder::new("/tmp/does-not-matter", 80.0, vec!["BTC".to_string()]);
        let signal = volatility_signal(Direction::Short, 82.0);
        let alert = builder.build(&signal).unwrap();
        assert_eq!(alert.position_direction, PositionDirection::WeakSell);
    }

    #[test]
    fn save_and_recover_round_trip() {
        let dir = std::env::temp_dir().join(format!("marketsignal-alerts-test-{}", std::process::id()));
        let builder = AlertBuilder::new(&dir, 80.0, vec!["BTC".to_string()]);
        let signal = volatility_signal(Direction::Long, 95.0);
        let alert = builder.build(&signal).unwrap();
        builder.save(&alert).unwrap();

        let recent = builder.recent(24);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].asset_id, "BTC");

        let _ = fs::remove_dir_all(&dir);
    }
}
