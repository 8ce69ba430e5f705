use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use common::{Direction, Signal, Strength};

/// How multiple strategies' signals for the same asset are merged into one
/// when they disagree on direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    WeightedAverage,
    Majority,
    HighestConfidence,
}

impl From<&str> for ConflictResolution {
    /// Any tag this doesn't recognize resolves to `WeightedAverage` — the
    /// aggregator always has a definite behavior, never a missing one.
    fn from(value: &str) -> Self {
        match value {
            "majority" => ConflictResolution::Majority,
            "highest_confidence" => ConflictResolution::HighestConfidence,
            _ => ConflictResolution::WeightedAverage,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalAggregatorConfig {
    #[serde(default = "default_conflict_resolution")]
    conflict_resolution: String,
    /// Per-strategy-name weight used by weighted merging. Strategies not
    /// listed default to a weight of `1.0`.
    #[serde(default)]
    pub strategy_weights: HashMap<String, f64>,
    /// Signals below this confidence are dropped before aggregation; a
    /// merged signal whose own confidence lands below it collapses to
    /// `Hold`.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Upper bound applied to the merged `position_size`.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
}

fn default_conflict_resolution() -> String {
    "weighted_average".to_string()
}

fn default_confidence_floor() -> f64 {
    0.3
}

fn default_max_position_size() -> f64 {
    1.0
}

impl Default for SignalAggregatorConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: default_conflict_resolution(),
            strategy_weights: HashMap::new(),
            confidence_floor: default_confidence_floor(),
            max_position_size: default_max_position_size(),
        }
    }
}

impl SignalAggregatorConfig {
    pub fn conflict_resolution(&self) -> ConflictResolution {
        ConflictResolution::from(self.conflict_resolution.as_str())
    }

    fn weight_for(&self, strategy_name: &str) -> f64 {
        self.strategy_weights.get(strategy_name).copied().unwrap_or(1.0)
    }
}

/// Merges per-strategy signals into at most one signal per asset.
///
/// Signals whose confidence sits below `confidence_floor` are dropped
/// before grouping — they never contribute to a merge. Within a surviving
/// group, signals that all agree on a (non-`Hold`) direction are merged by
/// renormalized-weight averaging; signals that disagree go through the
/// configured conflict resolution.
pub struct SignalAggregator {
    config: SignalAggregatorConfig,
}

impl SignalAggregator {
    pub fn new(config: SignalAggregatorConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, signals: Vec<Signal>) -> Vec<Signal> {
        let mut by_asset: HashMap<String, Vec<Signal>> = HashMap::new();
        for signal in signals {
            if signal.confidence < self.config.confidence_floor {
                continue;
            }
            by_asset.entry(signal.asset_id.clone()).or_default().push(signal);
        }

        let mut merged: Vec<Signal> = by_asset
            .into_values()
            .filter_map(|group| self.merge_group(group))
            .collect();
        merged.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        merged
    }

    fn merge_group(&self, group: Vec<Signal>) -> Option<Signal> {
        if group.is_empty() {
            return None;
        }
        if group.len() == 1 {
            let mut only = group.into_iter().next().unwrap();
            only.position_size = only.position_size.min(self.config.max_position_size);
            return Some(only);
        }

        let non_hold: Vec<&Signal> = group.iter().filter(|s| s.direction != Direction::Hold).collect();
        let agreement_direction = non_hold.first().map(|s| s.direction);
        let agrees = match agreement_direction {
            None => true,
            Some(direction) => non_hold.iter().all(|s| s.direction == direction),
        };

        let merged = if agrees {
            self.agree(&group, agreement_direction.unwrap_or(Direction::Hold))
        } else {
            match self.config.conflict_resolution() {
                ConflictResolution::WeightedAverage => self.weighted_average(&group),
                ConflictResolution::Majority => self.majority(&group),
                ConflictResolution::HighestConfidence => self.highest_confidence(&group),
            }
        };

        debug!(
            asset_id = %merged.asset_id,
            contributors = group.len(),
            direction = ?merged.direction,
            confidence = merged.confidence,
            "aggregated signal"
        );
        Some(merged)
    }

    /// All non-`Hold` signals in the group point the same way: merge by
    /// renormalized per-strategy weight (weights sum to 1 over the group).
    fn agree(&self, group: &[Signal], direction: Direction) -> Signal {
        let total_weight = self.total_weight(group);
        let reference_price = self.weighted_sum(group, total_weight, |s| s.reference_price);
        let confidence = self.weighted_sum(group, total_weight, |s| s.confidence);
        let position_size = self.weighted_sum(group, total_weight, |s| s.position_size);
        self.build_merged(group, direction, confidence, reference_price, position_size)
    }

    /// The group disagrees on direction: signed confidence = Σ weightᵢ ·
    /// confidenceᵢ · signᵢ, renormalized by total weight. `Hold` if the
    /// magnitude is below `confidence_floor`, else `Long`/`Short` with
    /// confidence equal to the magnitude.
    fn weighted_average(&self, group: &[Signal]) -> Signal {
        let total_weight = self.total_weight(group);
        let signed = self.weighted_sum(group, total_weight, |s| s.direction.sign() * s.confidence);

        let confidence = signed.abs();
        let direction = if confidence < self.config.confidence_floor {
            Direction::Hold
        } else if signed > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        let reference_price = self.weighted_sum(group, total_weight, |s| s.reference_price);
        let position_size = self.weighted_sum(group, total_weight, |s| s.position_size);
        self.build_merged(group, direction, confidence, reference_price, position_size)
    }

    fn majority(&self, group: &[Signal]) -> Signal {
        let mut votes: HashMap<Direction, usize> = HashMap::new();
        for s in group {
            *votes.entry(s.direction).or_default() += 1;
        }
        let direction = votes
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(dir, _)| dir)
            .unwrap_or(Direction::Hold);

        let agreeing: Vec<&Signal> = group.iter().filter(|s| s.direction == direction).collect();
        let (confidence, reference_price, position_size) = if agreeing.is_empty() {
            (0.0, group[0].reference_price, 0.0)
        } else {
            let n = agreeing.len() as f64;
            (
                agreeing.iter().map(|s| s.confidence).sum::<f64>() / n,
                agreeing.iter().map(|s| s.reference_price).sum::<f64>() / n,
                agreeing.iter().map(|s| s.position_size).sum::<f64>() / n,
            )
        };

        self.build_merged(group, direction, confidence, reference_price, position_size)
    }

    fn highest_confidence(&self, group: &[Signal]) -> Signal {
        let winner = group
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .expect("group is non-empty");
        self.build_merged(
            group,
            winner.direction,
            winner.confidence,
            winner.reference_price,
            winner.position_size,
        )
    }

    fn total_weight(&self, group: &[Signal]) -> f64 {
        let total: f64 = group.iter().map(|s| self.config.weight_for(&s.strategy_name)).sum();
        if total > 0.0 {
            total
        } else {
            group.len() as f64
        }
    }

    fn weighted_sum(&self, group: &[Signal], total_weight: f64, f: impl Fn(&Signal) -> f64) -> f64 {
        group
            .iter()
            .map(|s| self.config.weight_for(&s.strategy_name) * f(s))
            .sum::<f64>()
            / total_weight
    }

    fn build_merged(
        &self,
        group: &[Signal],
        direction: Direction,
        confidence: f64,
        reference_price: f64,
        position_size: f64,
    ) -> Signal {
        let last = group
            .iter()
            .max_by_key(|s| s.timestamp_ms)
            .expect("group is non-empty");

        let confidence = confidence.clamp(0.0, 1.0);
        let direction = if confidence < self.config.confidence_floor {
            Direction::Hold
        } else {
            direction
        };

        let strength = group
            .iter()
            .map(|s| s.strength)
            .fold(Strength::Weak, Strength::max);

        let position_size = position_size.min(self.config.max_position_size);
        let contributors: Vec<&str> = group.iter().map(|s| s.strategy_name.as_str()).collect();

        Signal {
            asset_id: last.asset_id.clone(),
            direction,
            timestamp_ms: last.timestamp_ms,
            reference_price,
            strategy_name: "aggregate".to_string(),
            strength,
            confidence,
            position_size,
            stop_loss: None,
            take_profit: None,
            max_risk: group.iter().filter_map(|s| s.max_risk).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.max(v)))
            }),
            analysis: json!({ "contributors": contributors }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn signal(strategy: &str, direction: Direction, confidence: f64) -> Signal {
        Signal {
            asset_id: "BTC".to_string(),
            direction,
            timestamp_ms: 1_700_000_000_000,
            reference_price: 100.0,
            strategy_name: strategy.to_string(),
            strength: Strength::Moderate,
            confidence,
            position_size: 0.5,
            stop_loss: None,
            take_profit: None,
            max_risk: None,
            analysis: Value::Null,
        }
    }

    #[test]
    fn single_signal_below_floor_is_dropped() {
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            confidence_floor: 0.5,
            ..Default::default()
        });
        let signals = vec![signal("rsi", Direction::Long, 0.2)];
        let merged = agg.aggregate(signals);
        assert!(merged.is_empty());
    }

    #[test]
    fn low_confidence_contributor_is_excluded_before_merge() {
        // "b" sits below the floor and must not pull the weighted sum
        // toward Short at all — it should be filtered out entirely, not
        // just down-weighted.
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            confidence_floor: 0.3,
            ..Default::default()
        });
        let signals = vec![
            signal("rsi", Direction::Long, 0.8),
            signal("volatility", Direction::Short, 0.1),
        ];
        let merged = agg.aggregate(signals);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].direction, Direction::Long);
        assert!((merged[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weighted_average_agrees_with_majority_direction() {
        let agg = SignalAggregator::new(SignalAggregatorConfig::default());
        let signals = vec![
            signal("rsi", Direction::Long, 0.8),
            signal("macd", Direction::Long, 0.6),
            signal("volatility", Direction::Short, 0.3),
        ];
        let merged = agg.aggregate(signals);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].direction, Direction::Long);
        assert_eq!(merged[0].strategy_name, "aggregate");
    }

    #[test]
    fn weighted_average_matches_scenario_d() {
        let mut strategy_weights = HashMap::new();
        strategy_weights.insert("a".to_string(), 0.6);
        strategy_weights.insert("b".to_string(), 0.4);
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            strategy_weights,
            confidence_floor: 0.1,
            ..Default::default()
        });
        let signals = vec![
            signal("a", Direction::Long, 0.9),
            signal("b", Direction::Short, 0.5),
        ];
        let merged = agg.aggregate(signals);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].direction, Direction::Long);
        assert!(
            (merged[0].confidence - 0.34).abs() < 1e-9,
            "expected confidence 0.34, got {}",
            merged[0].confidence
        );
    }

    #[test]
    fn agreeing_signals_use_weighted_mean_price() {
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            confidence_floor: 0.0,
            ..Default::default()
        });
        let mut a = signal("rsi", Direction::Long, 0.8);
        a.reference_price = 100.0;
        let mut b = signal("macd", Direction::Long, 0.6);
        b.reference_price = 200.0;
        let merged = agg.aggregate(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].direction, Direction::Long);
        assert!((merged[0].reference_price - 150.0).abs() < 1e-9);
    }

    #[test]
    fn majority_picks_most_common_direction() {
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            conflict_resolution: "majority".to_string(),
            ..Default::default()
        });
        let signals = vec![
            signal("a", Direction::Long, 0.9),
            signal("b", Direction::Short, 0.9),
            signal("c", Direction::Short, 0.9),
        ];
        let merged = agg.aggregate(signals);
        assert_eq!(merged[0].direction, Direction::Short);
    }

    #[test]
    fn unknown_conflict_resolution_falls_back_to_weighted_average() {
        let cfg = SignalAggregatorConfig {
            conflict_resolution: "something_unrecognized".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.conflict_resolution(), ConflictResolution::WeightedAverage);
    }

    #[test]
    fn position_size_is_capped() {
        let agg = SignalAggregator::new(SignalAggregatorConfig {
            max_position_size: 0.3,
            confidence_floor: 0.0,
            ..Default::default()
        });
        let signals = vec![
            signal("a", Direction::Long, 0.9),
            signal("b", Direction::Long, 0.9),
        ];
        let merged = agg.aggregate(signals);
        assert!((merged[0].position_size - 0.3).abs() < 1e-9);
    }
}
