use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::json;
use tracing::{info, warn};

use common::{Direction, MarketDataBundle, Signal, Strength};

use crate::config::{param_f64, param_usize, StrategyConfig, StrategyFileConfig};
use crate::indicators::{macd::MacdSignal, MacdIndicator, RsiIndicator, VolatilityIndicator};
use crate::{AnalysisResult, Strategy};

/// Holds all configured strategy instances and fans a market-data bundle
/// out to each of them, one generation round at a time.
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Build the registry from config, panicking on an unknown strategy
    /// type — a misconfigured deployment should fail at startup, not run
    /// silently short a strategy.
    pub fn from_config(file_cfg: &StrategyFileConfig) -> Self {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();

        for cfg in &file_cfg.strategies {
            let strategy = build_strategy(cfg)
                .unwrap_or_else(|e| panic!("Unknown strategy type '{}': {e}", cfg.strategy_type));
            info!(name = %strategy.name(), assets = ?strategy.declared_assets(), "Registered strategy");
            strategies.push(strategy);
        }

        Self { strategies }
    }

    /// Every asset any registered strategy declares, deduplicated — what
    /// the scheduler needs to fetch before a generation round can run.
    pub fn all_declared_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self
            .strategies
            .iter()
            .flat_map(|s| s.declared_assets())
            .collect();
        assets.sort();
        assets.dedup();
        assets
    }

    /// Run every strategy's `analyze`/`generate_signals` pair against
    /// `bundle` and collect all signals. Each phase is isolated: a
    /// strategy that panics in either phase contributes zero signals and
    /// every other strategy still runs.
    pub fn generate_all(&self, bundle: &MarketDataBundle) -> Vec<Signal> {
        let mut signals = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name().to_string();

            let analysis = match catch_unwind(AssertUnwindSafe(|| strategy.analyze(bundle))) {
                Ok(a) => a,
                Err(_) => {
                    warn!(strategy = %name, "strategy panicked during analysis, skipping");
                    continue;
                }
            };

            let result = catch_unwind(AssertUnwindSafe(|| strategy.generate_signals(&analysis)));
            match result {
                Ok(mut s) => {
                    for signal in &mut s {
                        signal.clamp_confidence();
                    }
                    signals.extend(s);
                }
                Err(_) => {
                    warn!(strategy = %name, "strategy panicked during signal generation, skipping");
                }
            }
        }
        signals
    }
}

fn build_strategy(cfg: &StrategyConfig) -> Result<Box<dyn Strategy>, String> {
    let mut strategy: Box<dyn Strategy> = match cfg.strategy_type.as_str() {
        "rsi" => {
            let period = param_usize(&cfg.params, "period", 14);
            let overbought = param_f64(&cfg.params, "overbought", 70.0);
            let oversold = param_f64(&cfg.params, "oversold", 30.0);
            Box::new(RsiStrategy::new(cfg.clone(), period, overbought, oversold))
        }
        "macd" => {
            let fast = param_usize(&cfg.params, "fast", 12);
            let slow = param_usize(&cfg.params, "slow", 26);
            let signal = param_usize(&cfg.params, "signal", 9);
            Box::new(MacdStrategy::new(cfg.clone(), fast, slow, signal))
        }
        "volatility" => {
            let window = param_usize(&cfg.params, "window", 20);
            let lookback = param_usize(&cfg.params, "lookback", 60);
            let threshold_percentile = param_f64(&cfg.params, "threshold_percentile", 80.0);
            Box::new(VolatilityStrategy::new(
                cfg.clone(),
                window,
                lookback,
                threshold_percentile,
            ))
        }
        other => return Err(format!("unknown type '{other}'")),
    };
    strategy.configure(cfg);
    Ok(strategy)
}

// ─── Concrete strategy types ────────────────────────────────────────────────

struct RsiStrategy {
    cfg: StrategyConfig,
    indicator: RsiIndicator,
}

impl RsiStrategy {
    fn new(cfg: StrategyConfig, period: usize, overbought: f64, oversold: f64) -> Self {
        Self {
            cfg,
            indicator: RsiIndicator::new(period, overbought, oversold),
        }
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn configure(&mut self, config: &StrategyConfig) {
        self.cfg = config.clone();
    }

    fn declared_assets(&self) -> Vec<String> {
        self.cfg.assets.clone()
    }

    fn analyze(&self, bundle: &MarketDataBundle) -> AnalysisResult {
        let mut out = serde_json::Map::new();
        for asset_id in &self.cfg.assets {
            let closes = bundle.closes(asset_id);
            let Some(rsi) = self.indicator.compute(&closes) else {
                continue;
            };
            let Some(last) = bundle.ohlc_for(asset_id).last() else {
                continue;
            };
            out.insert(
                asset_id.clone(),
                json!({
                    "rsi": rsi,
                    "last_close": last.close,
                    "last_timestamp_ms": last.timestamp_ms,
                }),
            );
        }
        AnalysisResult::Object(out)
    }

    fn generate_signals(&self, analysis: &AnalysisResult) -> Vec<Signal> {
        let Some(map) = analysis.as_object() else {
            return Vec::new();
        };
        self.cfg
            .assets
            .iter()
            .filter_map(|asset_id| {
                let entry = map.get(asset_id)?;
                let rsi = entry.get("rsi")?.as_f64()?;
                let last_close = entry.get("last_close")?.as_f64()?;
                let last_timestamp_ms = entry.get("last_timestamp_ms")?.as_i64()?;

                let (direction, strength) = if rsi <= self.indicator.oversold {
                    (Direction::Long, Strength::Moderate)
                } else if rsi >= self.indicator.overbought {
                    (Direction::Short, Strength::Moderate)
                } else {
                    return None;
                };

                Some(Signal {
                    asset_id: asset_id.clone(),
                    direction,
                    timestamp_ms: last_timestamp_ms,
                    reference_price: last_close,
                    strategy_name: self.cfg.name.clone(),
                    strength,
                    confidence: rsi_confidence(rsi, self.indicator.oversold, self.indicator.overbought),
                    position_size: 1.0,
                    stop_loss: None,
                    take_profit: None,
                    max_risk: None,
                    analysis: json!({ "rsi": rsi, "period": self.indicator.period }),
                })
            })
            .collect()
    }
}

/// Confidence scales with how far RSI sits past its threshold, saturating
/// at 1.0 at the opposite extreme (0 or 100).
fn rsi_confidence(rsi: f64, oversold: f64, overbought: f64) -> f64 {
    if rsi <= oversold {
        ((oversold - rsi) / oversold.max(1.0)).clamp(0.0, 1.0)
    } else {
        ((rsi - overbought) / (100.0 - overbought).max(1.0)).clamp(0.0, 1.0)
    }
}

struct MacdStrategy {
    cfg: StrategyConfig,
    indicator: MacdIndicator,
}

impl MacdStrategy {
    fn new(cfg: StrategyConfig, fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            cfg,
            indicator: MacdIndicator::new(fast, slow, signal),
        }
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn configure(&mut self, config: &StrategyConfig) {
        self.cfg = config.clone();
    }

    fn declared_assets(&self) -> Vec<String> {
        self.cfg.assets.clone()
    }

    fn analyze(&self, bundle: &MarketDataBundle) -> AnalysisResult {
        let mut out = serde_json::Map::new();
        for asset_id in &self.cfg.assets {
            let closes = bundle.closes(asset_id);
            let Some(last) = bundle.ohlc_for(asset_id).last() else {
                continue;
            };
            let Some(macd_signal) = self.indicator.compute(&closes) else {
                continue;
            };
            out.insert(
                asset_id.clone(),
                json!({
                    "crossover": format!("{macd_signal:?}"),
                    "last_close": last.close,
                    "last_timestamp_ms": last.timestamp_ms,
                }),
            );
        }
        AnalysisResult::Object(out)
    }

    fn generate_signals(&self, analysis: &AnalysisResult) -> Vec<Signal> {
        let Some(map) = analysis.as_object() else {
            return Vec::new();
        };
        self.cfg
            .assets
            .iter()
            .filter_map(|asset_id| {
                let entry = map.get(asset_id)?;
                let crossover = entry.get("crossover")?.as_str()?;
                let last_close = entry.get("last_close")?.as_f64()?;
                let last_timestamp_ms = entry.get("last_timestamp_ms")?.as_i64()?;

                let (direction, strength) = match crossover {
                    "Bullish" => (Direction::Long, Strength::Strong),
                    "Bearish" => (Direction::Short, Strength::Strong),
                    _ => return None,
                };

                Some(Signal {
                    asset_id: asset_id.clone(),
                    direction,
                    timestamp_ms: last_timestamp_ms,
                    reference_price: last_close,
                    strategy_name: self.cfg.name.clone(),
                    strength,
                    confidence: 0.7,
                    position_size: 1.0,
                    stop_loss: None,
                    take_profit: None,
                    max_risk: None,
                    analysis: json!({ "crossover": crossover }),
                })
            })
            .collect()
    }
}

struct VolatilityStrategy {
    cfg: StrategyConfig,
    indicator: VolatilityIndicator,
    threshold_percentile: f64,
}

impl VolatilityStrategy {
    fn new(cfg: StrategyConfig, window: usize, lookback: usize, threshold_percentile: f64) -> Self {
        Self {
            cfg,
            indicator: VolatilityIndicator::new(window, lookback),
            threshold_percentile,
        }
    }
}

impl Strategy for VolatilityStrategy {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn configure(&mut self, config: &StrategyConfig) {
        self.cfg = config.clone();
    }

    fn declared_assets(&self) -> Vec<String> {
        self.cfg.assets.clone()
    }

    fn analyze(&self, bundle: &MarketDataBundle) -> AnalysisResult {
        let mut out = serde_json::Map::new();
        for asset_id in &self.cfg.assets {
            let closes = bundle.closes(asset_id);
            let Some(last) = bundle.ohlc_for(asset_id).last() else {
                continue;
            };
            let Some(reading) = self.indicator.compute(&closes) else {
                continue;
            };
            if reading.percentile < self.threshold_percentile {
                continue;
            }
            out.insert(
                asset_id.clone(),
                json!({
                    "volatility_percentile": reading.percentile,
                    "volatility": reading.volatility,
                    "volatility_threshold": self.threshold_percentile,
                    "last_close": last.close,
                    "last_timestamp_ms": last.timestamp_ms,
                }),
            );
        }
        AnalysisResult::Object(out)
    }

    fn generate_signals(&self, analysis: &AnalysisResult) -> Vec<Signal> {
        let Some(map) = analysis.as_object() else {
            return Vec::new();
        };
        self.cfg
            .assets
            .iter()
            .filter_map(|asset_id| {
                let entry = map.get(asset_id)?;
                let percentile = entry.get("volatility_percentile")?.as_f64()?;
                let volatility = entry.get("volatility")?.as_f64()?;
                let threshold = entry.get("volatility_threshold")?.as_f64()?;
                let last_close = entry.get("last_close")?.as_f64()?;
                let last_timestamp_ms = entry.get("last_timestamp_ms")?.as_i64()?;

                Some(Signal {
                    asset_id: asset_id.clone(),
                    direction: Direction::Hold,
                    timestamp_ms: last_timestamp_ms,
                    reference_price: last_close,
                    strategy_name: self.cfg.name.clone(),
                    strength: Strength::Strong,
                    confidence: (percentile / 100.0).clamp(0.0, 1.0),
                    position_size: 0.0,
                    stop_loss: None,
                    take_profit: None,
                    max_risk: None,
                    analysis: json!({
                        "volatility_percentile": percentile,
                        "volatility": volatility,
                        "volatility_threshold": threshold,
                    }),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OhlcRow;
    use std::collections::HashMap;

    fn bundle_with_closes(asset: &str, closes: &[f64]) -> MarketDataBundle {
        let mut ohlc = HashMap::new();
        let rows: Vec<OhlcRow> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| OhlcRow::new(asset, i as i64 * 60_000, c, c, c, c, 1.0))
            .collect();
        ohlc.insert(asset.to_string(), rows);
        MarketDataBundle {
            ohlc,
            macro_series: HashMap::new(),
        }
    }

    #[test]
    fn rsi_strategy_emits_long_on_oversold() {
        let cfg = StrategyConfig {
            strategy_type: "rsi".to_string(),
            name: "test-rsi".to_string(),
            assets: vec!["BTC".to_string()],
            params: HashMap::new(),
        };
        let strat = RsiStrategy::new(cfg, 3, 70.0, 30.0);
        let closes = vec![14.0, 13.0, 12.0, 11.0, 10.0];
        let bundle = bundle_with_closes("BTC", &closes);
        let analysis = strat.analyze(&bundle);
        let signals = strat.generate_signals(&analysis);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Long);
    }

    #[test]
    fn configure_replaces_initial_cfg() {
        let initial = StrategyConfig {
            strategy_type: "rsi".to_string(),
            name: "placeholder".to_string(),
            assets: vec![],
            params: HashMap::new(),
        };
        let mut strat = RsiStrategy::new(initial, 3, 70.0, 30.0);
        let real = StrategyConfig {
            strategy_type: "rsi".to_string(),
            name: "BTC RSI".to_string(),
            assets: vec!["BTC".to_string()],
            params: HashMap::new(),
        };
        strat.configure(&real);
        assert_eq!(strat.name(), "BTC RSI");
        assert_eq!(strat.declared_assets(), vec!["BTC".to_string()]);
    }

    #[test]
    fn registry_isolates_panicking_strategy() {
        struct PanicStrategy;
        impl Strategy for PanicStrategy {
            fn name(&self) -> &str {
                "panics"
            }
            fn configure(&mut self, _config: &StrategyConfig) {}
            fn declared_assets(&self) -> Vec<String> {
                vec![]
            }
            fn analyze(&self, _bundle: &MarketDataBundle) -> AnalysisResult {
                panic!("boom")
            }
            fn generate_signals(&self, _analysis: &AnalysisResult) -> Vec<Signal> {
                Vec::new()
            }
        }

        let registry = StrategyRegistry {
            strategies: vec![Box::new(PanicStrategy)],
        };
        let bundle = bundle_with_closes("BTC", &[1.0, 2.0, 3.0]);
        let signals = registry.generate_all(&bundle);
        assert!(signals.is_empty());
    }

    #[test]
    fn registry_isolates_strategy_panicking_in_generate_signals() {
        struct PanicsInGenerate;
        impl Strategy for PanicsInGenerate {
            fn name(&self) -> &str {
                "panics-late"
            }
            fn configure(&mut self, _config: &StrategyConfig) {}
            fn declared_assets(&self) -> Vec<String> {
                vec![]
            }
            fn analyze(&self, _bundle: &MarketDataBundle) -> AnalysisResult {
                json!({})
            }
            fn generate_signals(&self, _analysis: &AnalysisResult) -> Vec<Signal> {
                panic!("boom")
            }
        }

        let registry = StrategyRegistry {
            strategies: vec![Box::new(PanicsInGenerate)],
        };
        let bundle = bundle_with_closes("BTC", &[1.0, 2.0, 3.0]);
        let signals = registry.generate_all(&bundle);
        assert!(signals.is_empty());
    }
}
