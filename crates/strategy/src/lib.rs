pub mod config;
pub mod indicators;
pub mod registry;

pub use config::{StrategyConfig, StrategyFileConfig};
pub use registry::StrategyRegistry;

use common::{MarketDataBundle, Signal};

/// Opaque per-strategy analysis output, threaded from `analyze` into
/// `generate_signals`. A dynamic JSON value, the same idiom
/// `StrategyConfig::params` already uses for per-strategy-shaped data.
pub type AnalysisResult = serde_json::Value;

/// All strategy implementations must satisfy this trait.
pub trait Strategy: Send + Sync {
    /// Human-readable name of this strategy instance, carried through to
    /// `Signal::strategy_name`.
    fn name(&self) -> &str;

    /// Install this strategy instance's configuration. Called exactly
    /// once, at load time, before `analyze` or `generate_signals` ever run.
    fn configure(&mut self, config: &StrategyConfig);

    /// Assets this strategy instance evaluates.
    fn declared_assets(&self) -> Vec<String>;

    /// Evaluate the current market-data window, producing an opaque
    /// result consumed only by this same strategy's `generate_signals`.
    /// Strategies never see an asset they didn't declare.
    fn analyze(&self, bundle: &MarketDataBundle) -> AnalysisResult;

    /// Turn a prior `analyze` result into zero or more signals, at most
    /// one per declared asset.
    fn generate_signals(&self, analysis: &AnalysisResult) -> Vec<Signal>;
}
