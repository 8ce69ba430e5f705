pub mod macd;
pub mod rsi;
pub mod volatility;

pub use macd::MacdIndicator;
pub use rsi::RsiIndicator;
pub use volatility::VolatilityIndicator;
