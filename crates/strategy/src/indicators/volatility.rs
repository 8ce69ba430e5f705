/// Rolling realized volatility and its percentile rank within recent history.
///
/// Grounded on the reference implementation's volatility-percentile alerting:
/// volatility is the standard deviation of log returns over `window` candles,
/// and the "volatility percentile" is where today's volatility reading ranks
/// against the trailing `lookback` volatility readings.
#[derive(Debug, Clone)]
pub struct VolatilityIndicator {
    pub window: usize,
    pub lookback: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityReading {
    pub volatility: f64,
    pub percentile: f64,
}

impl VolatilityIndicator {
    pub fn new(window: usize, lookback: usize) -> Self {
        assert!(window >= 2, "volatility window must be >= 2");
        Self { window, lookback }
    }

    /// `closes` oldest-first. Needs at least `window + lookback` closes to
    /// produce a reading with a meaningful percentile.
    pub fn compute(&self, closes: &[f64]) -> Option<VolatilityReading> {
        if closes.len() < self.window + self.lookback {
            return None;
        }

        let returns = log_returns(closes);
        let rolling = rolling_stdev(&returns, self.window)?;
        if rolling.len() < self.lookback {
            return None;
        }

        let current = *rolling.last()?;
        let history = &rolling[rolling.len() - self.lookback..];
        let percentile = percentile_of_score(history, current);

        Some(VolatilityReading {
            volatility: current,
            percentile,
        })
    }
}

fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

fn rolling_stdev(series: &[f64], window: usize) -> Option<Vec<f64>> {
    if series.len() < window {
        return None;
    }
    Some(
        series
            .windows(window)
            .map(|w| {
                let mean = w.iter().sum::<f64>() / window as f64;
                let variance = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
                variance.sqrt()
            })
            .collect(),
    )
}

/// Percent of `history` at or below `value`, in `[0, 100]`.
fn percentile_of_score(history: &[f64], value: f64) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let at_or_below = history.iter().filter(|&&v| v <= value).count();
    100.0 * at_or_below as f64 / history.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_with_insufficient_data() {
        let ind = VolatilityIndicator::new(10, 20);
        let closes = vec![100.0; 15];
        assert!(ind.compute(&closes).is_none());
    }

    #[test]
    fn flat_series_has_zero_volatility() {
        let ind = VolatilityIndicator::new(5, 10);
        let closes = vec![100.0; 30];
        let reading = ind.compute(&closes).unwrap();
        assert!((reading.volatility - 0.0).abs() < 1e-9);
    }

    #[test]
    fn spike_ranks_at_top_percentile() {
        let ind = VolatilityIndicator::new(5, 10);
        let mut closes = vec![100.0; 30];
        // inject a sharp spike at the tail so the final rolling window is the
        // most volatile one observed
        let last = closes.len() - 1;
        closes[last] = 180.0;
        closes[last - 1] = 60.0;
        let reading = ind.compute(&closes).unwrap();
        assert!(reading.percentile >= 90.0, "expected top percentile, got {}", reading.percentile);
    }
}
