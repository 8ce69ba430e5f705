use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use common::{Signal, Strength};

/// One webhook destination: a URL plus the filters a signal must pass
/// before it's delivered there. The aggregate sink has no asset allowlist;
/// per-strategy sinks are typically scoped to the strategies a subscriber
/// cares about.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub name: String,
    pub url: String,
    pub min_confidence: f64,
    pub min_strength: Strength,
    pub assets: Option<Vec<String>>,
    pub rate_limit: Duration,
}

impl SinkConfig {
    fn accepts(&self, signal: &Signal) -> bool {
        if signal.confidence < self.min_confidence {
            return false;
        }
        if signal.strength.max(self.min_strength) != signal.strength {
            return false;
        }
        if let Some(assets) = &self.assets {
            if !assets.iter().any(|a| a == &signal.asset_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Delivered,
    Filtered,
    RateLimited,
    Failed,
}

struct SinkState {
    last_success: Mutex<Option<Instant>>,
    failure_count: Mutex<u32>,
}

impl Default for SinkState {
    fn default() -> Self {
        Self {
            last_success: Mutex::new(None),
            failure_count: Mutex::new(0),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    asset_id: &'a str,
    direction: String,
    strategy_name: &'a str,
    strength: String,
    confidence: f64,
    reference_price: f64,
    timestamp_ms: i64,
    analysis: &'a serde_json::Value,
}

/// Fans a signal out to every configured sink whose filters it passes,
/// respecting a per-sink rate limit. Delivery failures on one sink never
/// affect another; each send is independent. Delivery is never retried —
/// a failure is logged and counted, not repeated.
///
/// Two dispatch channels: `dispatch` sends an aggregated signal to every
/// configured aggregate sink; `dispatch_strategy` sends a per-strategy
/// signal to that one strategy's own sink, if one is configured for it.
pub struct WebhookDispatcher {
    http: Client,
    sinks: Vec<(SinkConfig, Arc<SinkState>)>,
    strategy_sinks: HashMap<String, (SinkConfig, Arc<SinkState>)>,
}

impl WebhookDispatcher {
    pub fn new(sinks: Vec<SinkConfig>, strategy_sinks: HashMap<String, SinkConfig>) -> Self {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        let sinks = sinks
            .into_iter()
            .map(|cfg| (cfg, Arc::new(SinkState::default())))
            .collect();
        let strategy_sinks = strategy_sinks
            .into_iter()
            .map(|(strategy_name, cfg)| (strategy_name, (cfg, Arc::new(SinkState::default()))))
            .collect();
        Self {
            http,
            sinks,
            strategy_sinks,
        }
    }

    /// Send `signal` to every aggregate sink that accepts it. Returns one
    /// outcome per configured sink, in configuration order.
    pub async fn dispatch(&self, signal: &Signal) -> Vec<SinkOutcome> {
        let mut handles = Vec::with_capacity(self.sinks.len());
        for (cfg, state) in &self.sinks {
            let http = self.http.clone();
            let cfg = cfg.clone();
            let state = state.clone();
            let signal = signal.clone();
            handles.push(tokio::spawn(async move {
                dispatch_one(&http, &cfg, &state, &signal).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await.unwrap_or(SinkOutcome::Failed));
        }
        outcomes
    }

    /// Send `signal` to the sink configured for its originating strategy,
    /// if any. Returns `None` when no sink is configured for that strategy.
    pub async fn dispatch_strategy(&self, signal: &Signal) -> Option<SinkOutcome> {
        let (cfg, state) = self.strategy_sinks.get(&signal.strategy_name)?;
        Some(dispatch_one(&self.http, cfg, state, signal).await)
    }
}

async fn dispatch_one(http: &Client, cfg: &SinkConfig, state: &SinkState, signal: &Signal) -> SinkOutcome {
    if !cfg.accepts(signal) {
        return SinkOutcome::Filtered;
    }

    let rate_limited = {
        let last = state.last_success.lock().await;
        last.map(|t| t.elapsed() < cfg.rate_limit).unwrap_or(false)
    };
    if rate_limited {
        debug!(sink = %cfg.name, "sink rate-limited, skipping");
        return SinkOutcome::RateLimited;
    }

    send_one(http, cfg, state, signal).await
}

async fn send_one(http: &Client, cfg: &SinkConfig, state: &SinkState, signal: &Signal) -> SinkOutcome {
    let payload = WebhookPayload {
        asset_id: &signal.asset_id,
        direction: format!("{:?}", signal.direction),
        strategy_name: &signal.strategy_name,
        strength: format!("{:?}", signal.strength),
        confidence: signal.confidence,
        reference_price: signal.reference_price,
        timestamp_ms: signal.timestamp_ms,
        analysis: &signal.analysis,
    };

    let result = http.post(&cfg.url).json(&payload).send().await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            *state.last_success.lock().await = Some(Instant::now());
            *state.failure_count.lock().await = 0;
            SinkOutcome::Delivered
        }
        Ok(resp) => {
            let mut failures = state.failure_count.lock().await;
            *failures += 1;
            warn!(sink = %cfg.name, status = %resp.status(), failures = *failures, "webhook delivery rejected");
            SinkOutcome::Failed
        }
        Err(e) => {
            let mut failures = state.failure_count.lock().await;
            *failures += 1;
            error!(sink = %cfg.name, error = %e, failures = *failures, "webhook delivery failed");
            SinkOutcome::Failed
        }
    }
}

/// Per-sink failure counters, keyed by sink name, for diagnostics.
pub async fn failure_counts(dispatcher: &WebhookDispatcher) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for (cfg, state) in &dispatcher.sinks {
        counts.insert(cfg.name.clone(), *state.failure_count.lock().await);
    }
    for (cfg, state) in dispatcher.strategy_sinks.values() {
        counts.insert(cfg.name.clone(), *state.failure_count.lock().await);
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Direction;
    use serde_json::Value;

    fn signal(confidence: f64, strength: Strength, asset_id: &str) -> Signal {
        Signal {
            asset_id: asset_id.to_string(),
            direction: Direction::Long,
            timestamp_ms: 1_700_000_000_000,
            reference_price: 100.0,
            strategy_name: "rsi".to_string(),
            strength,
            confidence,
            position_size: 0.5,
            stop_loss: None,
            take_profit: None,
            max_risk: None,
            analysis: Value::Null,
        }
    }

    #[tokio::test]
    async fn filters_low_confidence_signal() {
        let dispatcher = WebhookDispatcher::new(
            vec![SinkConfig {
                name: "aggregate".to_string(),
                url: "http://127.0.0.1:1/webhook".to_string(),
                min_confidence: 0.8,
                min_strength: Strength::Weak,
                assets: None,
                rate_limit: Duration::from_secs(60),
            }],
            HashMap::new(),
        );
        let outcomes = dispatcher.dispatch(&signal(0.2, Strength::Strong, "BTC")).await;
        assert_eq!(outcomes, vec![SinkOutcome::Filtered]);
    }

    #[tokio::test]
    async fn filters_asset_not_in_allowlist() {
        let dispatcher = WebhookDispatcher::new(
            vec![SinkConfig {
                name: "eth-only".to_string(),
                url: "http://127.0.0.1:1/webhook".to_string(),
                min_confidence: 0.0,
                min_strength: Strength::Weak,
                assets: Some(vec!["ETH".to_string()]),
                rate_limit: Duration::from_secs(60),
            }],
            HashMap::new(),
        );
        let outcomes = dispatcher.dispatch(&signal(0.9, Strength::Strong, "BTC")).await;
        assert_eq!(outcomes, vec![SinkOutcome::Filtered]);
    }

    #[tokio::test]
    async fn unreachable_sink_reports_failed() {
        let dispatcher = WebhookDispatcher::new(
            vec![SinkConfig {
                name: "down".to_string(),
                url: "http://127.0.0.1:1/webhook".to_string(),
                min_confidence: 0.0,
                min_strength: Strength::Weak,
                assets: None,
                rate_limit: Duration::from_secs(60),
            }],
            HashMap::new(),
        );
        let outcomes = dispatcher.dispatch(&signal(0.9, Strength::Strong, "BTC")).await;
        assert_eq!(outcomes, vec![SinkOutcome::Failed]);
    }

    /// Scenario E: a sink that already delivered once must suppress a
    /// second delivery inside its rate-limit window, rather than attempting
    /// (and failing, or double-counting) it. We seed `last_success` directly
    /// since the dispatched endpoint here never actually succeeds.
    #[tokio::test]
    async fn second_delivery_within_window_is_rate_limited() {
        let cfg = SinkConfig {
            name: "aggregate".to_string(),
            url: "http://127.0.0.1:1/webhook".to_string(),
            min_confidence: 0.0,
            min_strength: Strength::Weak,
            assets: None,
            rate_limit: Duration::from_millis(200),
        };
        let state = Arc::new(SinkState::default());
        let http = Client::builder().use_rustls_tls().build().unwrap();

        *state.last_success.lock().await = Some(Instant::now());

        let sig = signal(0.9, Strength::Strong, "BTC");
        let outcome = dispatch_one(&http, &cfg, &state, &sig).await;
        assert_eq!(outcome, SinkOutcome::RateLimited);
        assert_eq!(*state.failure_count.lock().await, 0);

        *state.last_success.lock().await = Some(Instant::now() - Duration::from_millis(250));
        let outcome = dispatch_one(&http, &cfg, &state, &sig).await;
        assert_ne!(outcome, SinkOutcome::RateLimited);
    }

    #[tokio::test]
    async fn dispatch_strategy_routes_by_strategy_name() {
        let mut strategy_sinks = HashMap::new();
        strategy_sinks.insert(
            "rsi".to_string(),
            SinkConfig {
                name: "rsi-sink".to_string(),
                url: "http://127.0.0.1:1/webhook".to_string(),
                min_confidence: 0.0,
                min_strength: Strength::Weak,
                assets: None,
                rate_limit: Duration::from_secs(60),
            },
        );
        let dispatcher = WebhookDispatcher::new(vec![], strategy_sinks);

        let outcome = dispatcher.dispatch_strategy(&signal(0.9, Strength::Strong, "BTC")).await;
        assert_eq!(outcome, Some(SinkOutcome::Failed));

        let mut other = signal(0.9, Strength::Strong, "BTC");
        other.strategy_name = "macd".to_string();
        assert_eq!(dispatcher.dispatch_strategy(&other).await, None);
    }
}
