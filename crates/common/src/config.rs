use std::collections::HashMap;
use std::time::Duration;

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message,
/// matching the fail-fast behavior of a misconfigured deployment.
#[derive(Debug, Clone)]
pub struct Config {
    // Upstream providers
    pub upstream_api_key: Option<String>,
    pub macro_api_key: Option<String>,
    pub crypto_base_url: String,
    pub macro_base_url: String,

    // Webhook (aggregate channel). Unset `WEBHOOK_URL` disables dispatch.
    pub webhook_url: Option<String>,
    pub webhook_min_confidence: f64,
    pub webhook_min_strength: crate::Strength,
    pub webhook_rate_limit: Duration,

    // Storage / strategy config
    pub database_url: String,
    pub strategy_config_path: String,
    pub alert_dir: String,
    pub state_file: String,

    // Scheduler
    pub macro_collection_time: String,
    pub signal_generation_interval: Duration,
    pub max_retries_per_task: u32,
    pub max_upstream_concurrency: usize,

    // Task universe
    pub high_frequency_assets: Vec<String>,
    pub hourly_assets: Vec<String>,
    pub macro_indicators: Vec<String>,

    // Signals / alerts
    pub alert_threshold_percentile: f64,
    pub alert_retention_days: i64,
    pub strategy_lookback_days: i64,
    /// Enabled-asset whitelist gating the Alert Builder (spec.md §4.6).
    /// Defaults to the full task universe when unset.
    pub alert_enabled_assets: Vec<String>,

    /// Per-strategy webhook sinks for the per-strategy dispatch channel
    /// (spec.md §4.7), keyed by strategy name.
    pub strategy_webhook_urls: HashMap<String, String>,
}

impl Config {
    /// Load all configuration from environment variables. Loads `.env` if
    /// present. Panics on a malformed required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let high_frequency_assets = csv_env("HIGH_FREQUENCY_ASSETS").unwrap_or_else(|| {
            vec![
                "BTC", "ETH", "BNB", "HYPE", "SOL", "XRP", "DOGE", "LINK", "SUI", "UNI",
            ]
            .into_iter()
            .map(String::from)
            .collect()
        });
        let hourly_assets = csv_env("HOURLY_ASSETS").unwrap_or_else(|| {
            vec!["USDT", "TAO", "FET", "AGIX", "RNDR", "OCEAN", "ENA"]
                .into_iter()
                .map(String::from)
                .collect()
        });
        let alert_enabled_assets = csv_env("ALERT_ENABLED_ASSETS").unwrap_or_else(|| {
            let mut assets = high_frequency_assets.clone();
            assets.extend(hourly_assets.clone());
            assets
        });
        let strategy_webhook_urls = optional_env("STRATEGY_WEBHOOK_URLS")
            .map(|v| {
                v.split(',')
                    .filter_map(|pair| pair.split_once(':'))
                    .map(|(name, url)| (name.trim().to_string(), url.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Config {
            upstream_api_key: optional_env("UPSTREAM_API_KEY"),
            macro_api_key: optional_env("MACRO_API_KEY"),
            crypto_base_url: optional_env("CRYPTO_BASE_URL")
                .unwrap_or_else(|| "https://api.coingecko.com/api/v3".to_string()),
            macro_base_url: optional_env("MACRO_BASE_URL")
                .unwrap_or_else(|| "https://api.stlouisfed.org/fred".to_string()),

            webhook_url: optional_env("WEBHOOK_URL"),
            webhook_min_confidence: optional_env("WEBHOOK_MIN_CONFIDENCE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            webhook_min_strength: optional_env("WEBHOOK_MIN_STRENGTH")
                .and_then(|v| parse_strength(&v))
                .unwrap_or(crate::Strength::Weak),
            webhook_rate_limit: Duration::from_secs(
                optional_env("WEBHOOK_RATE_LIMIT_SECONDS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),

            database_url: optional_env("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/marketsignal.db".to_string()),
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategies.toml".to_string()),
            alert_dir: optional_env("ALERT_DIR").unwrap_or_else(|| "data/alerts".to_string()),
            state_file: optional_env("STATE_FILE")
                .unwrap_or_else(|| "data/scheduler_state.json".to_string()),

            macro_collection_time: optional_env("MACRO_COLLECTION_TIME")
                .unwrap_or_else(|| "23:00".to_string()),
            signal_generation_interval: Duration::from_secs(
                optional_env("SIGNAL_GENERATION_INTERVAL_SECONDS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            max_retries_per_task: optional_env("MAX_RETRIES_PER_TASK")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            max_upstream_concurrency: optional_env("MAX_UPSTREAM_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),

            high_frequency_assets,
            hourly_assets,
            macro_indicators: csv_env("MACRO_INDICATORS").unwrap_or_else(|| {
                vec![
                    "VIXCLS",
                    "DFF",
                    "DGS10",
                    "DTWEXBGS",
                    "DEXUSEU",
                    "DEXCHUS",
                    "BAMLH0A0HYM2",
                    "RRPONTSYD",
                    "SOFR",
                ]
                .into_iter()
                .map(String::from)
                .collect()
            }),

            alert_threshold_percentile: optional_env("ALERT_THRESHOLD_PERCENTILE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(90.0),
            alert_retention_days: optional_env("ALERT_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            strategy_lookback_days: optional_env("STRATEGY_LOOKBACK_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            alert_enabled_assets,
            strategy_webhook_urls,
        }
    }
}

fn csv_env(key: &str) -> Option<Vec<String>> {
    optional_env(key).map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
}

fn parse_strength(s: &str) -> Option<crate::Strength> {
    match s.to_uppercase().as_str() {
        "WEAK" => Some(crate::Strength::Weak),
        "MODERATE" => Some(crate::Strength::Moderate),
        "STRONG" => Some(crate::Strength::Strong),
        _ => None,
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
