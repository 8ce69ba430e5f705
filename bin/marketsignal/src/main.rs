use std::sync::Arc;

use chrono::NaiveTime;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aggregator::{SignalAggregator, SignalAggregatorConfig};
use alerts::AlertBuilder;
use collectors::{CryptoCollector, MacroCollector};
use common::{Config, SystemClock};
use scheduler::{Scheduler, SchedulerConfig, StateStore, TaskUniverse};
use store::SqliteStore;
use strategy::{StrategyFileConfig, StrategyRegistry};
use webhook::{SinkConfig, WebhookDispatcher};

#[derive(Parser)]
#[command(name = "marketsignal", about = "Market data collection and signal scheduler")]
struct Cli {
    /// Override the strategy config file path from $STRATEGY_CONFIG_PATH.
    #[arg(long)]
    strategy_config: Option<String>,

    /// Run one scheduling tick and exit instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
            info!("shutdown requested, exiting");
            std::process::exit(130);
        }
        Err(e) => {
            error!(error = %e, "marketsignal exited with an error");
            std::process::exit(1);
        }
    }
}

#[derive(Debug)]
struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl std::error::Error for Interrupted {}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(path) = cli.strategy_config {
        cfg.strategy_config_path = path;
    }
    info!(database_url = %cfg.database_url, "marketsignal starting");

    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);

    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path);
    let registry = StrategyRegistry::from_config(&strategy_file);

    let aggregator = SignalAggregator::new(SignalAggregatorConfig::default());

    let alert_builder = AlertBuilder::new(
        cfg.alert_dir.clone(),
        cfg.alert_threshold_percentile,
        cfg.alert_enabled_assets.clone(),
    );

    let mut sinks = Vec::new();
    if let Some(url) = &cfg.webhook_url {
        sinks.push(SinkConfig {
            name: "aggregate".to_string(),
            url: url.clone(),
            min_confidence: cfg.webhook_min_confidence,
            min_strength: cfg.webhook_min_strength,
            assets: None,
            rate_limit: cfg.webhook_rate_limit,
        });
    }
    let strategy_sinks = cfg
        .strategy_webhook_urls
        .iter()
        .map(|(name, url)| {
            (
                name.clone(),
                SinkConfig {
                    name: name.clone(),
                    url: url.clone(),
                    min_confidence: cfg.webhook_min_confidence,
                    min_strength: cfg.webhook_min_strength,
                    assets: None,
                    rate_limit: cfg.webhook_rate_limit,
                },
            )
        })
        .collect();
    let webhook = WebhookDispatcher::new(sinks, strategy_sinks);

    let universe = TaskUniverse {
        high_frequency_assets: cfg.high_frequency_assets.clone(),
        hourly_assets: cfg.hourly_assets.clone(),
        macro_indicators: cfg.macro_indicators.clone(),
    };

    let macro_collection_time = NaiveTime::parse_from_str(&cfg.macro_collection_time, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(23, 0, 0).unwrap());

    let scheduler_config = SchedulerConfig {
        tick_interval: std::time::Duration::from_secs(60),
        macro_collection_time,
        signal_generation_interval: chrono::Duration::from_std(cfg.signal_generation_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(1)),
        max_retries_per_task: cfg.max_retries_per_task,
        max_upstream_concurrency: cfg.max_upstream_concurrency,
        strategy_lookback: chrono::Duration::days(cfg.strategy_lookback_days),
    };

    let mut scheduler = Scheduler::new(
        Arc::new(SystemClock),
        universe,
        Arc::new(CryptoCollector::new(cfg.crypto_base_url.clone(), cfg.upstream_api_key.clone())),
        Arc::new(MacroCollector::new(cfg.macro_base_url.clone(), cfg.macro_api_key.clone())),
        store,
        registry,
        aggregator,
        alert_builder,
        webhook,
        StateStore::new(cfg.state_file.clone()),
        scheduler_config,
    );

    if cli.once {
        scheduler.run_once().await;
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel_for_signal.cancel();
    let _ = scheduler_handle.await;

    Err(Interrupted.into())
}
