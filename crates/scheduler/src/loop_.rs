use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aggregator::SignalAggregator;
use alerts::AlertBuilder;
use common::{Clock, ErrorKind, MacroCollector, OhlcCollector, Store, TaskDescriptor, TaskKind, Tier};
use strategy::StrategyRegistry;
use webhook::WebhookDispatcher;

use crate::state::{SchedulerCounters, StateStore};
use crate::tasks::{due_tasks, TaskUniverse};

/// A task is disabled after this many consecutive collection failures,
/// independent of how many retries `max_retries_per_task` allows per attempt.
const DISABLE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub macro_collection_time: NaiveTime,
    pub signal_generation_interval: chrono::Duration,
    pub max_retries_per_task: u32,
    pub max_upstream_concurrency: usize,
    /// How far back to window the market-data bundle handed to strategies.
    pub strategy_lookback: chrono::Duration,
}

/// Ties every component together into the periodic collect-then-signal
/// loop: each tick, due tasks run tier by tier with bounded concurrency,
/// then (if due) a signal-generation round reads the fresh data, runs
/// every strategy, aggregates, builds alerts, and dispatches webhooks.
pub struct Scheduler<C: Clock> {
    clock: Arc<C>,
    universe: TaskUniverse,
    tasks: Vec<TaskDescriptor>,
    ohlc_collector: Arc<dyn OhlcCollector>,
    macro_collector: Arc<dyn MacroCollector>,
    store: Arc<dyn Store>,
    strategies: StrategyRegistry,
    aggregator: SignalAggregator,
    alert_builder: AlertBuilder,
    webhook: WebhookDispatcher,
    state_store: StateStore,
    config: SchedulerConfig,
    last_signal_generation: Option<chrono::DateTime<Utc>>,
    counters: SchedulerCounters,
}

impl<C: Clock + 'static> Scheduler<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<C>,
        universe: TaskUniverse,
        ohlc_collector: Arc<dyn OhlcCollector>,
        macro_collector: Arc<dyn MacroCollector>,
        store: Arc<dyn Store>,
        strategies: StrategyRegistry,
        aggregator: SignalAggregator,
        alert_builder: AlertBuilder,
        webhook: WebhookDispatcher,
        state_store: StateStore,
        config: SchedulerConfig,
    ) -> Self {
        let mut tasks = universe.build_tasks();
        let (last_signal_generation, counters) = state_store.load(&mut tasks);

        Self {
            clock,
            universe,
            tasks,
            ohlc_collector,
            macro_collector,
            store,
            strategies,
            aggregator,
            alert_builder,
            webhook,
            state_store,
            config,
            last_signal_generation,
            counters,
        }
    }

    /// Run until `cancel` fires. Call from `tokio::spawn`.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(tasks = self.tasks.len(), "scheduler starting");
        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.run_tick(&cancel).await;
                }
            }
        }

        self.save_state();
        info!("scheduler stopped");
    }

    /// Run exactly one tick (collection + signal generation if due) and
    /// return, saving state before returning. Used for `--once` invocations.
    pub async fn run_once(&mut self) {
        let cancel = CancellationToken::new();
        self.run_tick(&cancel).await;
        self.save_state();
    }

    fn save_state(&self) {
        self.state_store.save(
            &self.tasks,
            self.last_signal_generation,
            &self.counters,
            self.clock.now(),
        );
    }

    async fn run_tick(&mut self, cancel: &CancellationToken) {
        let now = self.clock.now();
        let due: Vec<String> = due_tasks(&self.tasks, now, self.config.macro_collection_time)
            .into_iter()
            .map(|t| t.task_id.clone())
            .collect();

        for tier in [Tier::HighFrequency, Tier::Hourly, Tier::Macro] {
            if cancel.is_cancelled() {
                return;
            }
            let tier_task_ids: Vec<String> = self
                .tasks
                .iter()
                .filter(|t| t.tier == tier && due.contains(&t.task_id))
                .map(|t| t.task_id.clone())
                .collect();
            if tier_task_ids.is_empty() {
                continue;
            }
            self.process_tier(tier, &tier_task_ids, now, cancel).await;
        }

        if self.is_signal_generation_due(now) {
            self.run_signal_generation(now).await;
            self.last_signal_generation = Some(now);
        }

        self.save_state();
    }

    async fn process_tier(
        &mut self,
        tier: Tier,
        task_ids: &[String],
        now: chrono::DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        info!(tier = %tier, count = task_ids.len(), "processing tier");
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_upstream_concurrency.max(1).min(task_ids.len().max(1)),
        ));
        let max_retries = self.config.max_retries_per_task;

        let mut handles = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let task = self
                .tasks
                .iter()
                .find(|t| &t.task_id == task_id)
                .expect("task_id came from self.tasks")
                .clone();
            let semaphore = semaphore.clone();
            let ohlc_collector = self.ohlc_collector.clone();
            let macro_collector = self.macro_collector.clone();
            let store = self.store.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                tokio::select! {
                    _ = cancel.cancelled() => (task.task_id.clone(), false, 0),
                    result = collect_one(&task, &*ohlc_collector, &*macro_collector, &*store, max_retries) => {
                        let (ok, attempts) = result;
                        (task.task_id.clone(), ok, attempts)
                    }
                }
            }));
        }

        let mut success = 0;
        let mut failure = 0;
        for handle in handles {
            let (task_id, ok, attempts) = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "collection task panicked");
                    continue;
                }
            };
            self.counters.record_collection(&tier.to_string(), attempts, ok);
            if let Some(task) = self.tasks.iter_mut().find(|t| t.task_id == task_id) {
                task.last_run = Some(now);
                if ok {
                    task.consecutive_failures = 0;
                    success += 1;
                } else {
                    task.consecutive_failures += 1;
                    failure += 1;
                    if task.consecutive_failures >= DISABLE_AFTER_CONSECUTIVE_FAILURES {
                        task.enabled = false;
                        warn!(task_id = %task.task_id, "disabling task after repeated failures");
                    }
                }
            }
        }
        info!(tier = %tier, success, failure, "tier complete");
    }

    fn is_signal_generation_due(&self, now: chrono::DateTime<Utc>) -> bool {
        match self.last_signal_generation {
            None => true,
            Some(last) => now - last >= self.config.signal_generation_interval,
        }
    }

    async fn run_signal_generation(&mut self, now: chrono::DateTime<Utc>) {
        let asset_ids = self.strategies.all_declared_assets();
        let indicator_ids = self.universe.macro_indicators.clone();

        let bundle = match self
            .store
            .read_market_bundle(&asset_ids, &indicator_ids, self.config.strategy_lookback, now)
            .await
        {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "failed to read market bundle, skipping signal generation");
                return;
            }
        };

        let raw_signals = self.strategies.generate_all(&bundle);
        let merged = self.aggregator.aggregate(raw_signals.clone());
        info!(raw = raw_signals.len(), merged = merged.len(), "signal generation complete");
        self.counters.signals_generated += merged.len() as u64;

        let alerts = self.alert_builder.build_all(&merged);
        self.counters.alerts_generated += alerts.len() as u64;
        if !alerts.is_empty() {
            self.alert_builder.save_all(&alerts);
        }

        for signal in &merged {
            let outcomes = self.webhook.dispatch(signal).await;
            self.counters.webhook_alerts_sent += outcomes
                .iter()
                .filter(|o| matches!(o, webhook::SinkOutcome::Delivered))
                .count() as u64;
        }

        for signal in &raw_signals {
            if let Some(outcome) = self.webhook.dispatch_strategy(signal).await {
                if matches!(outcome, webhook::SinkOutcome::Delivered) {
                    self.counters.webhook_alerts_sent += 1;
                }
            }
        }
    }
}

struct CollectFailure {
    kind: ErrorKind,
    retry_after: Option<Duration>,
}

/// Run one collection attempt, retrying up to `max_retries` additional
/// times when the failure's `ErrorKind` recommends it, honoring any
/// advisory `retry_after` as a wait before the next attempt. Returns
/// whether the task ultimately succeeded and how many attempts it took.
async fn collect_one(
    task: &TaskDescriptor,
    ohlc_collector: &dyn OhlcCollector,
    macro_collector: &dyn MacroCollector,
    store: &dyn Store,
    max_retries: u32,
) -> (bool, u32) {
    let mut attempt = 0;
    loop {
        let result = collect_attempt(task, ohlc_collector, macro_collector, store).await;
        attempt += 1;
        match result {
            Ok(()) => return (true, attempt),
            Err(failure) => {
                let can_retry = attempt <= max_retries && failure.kind.retry_recommended();
                if !can_retry {
                    return (false, attempt);
                }
                warn!(
                    task_id = %task.task_id,
                    attempt,
                    max_retries,
                    kind = %failure.kind,
                    "retrying collection after recoverable failure"
                );
                if let Some(wait) = failure.retry_after {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

async fn collect_attempt(
    task: &TaskDescriptor,
    ohlc_collector: &dyn OhlcCollector,
    macro_collector: &dyn MacroCollector,
    store: &dyn Store,
) -> Result<(), CollectFailure> {
    match task.kind {
        TaskKind::Crypto => {
            let since_ms = match store.latest_ohlc_timestamp(&task.asset_or_indicator_id).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "failed to read cursor");
                    None
                }
            };
            let rows = ohlc_collector
                .collect_ohlc(&task.asset_or_indicator_id, since_ms)
                .await
                .map_err(|e| {
                    warn!(task_id = %task.task_id, error = %e, "collection failed");
                    CollectFailure {
                        kind: e.kind,
                        retry_after: e.retry_after,
                    }
                })?;
            store.insert_ohlc(&rows).await.map_err(|e| {
                warn!(task_id = %task.task_id, error = %e, "failed to persist OHLC rows");
                CollectFailure {
                    kind: ErrorKind::Storage,
                    retry_after: None,
                }
            })
        }
        TaskKind::Macro => {
            let since = match store.latest_macro_date(&task.asset_or_indicator_id).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "failed to read cursor");
                    None
                }
            };
            let rows = macro_collector
                .collect_macro(&task.asset_or_indicator_id, since)
                .await
                .map_err(|e| {
                    warn!(task_id = %task.task_id, error = %e, "collection failed");
                    CollectFailure {
                        kind: e.kind,
                        retry_after: e.retry_after,
                    }
                })?;
            store.insert_macro(&rows).await.map_err(|e| {
                warn!(task_id = %task.task_id, error = %e, "failed to persist macro rows");
                CollectFailure {
                    kind: ErrorKind::Storage,
                    retry_after: None,
                }
            })
        }
    }
}
