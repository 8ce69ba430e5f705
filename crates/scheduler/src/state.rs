use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::TaskDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct TaskSnapshot {
    last_run: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    enabled: bool,
}

/// Per-tier collection tally, keyed by tier name in the persisted snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TierStats {
    pub success: u64,
    pub failure: u64,
}

/// Cumulative counters the scheduler has accrued since the process last
/// started from an empty state file. Threaded through every tick and
/// persisted alongside task bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SchedulerCounters {
    pub collection_stats: HashMap<String, TierStats>,
    pub total_api_calls: u64,
    pub signals_generated: u64,
    pub alerts_generated: u64,
    pub webhook_alerts_sent: u64,
}

impl SchedulerCounters {
    pub fn record_collection(&mut self, tier: &str, attempts: u32, success: bool) {
        self.total_api_calls += attempts as u64;
        let stats = self.collection_stats.entry(tier.to_string()).or_default();
        if success {
            stats.success += 1;
        } else {
            stats.failure += 1;
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct SchedulerSnapshot {
    tasks: HashMap<String, TaskSnapshot>,
    last_signal_generation: Option<DateTime<Utc>>,
    #[serde(default)]
    collection_stats: HashMap<String, TierStats>,
    #[serde(default)]
    total_api_calls: u64,
    #[serde(default)]
    signals_generated: u64,
    #[serde(default)]
    alerts_generated: u64,
    #[serde(default)]
    webhook_alerts_sent: u64,
    #[serde(default)]
    last_save: Option<DateTime<Utc>>,
}

/// Loads and saves scheduler bookkeeping (per-task last-run time, failure
/// counts, enabled flags, the last signal-generation timestamp, and the
/// cumulative counters from spec.md §6) to a JSON file so a restart resumes
/// cadences instead of re-running everything.
///
/// Saves are atomic: the snapshot is written to a temp file in the same
/// directory, then renamed over the target, so a crash mid-write never
/// leaves a truncated state file behind.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Overlay any persisted state onto `tasks` (matched by `task_id`) and
    /// return the last recorded signal-generation timestamp and the
    /// persisted cumulative counters, if any.
    pub fn load(&self, tasks: &mut [TaskDescriptor]) -> (Option<DateTime<Utc>>, SchedulerCounters) {
        let snapshot = match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<SchedulerSnapshot>(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to parse scheduler state, starting fresh");
                    return (None, SchedulerCounters::default());
                }
            },
            Err(_) => return (None, SchedulerCounters::default()),
        };

        for task in tasks.iter_mut() {
            if let Some(saved) = snapshot.tasks.get(&task.task_id) {
                task.last_run = saved.last_run;
                task.consecutive_failures = saved.consecutive_failures;
                task.enabled = saved.enabled;
            }
        }

        info!(path = %self.path.display(), "loaded scheduler state");
        let counters = SchedulerCounters {
            collection_stats: snapshot.collection_stats,
            total_api_calls: snapshot.total_api_calls,
            signals_generated: snapshot.signals_generated,
            alerts_generated: snapshot.alerts_generated,
            webhook_alerts_sent: snapshot.webhook_alerts_sent,
        };
        (snapshot.last_signal_generation, counters)
    }

    pub fn save(
        &self,
        tasks: &[TaskDescriptor],
        last_signal_generation: Option<DateTime<Utc>>,
        counters: &SchedulerCounters,
        now: DateTime<Utc>,
    ) {
        let snapshot = SchedulerSnapshot {
            tasks: tasks
                .iter()
                .map(|t| {
                    (
                        t.task_id.clone(),
                        TaskSnapshot {
                            last_run: t.last_run,
                            consecutive_failures: t.consecutive_failures,
                            enabled: t.enabled,
                        },
                    )
                })
                .collect(),
            last_signal_generation,
            collection_stats: counters.collection_stats.clone(),
            total_api_calls: counters.total_api_calls,
            signals_generated: counters.signals_generated,
            alerts_generated: counters.alerts_generated,
            webhook_alerts_sent: counters.webhook_alerts_sent,
            last_save: Some(now),
        };

        if let Err(e) = self.write_atomic(&snapshot) {
            warn!(error = %e, "failed to save scheduler state");
        }
    }

    fn write_atomic(&self, snapshot: &SchedulerSnapshot) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(&self.path);
        let content = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TaskKind, Tier};

    #[test]
    fn round_trips_task_bookkeeping() {
        let dir = std::env::temp_dir().join(format!("marketsignal-state-test-{}", std::process::id()));
        let path = dir.join("state.json");
        let store = StateStore::new(&path);

        let mut tasks = vec![TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency)];
        tasks[0].last_run = Some(Utc::now());
        tasks[0].consecutive_failures = 2;

        let mut counters = SchedulerCounters::default();
        counters.record_collection("high_frequency", 1, true);
        counters.signals_generated = 5;
        counters.alerts_generated = 2;
        counters.webhook_alerts_sent = 2;
        store.save(&tasks, Some(Utc::now()), &counters, Utc::now());

        let mut reloaded = vec![TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency)];
        let (last_gen, reloaded_counters) = store.load(&mut reloaded);
        assert_eq!(reloaded[0].consecutive_failures, 2);
        assert!(last_gen.is_some());
        assert_eq!(reloaded_counters.total_api_calls, 1);
        assert_eq!(reloaded_counters.signals_generated, 5);
        assert_eq!(reloaded_counters.collection_stats["high_frequency"].success, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_loads_nothing() {
        let store = StateStore::new("/tmp/marketsignal-state-definitely-missing.json");
        let mut tasks = vec![TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency)];
        let (last_gen, counters) = store.load(&mut tasks);
        assert!(last_gen.is_none());
        assert_eq!(tasks[0].consecutive_failures, 0);
        assert_eq!(counters.total_api_calls, 0);
    }
}
