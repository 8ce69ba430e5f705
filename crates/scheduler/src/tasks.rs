use chrono::{DateTime, NaiveTime, Utc};

use common::{TaskDescriptor, TaskKind, Tier};

/// The three asset/indicator lists that define every task the scheduler
/// will ever run. Built once at startup from configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskUniverse {
    pub high_frequency_assets: Vec<String>,
    pub hourly_assets: Vec<String>,
    pub macro_indicators: Vec<String>,
}

impl TaskUniverse {
    pub fn build_tasks(&self) -> Vec<TaskDescriptor> {
        let mut tasks = Vec::new();
        for asset in &self.high_frequency_assets {
            tasks.push(TaskDescriptor::new(TaskKind::Crypto, asset.clone(), Tier::HighFrequency));
        }
        for asset in &self.hourly_assets {
            tasks.push(TaskDescriptor::new(TaskKind::Crypto, asset.clone(), Tier::Hourly));
        }
        for indicator in &self.macro_indicators {
            tasks.push(TaskDescriptor::new(TaskKind::Macro, indicator.clone(), Tier::Macro));
        }
        tasks
    }

    pub fn all_asset_ids(&self) -> Vec<String> {
        let mut assets = self.high_frequency_assets.clone();
        assets.extend(self.hourly_assets.clone());
        assets
    }
}

/// Tasks due for collection `at` the given instant, grouped by tier in
/// strict `HighFrequency -> Hourly -> Macro` order — the order the
/// scheduler processes tiers in.
pub fn due_tasks<'a>(
    tasks: &'a [TaskDescriptor],
    at: DateTime<Utc>,
    macro_collection_time: NaiveTime,
) -> Vec<&'a TaskDescriptor> {
    let mut due: Vec<&TaskDescriptor> = tasks
        .iter()
        .filter(|t| t.enabled)
        .filter(|t| is_due(t, at, macro_collection_time))
        .collect();
    due.sort_by_key(|t| tier_rank(t.tier));
    due
}

fn tier_rank(tier: Tier) -> u8 {
    match tier {
        Tier::HighFrequency => 0,
        Tier::Hourly => 1,
        Tier::Macro => 2,
    }
}

fn is_due(task: &TaskDescriptor, at: DateTime<Utc>, macro_collection_time: NaiveTime) -> bool {
    match task.tier {
        Tier::Macro => is_macro_due_today(task, at, macro_collection_time),
        _ => match task.last_run {
            None => true,
            Some(last) => at - last >= task.cadence(),
        },
    }
}

/// A macro task is due once per day, at or after `macro_collection_time`
/// UTC. If it already ran today at or after that time, it's done for the
/// day regardless of how long ago that was.
fn is_macro_due_today(task: &TaskDescriptor, at: DateTime<Utc>, macro_collection_time: NaiveTime) -> bool {
    let Some(last_run) = task.last_run else {
        return at.time() >= macro_collection_time;
    };

    if last_run.date_naive() == at.date_naive() && last_run.time() >= macro_collection_time {
        return false;
    }
    at.time() >= macro_collection_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn high_frequency_task_due_on_first_run() {
        let task = TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency);
        assert!(is_due(&task, at(2026, 7, 31, 12, 0), NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
    }

    #[test]
    fn high_frequency_task_not_due_before_cadence_elapses() {
        let mut task = TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency);
        task.last_run = Some(at(2026, 7, 31, 12, 0));
        assert!(!is_due(&task, at(2026, 7, 31, 12, 10), NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(is_due(&task, at(2026, 7, 31, 12, 16), NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
    }

    #[test]
    fn macro_task_due_once_per_day_at_scheduled_time() {
        let macro_time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let mut task = TaskDescriptor::new(TaskKind::Macro, "CPI", Tier::Macro);

        assert!(!is_due(&task, at(2026, 7, 31, 22, 0), macro_time));
        assert!(is_due(&task, at(2026, 7, 31, 23, 5), macro_time));

        task.last_run = Some(at(2026, 7, 31, 23, 5));
        assert!(!is_due(&task, at(2026, 7, 31, 23, 30), macro_time));
        assert!(!is_due(&task, at(2026, 8, 1, 0, 0), macro_time));
        assert!(is_due(&task, at(2026, 8, 1, 23, 5), macro_time));
    }

    #[test]
    fn due_tasks_orders_by_tier() {
        let tasks = vec![
            TaskDescriptor::new(TaskKind::Macro, "CPI", Tier::Macro),
            TaskDescriptor::new(TaskKind::Crypto, "TAO", Tier::Hourly),
            TaskDescriptor::new(TaskKind::Crypto, "BTC", Tier::HighFrequency),
        ];
        let macro_time = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let due = due_tasks(&tasks, at(2026, 7, 31, 12, 0), macro_time);
        let tiers: Vec<Tier> = due.iter().map(|t| t.tier).collect();
        assert_eq!(tiers, vec![Tier::HighFrequency, Tier::Hourly, Tier::Macro]);
    }
}
