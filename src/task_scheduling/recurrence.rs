//! Recurrence policies: when should a task type run next

use crate::config::RecurringTaskConfig;
use crate::dispatcher::TaskRef;
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Next execution time of a task type, or `None` if it should not recur
#[cfg_attr(test, mockall::automock)]
pub trait RecurrencePolicy: Send + Sync {
    fn next_execution(&self, queue_id: &str, task_type: &str) -> Option<DateTime<Utc>>;
}

impl<F> RecurrencePolicy for F
where
    F: Fn(&str, &str) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn next_execution(&self, queue_id: &str, task_type: &str) -> Option<DateTime<Utc>> {
        self(queue_id, task_type)
    }
}

#[derive(Debug, Clone)]
enum Recurrence {
    Cron(Schedule),
    Interval(chrono::Duration),
}

/// Cron or fixed-interval schedules per `(queue, task type)`
#[derive(Debug, Clone, Default)]
pub struct ScheduledRecurrence {
    schedules: HashMap<TaskRef, Recurrence>,
}

impl ScheduledRecurrence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[[recurring]]` entries, skipping disabled ones
    pub fn from_config(entries: &[RecurringTaskConfig]) -> AppResult<Self> {
        let mut policy = Self::new();
        for entry in entries {
            entry.validate()?;
            if !entry.enabled {
                debug!("Recurring task {}/{} is disabled", entry.queue_id, entry.task_type);
                continue;
            }
            policy = match (&entry.cron, entry.interval) {
                (Some(expression), _) => {
                    policy.with_cron(&entry.queue_id, &entry.task_type, expression)?
                }
                (None, Some(interval)) => {
                    policy.with_interval(&entry.queue_id, &entry.task_type, interval)?
                }
                (None, None) => policy,
            };
        }
        Ok(policy)
    }

    /// Seconds-resolution cron expression, e.g. `0 0/15 * * * *`
    pub fn with_cron(
        mut self,
        queue_id: &str,
        task_type: &str,
        expression: &str,
    ) -> AppResult<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            AppError::configuration(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        self.schedules
            .insert(TaskRef::new(queue_id, task_type), Recurrence::Cron(schedule));
        Ok(self)
    }

    pub fn with_interval(
        mut self,
        queue_id: &str,
        task_type: &str,
        interval: Duration,
    ) -> AppResult<Self> {
        let interval = chrono::Duration::from_std(interval).map_err(|e| {
            AppError::configuration(format!("Interval {interval:?} is out of range: {e}"))
        })?;
        self.schedules
            .insert(TaskRef::new(queue_id, task_type), Recurrence::Interval(interval));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Pairs with a schedule
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRef> {
        self.schedules.keys()
    }

    pub fn next_execution_after(
        &self,
        queue_id: &str,
        task_type: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.schedules.get(&TaskRef::new(queue_id, task_type))? {
            Recurrence::Cron(schedule) => schedule.after(&now).next(),
            Recurrence::Interval(interval) => now.checked_add_signed(*interval),
        }
    }
}

impl RecurrencePolicy for ScheduledRecurrence {
    fn next_execution(&self, queue_id: &str, task_type: &str) -> Option<DateTime<Utc>> {
        self.next_execution_after(queue_id, task_type, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 8, 7, 30).unwrap()
    }

    #[rstest]
    #[case::every_quarter_hour("0 0/15 * * * *", Utc.with_ymd_and_hms(2026, 1, 10, 8, 15, 0).unwrap())]
    #[case::nightly("0 0 2 * * *", Utc.with_ymd_and_hms(2026, 1, 11, 2, 0, 0).unwrap())]
    fn test_cron_next_execution(#[case] expression: &str, #[case] expected: DateTime<Utc>) {
        let policy = ScheduledRecurrence::new()
            .with_cron("queue-A", "typeX", expression)
            .unwrap();
        assert_eq!(policy.next_execution_after("queue-A", "typeX", now()), Some(expected));
    }

    #[test]
    fn test_interval_next_execution() {
        let policy = ScheduledRecurrence::new()
            .with_interval("queue-A", "typeX", Duration::from_secs(3600))
            .unwrap();
        assert_eq!(
            policy.next_execution_after("queue-A", "typeX", now()),
            Some(now() + chrono::Duration::hours(1))
        );
        assert_eq!(policy.next_execution_after("queue-A", "other", now()), None);
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(ScheduledRecurrence::new().with_cron("q", "t", "invalid").is_err());
    }

    #[test]
    fn test_from_config_skips_disabled_entries() {
        let entries = vec![
            RecurringTaskConfig {
                queue_id: "queue-A".to_string(),
                task_type: "typeX".to_string(),
                cron: None,
                interval: Some(Duration::from_secs(60)),
                enabled: true,
            },
            RecurringTaskConfig {
                queue_id: "queue-B".to_string(),
                task_type: "typeY".to_string(),
                cron: Some("0 0 * * * *".to_string()),
                interval: None,
                enabled: false,
            },
        ];

        let policy = ScheduledRecurrence::from_config(&entries).unwrap();
        assert_eq!(policy.len(), 1);
        assert!(policy.next_execution("queue-A", "typeX").is_some());
        assert!(policy.next_execution("queue-B", "typeY").is_none());
    }

    #[test]
    fn test_closures_are_policies() {
        let at = now();
        let policy = move |queue_id: &str, _task_type: &str| (queue_id == "queue-A").then_some(at);
        assert_eq!(policy.next_execution("queue-A", "typeX"), Some(at));
        assert_eq!(policy.next_execution("queue-B", "typeX"), None);
    }
}
