//! Directive payloads carried by coordination queue tasks

use crate::dispatcher::TaskPayload;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Cancel future executions of a task type and optionally re-arm it
///
/// `next_execution` of `None` means cancel only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleDirective {
    pub queue_id: String,
    pub task_type: String,
    #[serde(default)]
    pub next_execution: Option<DateTime<FixedOffset>>,
    /// Directive handed to the re-armed execution
    #[serde(default)]
    pub inner_directive: Option<TaskPayload>,
}

impl RescheduleDirective {
    pub fn new(
        queue_id: impl Into<String>,
        task_type: impl Into<String>,
        next_execution: Option<DateTime<FixedOffset>>,
        inner_directive: Option<TaskPayload>,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            task_type: task_type.into(),
            next_execution,
            inner_directive,
        }
    }

    /// Activation time of the re-armed execution as an absolute UTC instant
    pub fn activation(&self) -> Option<DateTime<Utc>> {
        self.next_execution.map(|at| at.with_timezone(&Utc))
    }
}

/// Run the registered import command with this id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDirective {
    pub command_id: String,
}

impl ImportDirective {
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_activation_is_converted_to_utc() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let directive = RescheduleDirective::new("queue-A", "typeX", Some(local), None);

        assert_eq!(
            directive.activation(),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(RescheduleDirective::new("queue-A", "typeX", None, None).activation(), None);
    }

    #[test]
    fn test_reschedule_directive_payload_shape() {
        let directive = RescheduleDirective::new(
            "queue-A",
            "typeX",
            None,
            Some(TaskPayload(json!({ "source": "nightly" }))),
        );
        let payload = TaskPayload::encode(&directive).unwrap();

        assert_eq!(payload.0["queue_id"], "queue-A");
        assert_eq!(payload.0["inner_directive"]["source"], "nightly");
        assert_eq!(payload.decode::<RescheduleDirective>().unwrap(), directive);
    }

    #[test]
    fn test_optional_fields_may_be_missing() {
        let directive: RescheduleDirective =
            serde_json::from_value(json!({ "queue_id": "q", "task_type": "t" })).unwrap();
        assert!(directive.next_execution.is_none());
        assert!(directive.inner_directive.is_none());
    }
}
