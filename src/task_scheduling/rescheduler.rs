//! Rescheduling orchestrator
//!
//! A reschedule cancels every future (not yet running) execution of a
//! `(queue, task type)` pair and, when a next execution time is given,
//! schedules exactly one new execution at that time. The mutation is first
//! attempted directly inside a unit of work; if that fails for any reason the
//! same directive is queued on the sequential coordination queue so that a
//! later pass applies it.

use super::directives::RescheduleDirective;
use crate::config::CoordinationConfig;
use crate::dispatcher::{TaskDispatcher, TaskId, TaskPayload};
use crate::errors::{DispatchError, DispatchResult, RescheduleError};
use crate::store::{StoreHandle, TransactionRunner, run_unit_of_work, unit_of_work};
use crate::utils::jittered;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of trying the cancel-and-reschedule mutation directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationAttempt {
    Applied,
    /// The mutation did not commit; it should be retried elsewhere
    Deferred { reason: String },
}

/// What `reschedule_task` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Future executions were cancelled (and re-armed) directly
    Applied,
    /// A reschedule task was queued on the coordination queue instead
    Deferred { reason: String, task_id: TaskId },
}

pub struct TaskRescheduler {
    dispatcher: Arc<dyn TaskDispatcher>,
    transactions: Option<Arc<dyn TransactionRunner>>,
    default_store: StoreHandle,
    coordination: CoordinationConfig,
}

impl TaskRescheduler {
    pub fn new(
        dispatcher: Arc<dyn TaskDispatcher>,
        transactions: Option<Arc<dyn TransactionRunner>>,
        default_store: StoreHandle,
        coordination: CoordinationConfig,
    ) -> Self {
        Self {
            dispatcher,
            transactions,
            default_store,
            coordination,
        }
    }

    pub fn coordination(&self) -> &CoordinationConfig {
        &self.coordination
    }

    pub fn dispatcher(&self) -> &Arc<dyn TaskDispatcher> {
        &self.dispatcher
    }

    /// Cancel future executions of `task_type` on `queue_id` and, if
    /// `schedule_for` is set, schedule a new execution at that time
    ///
    /// Failures of the direct mutation are absorbed by queueing the same
    /// directive on the coordination queue. Only a failure of that fallback
    /// is returned.
    pub async fn reschedule_task(
        &self,
        queue_id: &str,
        task_type: &str,
        inner_directive: Option<TaskPayload>,
        store: Option<&StoreHandle>,
        schedule_for: Option<DateTime<FixedOffset>>,
    ) -> Result<RescheduleOutcome, RescheduleError> {
        let directive =
            RescheduleDirective::new(queue_id, task_type, schedule_for, inner_directive);

        match self.attempt_reschedule(&directive, store).await {
            MutationAttempt::Applied => Ok(RescheduleOutcome::Applied),
            MutationAttempt::Deferred { reason } => {
                warn!(
                    "Direct reschedule of {} on {} failed, queueing it on '{}': {}",
                    task_type, queue_id, self.coordination.queue_id, reason
                );
                let task_id = self.enqueue_reschedule(&directive, store, None).await?;
                Ok(RescheduleOutcome::Deferred { reason, task_id })
            }
        }
    }

    /// Try the cancel-and-reschedule mutation inside one unit of work
    ///
    /// Runs through the transaction runner when there is one, otherwise
    /// directly against `store` (or the default store).
    pub async fn attempt_reschedule(
        &self,
        directive: &RescheduleDirective,
        store: Option<&StoreHandle>,
    ) -> MutationAttempt {
        let store = store.unwrap_or(&self.default_store);

        let work = unit_of_work(move |txn| {
            async move {
                self.apply_reschedule(directive, &txn)
                    .await
                    .map(|_| ())
                    .map_err(DispatchError::into_store_error)
            }
            .boxed()
        });

        match run_unit_of_work(self.transactions.as_ref(), store, work).await {
            Ok(()) => MutationAttempt::Applied,
            Err(e) => MutationAttempt::Deferred {
                reason: e.to_string(),
            },
        }
    }

    /// The mutation itself, against whatever handle it is given
    ///
    /// Returns the id of the re-armed execution, if any.
    pub async fn apply_reschedule(
        &self,
        directive: &RescheduleDirective,
        store: &StoreHandle,
    ) -> DispatchResult<Option<TaskId>> {
        let cancelled = self
            .dispatcher
            .cancel_all_future_executions(&directive.queue_id, &directive.task_type, false, store)
            .await?;
        debug!(
            "Cancelled {} future executions of {} on {}",
            cancelled, directive.task_type, directive.queue_id
        );

        let Some(activation) = directive.activation() else {
            return Ok(None);
        };

        let task_id = self
            .add_task(
                store,
                &directive.queue_id,
                &directive.task_type,
                directive.inner_directive.clone(),
                Some(activation),
            )
            .await?;
        Ok(Some(task_id))
    }

    /// Submit a task to the dispatcher, logging what was added
    pub async fn add_task(
        &self,
        store: &StoreHandle,
        queue_id: &str,
        task_type: &str,
        directive: Option<TaskPayload>,
        activation: Option<DateTime<Utc>>,
    ) -> DispatchResult<TaskId> {
        let task_id = self
            .dispatcher
            .add_task(store, queue_id, task_type, directive, activation)
            .await?;
        info!(
            "Added task {} of type {} on {} (activation: {})",
            task_id,
            task_type,
            queue_id,
            activation
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "now".to_string())
        );
        Ok(task_id)
    }

    /// Queue `directive` again after a coordination pass failed to apply it
    ///
    /// The retry waits for the configured backoff. Returns `None` when a
    /// directive for the same pair is already waiting on the coordination
    /// queue, since that one runs later and replaces this one.
    pub async fn requeue_reschedule(
        &self,
        directive: &RescheduleDirective,
        store: &StoreHandle,
    ) -> Result<Option<TaskId>, RescheduleError> {
        match self.queued_directive_for(directive).await {
            Ok(Some(waiting)) => {
                info!(
                    "Reschedule of {} on {} superseded by queued task {}, not retrying",
                    directive.task_type, directive.queue_id, waiting
                );
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) => warn!("{}; queueing the retry anyway", e),
        }

        let delay = jittered(self.coordination.retry_delay, self.coordination.retry_jitter_percent);
        let activation =
            Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::hours(1));
        let task_id = self.enqueue_reschedule(directive, Some(store), Some(activation)).await?;
        Ok(Some(task_id))
    }

    /// Id of a waiting reschedule task that targets the same pair as `directive`
    async fn queued_directive_for(
        &self,
        directive: &RescheduleDirective,
    ) -> Result<Option<TaskId>, RescheduleError> {
        let queued = self
            .dispatcher
            .pending_executions(
                &self.coordination.queue_id,
                &self.coordination.reschedule_task_type,
                false,
            )
            .await
            .map_err(|source| RescheduleError::PendingLookup {
                queue_id: self.coordination.queue_id.clone(),
                task_type: self.coordination.reschedule_task_type.clone(),
                source,
            })?;

        Ok(queued.into_iter().find_map(|pending| {
            let other = pending.directive.as_ref()?.decode::<RescheduleDirective>().ok()?;
            (other.queue_id == directive.queue_id && other.task_type == directive.task_type)
                .then_some(pending.task_id)
        }))
    }

    async fn enqueue_reschedule(
        &self,
        directive: &RescheduleDirective,
        store: Option<&StoreHandle>,
        activation: Option<DateTime<Utc>>,
    ) -> Result<TaskId, RescheduleError> {
        let payload = TaskPayload::encode(directive)?;
        let store = store.unwrap_or(&self.default_store);

        self.add_task(
            store,
            &self.coordination.queue_id,
            &self.coordination.reschedule_task_type,
            Some(payload),
            activation,
        )
        .await
        .map_err(|source| {
            error!(
                "Failed to queue reschedule of {} on {}: {}",
                directive.task_type, directive.queue_id, source
            );
            RescheduleError::FallbackEnqueueFailed {
                queue_id: directive.queue_id.clone(),
                task_type: directive.task_type.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::InMemoryDispatcher;
    use crate::store::{MemoryStore, MemoryTransactionRunner};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Fixture {
        memory: Arc<MemoryStore>,
        dispatcher: Arc<InMemoryDispatcher>,
        rescheduler: TaskRescheduler,
    }

    fn fixture(transactional: bool) -> Fixture {
        let memory = MemoryStore::arc();
        let transactions: Option<Arc<dyn TransactionRunner>> = transactional.then(|| {
            Arc::new(MemoryTransactionRunner::new(memory.clone(), Duration::from_secs(5)))
                as Arc<dyn TransactionRunner>
        });
        let dispatcher = Arc::new(InMemoryDispatcher::new(
            memory.clone(),
            transactions.clone(),
            "node-1",
        ));
        let rescheduler = TaskRescheduler::new(
            dispatcher.clone(),
            transactions,
            memory.clone(),
            CoordinationConfig::default(),
        );
        Fixture {
            memory,
            dispatcher,
            rescheduler,
        }
    }

    fn in_one_hour() -> DateTime<FixedOffset> {
        (Utc::now() + ChronoDuration::hours(1)).fixed_offset()
    }

    #[tokio::test]
    async fn test_reschedule_replaces_future_executions() {
        let f = fixture(true);
        let store = f.dispatcher.store().clone();
        for _ in 0..3 {
            f.dispatcher.add_task(&store, "queue-A", "typeX", None, None).await.unwrap();
        }

        let at = in_one_hour();
        let outcome = f
            .rescheduler
            .reschedule_task(
                "queue-A",
                "typeX",
                Some(TaskPayload(json!({ "n": 1 }))),
                None,
                Some(at),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Applied);

        let pending = f.dispatcher.pending_executions("queue-A", "typeX", false).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].activation, at.with_timezone(&Utc));
        assert_eq!(pending[0].directive, Some(TaskPayload(json!({ "n": 1 }))));
    }

    #[tokio::test]
    async fn test_reschedule_without_time_only_cancels() {
        let f = fixture(false);
        let store = f.dispatcher.store().clone();
        f.dispatcher.add_task(&store, "queue-A", "typeX", None, None).await.unwrap();

        let outcome = f
            .rescheduler
            .reschedule_task("queue-A", "typeX", None, Some(&store), None)
            .await
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Applied);
        assert!(
            f.dispatcher
                .pending_executions("queue-A", "typeX", false)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_transaction_defers_to_coordination_queue() {
        let f = fixture(true);
        f.memory.fail_next_transactions(1);

        let at = in_one_hour();
        let outcome = f
            .rescheduler
            .reschedule_task("queue-A", "typeX", None, None, Some(at))
            .await
            .unwrap();
        assert!(matches!(outcome, RescheduleOutcome::Deferred { .. }));
        assert!(logs_contain("queueing it on"));

        assert!(
            f.dispatcher
                .pending_executions("queue-A", "typeX", false)
                .await
                .unwrap()
                .is_empty()
        );

        let coordination = CoordinationConfig::default();
        let queued = f
            .dispatcher
            .pending_executions(&coordination.queue_id, &coordination.reschedule_task_type, false)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        let directive: RescheduleDirective =
            queued[0].directive.as_ref().unwrap().decode().unwrap();
        assert_eq!(directive, RescheduleDirective::new("queue-A", "typeX", Some(at), None));
    }

    #[tokio::test]
    async fn test_fallback_failure_is_returned() {
        let f = fixture(true);
        f.memory.set_unavailable(true);

        let result = f
            .rescheduler
            .reschedule_task("queue-A", "typeX", None, None, Some(in_one_hour()))
            .await;
        assert!(matches!(result, Err(RescheduleError::FallbackEnqueueFailed { .. })));
    }

    #[tokio::test]
    async fn test_rolled_back_attempt_leaves_existing_executions() {
        let f = fixture(true);
        let store = f.dispatcher.store().clone();
        let existing = f.dispatcher.add_task(&store, "queue-A", "typeX", None, None).await.unwrap();
        f.memory.fail_next_transactions(1);

        let directive = RescheduleDirective::new("queue-A", "typeX", Some(in_one_hour()), None);
        let attempt = f.rescheduler.attempt_reschedule(&directive, None).await;
        assert!(matches!(attempt, MutationAttempt::Deferred { .. }));

        let pending = f.dispatcher.pending_executions("queue-A", "typeX", false).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, existing);
    }
}
