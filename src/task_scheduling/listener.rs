//! Job-finish listener
//!
//! After every terminal job outcome the listener re-derives, from the
//! recurrence policy, whether each affected task type should have a future
//! execution, and reschedules it when none is pending. A pending execution
//! makes the reconciliation a no-op, so overlapping events for the same pair
//! never double-schedule.

use super::recurrence::RecurrencePolicy;
use super::rescheduler::{RescheduleOutcome, TaskRescheduler};
use crate::dispatcher::{JobEvent, JobEventType, TaskDispatcher, TaskRef};
use crate::errors::RescheduleError;
use crate::store::StoreHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What reconciling one `(queue, task type)` pair did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A future execution already exists
    AlreadyScheduled,
    /// The policy has no next execution for this pair
    NotRecurring,
    Rescheduled {
        next_execution: DateTime<Utc>,
        outcome: RescheduleOutcome,
    },
}

pub struct JobFinishListener {
    dispatcher: Arc<dyn TaskDispatcher>,
    rescheduler: Arc<TaskRescheduler>,
    policy: Arc<dyn RecurrencePolicy>,
    store: StoreHandle,
}

impl JobFinishListener {
    pub fn new(
        dispatcher: Arc<dyn TaskDispatcher>,
        rescheduler: Arc<TaskRescheduler>,
        policy: Arc<dyn RecurrencePolicy>,
        store: StoreHandle,
    ) -> Self {
        Self {
            dispatcher,
            rescheduler,
            policy,
            store,
        }
    }

    /// React to one job event; errors are logged per task
    pub async fn handle_event(&self, event: &JobEvent) -> Vec<(TaskRef, ReconcileOutcome)> {
        if event.event_type != JobEventType::JobFinished || event.tasks.is_empty() {
            return Vec::new();
        }
        match event.job_result {
            Some(result) if result.is_terminal() => {}
            other => {
                debug!("Not rescheduling after job result {:?}", other);
                return Vec::new();
            }
        }

        let mut outcomes = Vec::with_capacity(event.tasks.len());
        for task in &event.tasks {
            match self.reconcile(&task.queue_id, &task.task_type).await {
                Ok(outcome) => outcomes.push((task.clone(), outcome)),
                Err(e) => error!("Failed to reschedule {}: {}", task, e),
            }
        }
        outcomes
    }

    /// Make sure `(queue_id, task_type)` has a future execution if the
    /// policy says it should
    pub async fn reconcile(
        &self,
        queue_id: &str,
        task_type: &str,
    ) -> Result<ReconcileOutcome, RescheduleError> {
        let pending = self
            .dispatcher
            .pending_executions(queue_id, task_type, false)
            .await
            .map_err(|source| RescheduleError::PendingLookup {
                queue_id: queue_id.to_string(),
                task_type: task_type.to_string(),
                source,
            })?;
        if !pending.is_empty() {
            debug!(
                "{} on {} already has {} pending executions, skipping",
                task_type,
                queue_id,
                pending.len()
            );
            return Ok(ReconcileOutcome::AlreadyScheduled);
        }

        let Some(next_execution) = self.policy.next_execution(queue_id, task_type) else {
            return Ok(ReconcileOutcome::NotRecurring);
        };

        info!(
            "Re-scheduling {} on {} for {}",
            task_type,
            queue_id,
            next_execution.to_rfc3339()
        );
        let outcome = self
            .rescheduler
            .reschedule_task(
                queue_id,
                task_type,
                None,
                Some(&self.store),
                Some(next_execution.fixed_offset()),
            )
            .await?;

        Ok(ReconcileOutcome::Rescheduled {
            next_execution,
            outcome,
        })
    }

    /// Consume job events until cancelled or the channel closes
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<JobEvent>,
        cancellation_token: CancellationToken,
    ) {
        info!("Starting job-finish listener");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        self.handle_event(&event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Job-finish listener fell behind and missed {} events", missed);
                    }
                    Err(RecvError::Closed) => {
                        info!("Job event channel closed");
                        break;
                    }
                },
                _ = cancellation_token.cancelled() => {
                    info!("Job-finish listener received cancellation signal");
                    break;
                }
            }
        }

        info!("Job-finish listener stopped");
    }
}
