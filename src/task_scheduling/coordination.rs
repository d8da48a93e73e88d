//! Sequential coordination queue
//!
//! One queue, processed strictly one task at a time across the deployment,
//! hosting the reschedule and import task types. Both processors run in
//! `TransactionMode::Unsafe` and open their own units of work.

use super::directives::{ImportDirective, RescheduleDirective};
use super::import::ImportExecutor;
use super::rescheduler::{MutationAttempt, TaskRescheduler};
use crate::config::CoordinationConfig;
use crate::dispatcher::{
    ProcessingBehavior, ProcessorRegistration, QueueRegistration, TaskJob, TaskProcessor,
    TransactionMode,
};
use crate::errors::ProcessingError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies queued reschedule directives
pub struct RescheduleProcessor {
    rescheduler: Arc<TaskRescheduler>,
}

impl RescheduleProcessor {
    pub fn new(rescheduler: Arc<TaskRescheduler>) -> Self {
        Self { rescheduler }
    }
}

#[async_trait]
impl TaskProcessor for RescheduleProcessor {
    async fn process(&self, job: &TaskJob) -> Result<(), ProcessingError> {
        let directive = match job.directive::<RescheduleDirective>() {
            Ok(Some(directive)) => directive,
            Ok(None) => {
                debug!("Reschedule task {} carries no directive, nothing to do", job.task_id);
                return Ok(());
            }
            Err(e) => {
                warn!("Ignoring reschedule task {} with malformed directive: {}", job.task_id, e);
                return Ok(());
            }
        };

        match self
            .rescheduler
            .attempt_reschedule(&directive, Some(job.store()))
            .await
        {
            MutationAttempt::Applied => {
                info!(
                    "Applied queued reschedule of {} on {}",
                    directive.task_type, directive.queue_id
                );
                Ok(())
            }
            MutationAttempt::Deferred { reason } => {
                // The directive stays on this queue until it applies
                let requeued = self
                    .rescheduler
                    .requeue_reschedule(&directive, job.store())
                    .await;
                let retry = match requeued {
                    Ok(Some(task_id)) => format!("retry queued as task {task_id}"),
                    Ok(None) => "superseded by a queued reschedule".to_string(),
                    Err(e) => format!("retry could not be queued: {e}"),
                };
                Err(ProcessingError::Failed(anyhow::anyhow!(
                    "Reschedule of {} on {} failed ({}): {}",
                    directive.task_type,
                    directive.queue_id,
                    retry,
                    reason
                )))
            }
        }
    }
}

/// Runs queued replication package imports
pub struct ImportProcessor {
    executor: Arc<ImportExecutor>,
}

impl ImportProcessor {
    pub fn new(executor: Arc<ImportExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskProcessor for ImportProcessor {
    async fn process(&self, job: &TaskJob) -> Result<(), ProcessingError> {
        let directive = match job.directive::<ImportDirective>() {
            Ok(directive) => directive,
            Err(e) => {
                warn!("Ignoring import task {} with malformed directive: {}", job.task_id, e);
                return Ok(());
            }
        };

        // Import outcomes surface through the job status text only
        let report = self.executor.execute(job, directive.as_ref()).await;
        debug!(
            "Import task {} finished: {:?} after {} attempts",
            job.task_id, report.state, report.attempts
        );
        Ok(())
    }
}

/// Builds the registration of the coordination queue
pub struct CoordinationQueue;

impl CoordinationQueue {
    pub fn registration(
        coordination: &CoordinationConfig,
        rescheduler: Arc<TaskRescheduler>,
        executor: Arc<ImportExecutor>,
    ) -> QueueRegistration {
        QueueRegistration::new(coordination.queue_id.clone(), ProcessingBehavior::Sequential)
            .with_processor(ProcessorRegistration::new(
                coordination.reschedule_task_type.clone(),
                TransactionMode::Unsafe,
                Arc::new(RescheduleProcessor::new(rescheduler)),
            ))
            .with_processor(ProcessorRegistration::new(
                coordination.import_task_type.clone(),
                TransactionMode::Unsafe,
                Arc::new(ImportProcessor::new(executor)),
            ))
    }
}
