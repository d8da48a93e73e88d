//! Dispatcher runner service for executing claimed tasks

use super::memory::{ClaimedTask, DispatcherStats, InMemoryDispatcher};
use super::{JobEvent, JobResult, TaskJob, TransactionMode};
use crate::config::DispatcherConfig;
use crate::errors::{DispatchResult, ProcessingError, StoreError};
use crate::store::unit_of_work;
use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls the dispatcher for ready tasks and runs their processors
pub struct DispatcherRunner {
    dispatcher: Arc<InMemoryDispatcher>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    running: Mutex<JoinSet<()>>,
}

impl DispatcherRunner {
    pub fn new(dispatcher: Arc<InMemoryDispatcher>, config: &DispatcherConfig) -> Self {
        Self {
            dispatcher,
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
            running: Mutex::new(JoinSet::new()),
        }
    }

    /// Run the polling loop until `cancellation_token` fires
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            "Starting dispatcher runner on node '{}' (poll interval: {:?})",
            self.dispatcher.node_id(),
            self.poll_interval
        );
        let mut poll = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.process_pending().await {
                        error!("Error processing pending tasks: {}", e);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Dispatcher runner received cancellation signal");
                    self.wait_for_running_jobs_to_complete().await;
                    break;
                }
            }
        }

        info!("Dispatcher runner stopped");
        Ok(())
    }

    /// Claim ready tasks and start them; returns how many were started
    pub async fn process_pending(&self) -> DispatchResult<usize> {
        self.reap_finished().await;

        let claimed = self.dispatcher.claim_ready(Utc::now()).await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!("Found {} tasks ready for execution", claimed.len());
        let started = claimed.len();
        let mut running = self.running.lock().await;
        for task in claimed {
            let dispatcher = self.dispatcher.clone();
            running.spawn(Self::execute(dispatcher, task));
        }

        Ok(started)
    }

    /// Run ready tasks, wait for them, and repeat until nothing is ready
    ///
    /// Returns the number of executions. Tasks scheduled in the future are
    /// left alone.
    pub async fn run_until_idle(&self) -> DispatchResult<usize> {
        let mut executed = 0;
        loop {
            let started = self.process_pending().await?;
            let waited = self.join_running().await;
            executed += started;
            if started == 0 && waited == 0 {
                return Ok(executed);
            }
        }
    }

    async fn execute(dispatcher: Arc<InMemoryDispatcher>, task: ClaimedTask) {
        let ClaimedTask { job, processor } = task;
        let task_ref = job.task_ref();

        info!("Starting execution of task {} ({})", job.task_id, task_ref);
        dispatcher.publish(JobEvent::started(vec![task_ref.clone()]));

        let start_time = Instant::now();
        let outcome = match processor.transaction_mode {
            TransactionMode::Unsafe => processor.processor.process(&job).await,
            TransactionMode::Full => {
                Self::process_in_transaction(&dispatcher, &processor.processor, &job).await
            }
        };
        let duration = start_time.elapsed();

        let result = match &outcome {
            Ok(()) => {
                info!("Task {} ({}) completed in {:?}", job.task_id, task_ref, duration);
                JobResult::Complete
            }
            Err(ProcessingError::Fatal { message }) => {
                error!(
                    "Task {} ({}) failed fatally after {:?}: {}",
                    job.task_id, task_ref, duration, message
                );
                JobResult::Fatal
            }
            Err(e) => {
                error!("Task {} ({}) failed after {:?}: {}", job.task_id, task_ref, duration, e);
                JobResult::Fail
            }
        };

        // The record goes away whatever the outcome
        if let Err(e) = dispatcher.complete(&job).await {
            warn!("Failed to remove record of task {}: {}", job.task_id, e);
        }

        dispatcher.publish(JobEvent::finished(result, vec![task_ref], job.details()));
    }

    async fn process_in_transaction(
        dispatcher: &InMemoryDispatcher,
        processor: &Arc<dyn super::TaskProcessor>,
        job: &TaskJob,
    ) -> Result<(), ProcessingError> {
        let Some(transactions) = dispatcher.transactions() else {
            return processor.process(job).await;
        };

        let failure: Mutex<Option<ProcessingError>> = Mutex::new(None);
        let failure_ref = &failure;

        let committed = transactions
            .run(unit_of_work(move |txn| {
                async move {
                    let bound = job.with_store(txn);
                    match processor.process(&bound).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            let reason = e.to_string();
                            *failure_ref.lock().await = Some(e);
                            Err(StoreError::aborted(reason))
                        }
                    }
                }
                .boxed()
            }))
            .await;

        match (committed, failure.into_inner()) {
            (_, Some(processing_error)) => Err(processing_error),
            (Ok(()), None) => Ok(()),
            (Err(e), None) => Err(ProcessingError::Failed(e.into())),
        }
    }

    /// Collect results of executions that already finished
    async fn reap_finished(&self) {
        let mut running = self.running.lock().await;
        while let Some(joined) = running.try_join_next() {
            if let Err(e) = joined {
                error!("Task execution panicked: {}", e);
            }
        }
    }

    /// Wait for every started execution; returns how many were awaited
    async fn join_running(&self) -> usize {
        let mut running = self.running.lock().await;
        let mut joined = 0;
        while let Some(result) = running.join_next().await {
            joined += 1;
            if let Err(e) = result {
                error!("Task execution panicked: {}", e);
            }
        }
        joined
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Wait for all running jobs to complete during shutdown
    async fn wait_for_running_jobs_to_complete(&self) {
        info!("Waiting for running jobs to complete...");
        self.dump_job_status().await;

        match tokio::time::timeout(self.shutdown_grace, self.join_running()).await {
            Ok(joined) => info!("All jobs completed ({} awaited)", joined),
            Err(_) => {
                let mut running = self.running.lock().await;
                warn!(
                    "Timeout waiting for {} jobs to complete, proceeding with shutdown",
                    running.len()
                );
                running.abort_all();
                while running.join_next().await.is_some() {}
                drop(running);

                match self.dispatcher.release_claims().await {
                    Ok(released) => info!("Released {} aborted task claims", released),
                    Err(e) => error!("Failed to release aborted task claims: {}", e),
                }
                self.dump_job_status().await;
            }
        }
    }

    /// Dump current task status for debugging
    async fn dump_job_status(&self) {
        match self.dispatcher.stats().await {
            Ok(DispatcherStats {
                pending,
                running,
                registered_queues,
                by_queue,
            }) => {
                info!("=== TASK STATUS DUMP ===");
                info!(
                    "Task Stats - Pending: {}, Running: {}, Queues: {}",
                    pending, running, registered_queues
                );
                for (queue_id, (queue_pending, queue_running)) in &by_queue {
                    info!("  - {}: {} pending, {} running", queue_id, queue_pending, queue_running);
                }
                info!("=== END TASK STATUS DUMP ===");
            }
            Err(e) => warn!("Failed to collect task status: {}", e),
        }
    }
}
