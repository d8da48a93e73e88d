//! Entry point the host application wires up at startup

use super::coordination::CoordinationQueue;
use super::directives::ImportDirective;
use super::import::{CommandRegistry, ImportExecutor};
use super::listener::JobFinishListener;
use super::recurrence::RecurrencePolicy;
use super::rescheduler::{RescheduleOutcome, TaskRescheduler};
use crate::config::{Config, CoordinationConfig};
use crate::dispatcher::{TaskDispatcher, TaskId, TaskPayload};
use crate::errors::{DispatchResult, RescheduleError};
use crate::store::{StoreHandle, TransactionRunner};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Collaborators provided by the host application
///
/// `store` is the default handle used whenever an operation is not given
/// one explicitly.
#[derive(Clone)]
pub struct ExtensionContext {
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub store: StoreHandle,
    pub transactions: Option<Arc<dyn TransactionRunner>>,
    pub policy: Arc<dyn RecurrencePolicy>,
    pub commands: Arc<dyn CommandRegistry>,
}

/// Pending work on the coordination queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinationHealth {
    pub queue_id: String,
    pub pending_reschedules: usize,
    pub pending_imports: usize,
}

/// Recurring execution, rescheduling and import coordination on top of a
/// host task dispatcher
#[derive(Clone)]
pub struct TaskManagerExtensions {
    dispatcher: Arc<dyn TaskDispatcher>,
    store: StoreHandle,
    coordination: CoordinationConfig,
    rescheduler: Arc<TaskRescheduler>,
    executor: Arc<ImportExecutor>,
    listener: Arc<JobFinishListener>,
}

impl TaskManagerExtensions {
    pub fn new(context: ExtensionContext, config: &Config) -> Self {
        let ExtensionContext {
            dispatcher,
            store,
            transactions,
            policy,
            commands,
        } = context;

        let rescheduler = Arc::new(TaskRescheduler::new(
            dispatcher.clone(),
            transactions.clone(),
            store.clone(),
            config.coordination.clone(),
        ));
        let executor = Arc::new(ImportExecutor::new(commands, transactions, &config.import));
        let listener = Arc::new(JobFinishListener::new(
            dispatcher.clone(),
            rescheduler.clone(),
            policy,
            store.clone(),
        ));

        Self {
            dispatcher,
            store,
            coordination: config.coordination.clone(),
            rescheduler,
            executor,
            listener,
        }
    }

    /// Register the sequential coordination queue with the dispatcher
    pub async fn register_extensions_queue(&self) -> DispatchResult<()> {
        debug!("Registering coordination queue {}", self.coordination.queue_id);
        self.dispatcher
            .register_queue(CoordinationQueue::registration(
                &self.coordination,
                self.rescheduler.clone(),
                self.executor.clone(),
            ))
            .await
    }

    /// See [`TaskRescheduler::reschedule_task`]
    pub async fn reschedule_task(
        &self,
        queue_id: &str,
        task_type: &str,
        inner_directive: Option<TaskPayload>,
        store: Option<&StoreHandle>,
        schedule_for: Option<DateTime<FixedOffset>>,
    ) -> Result<RescheduleOutcome, RescheduleError> {
        self.rescheduler
            .reschedule_task(queue_id, task_type, inner_directive, store, schedule_for)
            .await
    }

    /// Queue an import of the registered command `command_id`
    pub async fn queue_import(&self, command_id: &str) -> DispatchResult<TaskId> {
        let payload = TaskPayload::encode(&ImportDirective::new(command_id))?;
        let task_id = self
            .add_task(
                &self.store,
                &self.coordination.queue_id,
                &self.coordination.import_task_type,
                Some(payload),
                None,
            )
            .await?;
        info!("Queued import for command '{}' as task {}", command_id, task_id);
        Ok(task_id)
    }

    /// Submit a task, logging what was added
    pub async fn add_task(
        &self,
        store: &StoreHandle,
        queue_id: &str,
        task_type: &str,
        directive: Option<TaskPayload>,
        activation: Option<DateTime<Utc>>,
    ) -> DispatchResult<TaskId> {
        self.rescheduler
            .add_task(store, queue_id, task_type, directive, activation)
            .await
    }

    /// Subscribe to job events now and process them on a background task
    pub fn spawn_listener(&self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let receiver = self.dispatcher.subscribe();
        let listener = self.listener.clone();
        tokio::spawn(async move { listener.run(receiver, cancellation_token).await })
    }

    /// Process job events on the current task until cancelled
    pub async fn run_listener(&self, cancellation_token: CancellationToken) {
        let receiver = self.dispatcher.subscribe();
        self.listener.run(receiver, cancellation_token).await
    }

    pub async fn health_check(&self) -> DispatchResult<CoordinationHealth> {
        let coordination = &self.coordination;
        let pending_reschedules = self
            .dispatcher
            .pending_executions(&coordination.queue_id, &coordination.reschedule_task_type, true)
            .await?
            .len();
        let pending_imports = self
            .dispatcher
            .pending_executions(&coordination.queue_id, &coordination.import_task_type, true)
            .await?
            .len();

        Ok(CoordinationHealth {
            queue_id: self.coordination.queue_id.clone(),
            pending_reschedules,
            pending_imports,
        })
    }

    pub fn coordination(&self) -> &CoordinationConfig {
        &self.coordination
    }

    pub fn rescheduler(&self) -> &Arc<TaskRescheduler> {
        &self.rescheduler
    }

    pub fn import_executor(&self) -> &Arc<ImportExecutor> {
        &self.executor
    }

    pub fn listener(&self) -> &Arc<JobFinishListener> {
        &self.listener
    }
}
