//! Host task dispatcher contract
//!
//! The dispatcher accepts tasks for named queues, runs them through the
//! processor registered for their task type, tracks pending executions and
//! broadcasts job lifecycle events. The task scheduling extensions only
//! consume this contract; `InMemoryDispatcher` and `DispatcherRunner` are a
//! reference host used by the demo binary and the tests.

pub mod memory;
pub mod runner;
pub mod types;

use crate::errors::{DispatchResult, ProcessingError};
use crate::store::StoreHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use memory::{DispatcherStats, InMemoryDispatcher};
pub use runner::DispatcherRunner;
pub use types::*;

/// Handles executions of one task type
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, job: &TaskJob) -> Result<(), ProcessingError>;
}

/// Processor bound to the task type it serves
#[derive(Clone)]
pub struct ProcessorRegistration {
    pub task_type: String,
    pub transaction_mode: TransactionMode,
    pub processor: Arc<dyn TaskProcessor>,
}

impl ProcessorRegistration {
    pub fn new(
        task_type: impl Into<String>,
        transaction_mode: TransactionMode,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            transaction_mode,
            processor,
        }
    }
}

impl fmt::Debug for ProcessorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistration")
            .field("task_type", &self.task_type)
            .field("transaction_mode", &self.transaction_mode)
            .finish_non_exhaustive()
    }
}

/// A queue and the processors it dispatches to, keyed by task type
#[derive(Debug, Clone)]
pub struct QueueRegistration {
    pub queue_id: String,
    pub behavior: ProcessingBehavior,
    pub processors: Vec<ProcessorRegistration>,
}

impl QueueRegistration {
    pub fn new(queue_id: impl Into<String>, behavior: ProcessingBehavior) -> Self {
        Self {
            queue_id: queue_id.into(),
            behavior,
            processors: Vec::new(),
        }
    }

    pub fn with_processor(mut self, registration: ProcessorRegistration) -> Self {
        self.processors.push(registration);
        self
    }

    /// Processor registered for `task_type`
    pub fn processor(&self, task_type: &str) -> Option<&ProcessorRegistration> {
        self.processors.iter().find(|p| p.task_type == task_type)
    }
}

/// Operations the host dispatcher provides
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a task; `activation` defaults to now
    async fn add_task(
        &self,
        store: &StoreHandle,
        queue_id: &str,
        task_type: &str,
        directive: Option<TaskPayload>,
        activation: Option<DateTime<Utc>>,
    ) -> DispatchResult<TaskId>;

    /// Remove future executions of a task type; returns how many were removed
    async fn cancel_all_future_executions(
        &self,
        queue_id: &str,
        task_type: &str,
        include_currently_executing: bool,
        store: &StoreHandle,
    ) -> DispatchResult<usize>;

    /// Executions of a task type that have not finished, in activation order
    async fn pending_executions(
        &self,
        queue_id: &str,
        task_type: &str,
        include_currently_executing: bool,
    ) -> DispatchResult<Vec<PendingExecution>>;

    async fn register_queue(&self, registration: QueueRegistration) -> DispatchResult<()>;

    /// Subscribe to job lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}
