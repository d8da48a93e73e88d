//! Task dispatcher type definitions

use crate::store::StoreHandle;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Identifier of one submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Time-ordered id, so ids sort in submission order
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque serialized directive carried by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(pub serde_json::Value);

impl TaskPayload {
    pub fn encode<T: Serialize>(directive: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_value(directive)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }
}

/// A `(queue, task type)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub queue_id: String,
    pub task_type: String,
}

impl TaskRef {
    pub fn new(queue_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            task_type: task_type.into(),
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue_id, self.task_type)
    }
}

/// A scheduled activation of a task that has not finished yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExecution {
    pub task_id: TaskId,
    pub queue_id: String,
    pub task_type: String,
    pub activation: DateTime<Utc>,
    pub directive: Option<TaskPayload>,
    /// A node has claimed this execution and is running it
    pub currently_executing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventType {
    JobStarted,
    JobFinished,
}

/// Outcome of a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Complete,
    Fail,
    Fatal,
    Cancelled,
}

impl JobResult {
    /// Whether this result ends the job for good, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobResult::Complete | JobResult::Fail | JobResult::Fatal)
    }
}

/// Job lifecycle notification broadcast by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_type: JobEventType,
    pub job_result: Option<JobResult>,
    pub tasks: Vec<TaskRef>,
    /// Final status text of the job, if it set one
    pub details: Option<String>,
}

impl JobEvent {
    pub fn started(tasks: Vec<TaskRef>) -> Self {
        Self {
            event_type: JobEventType::JobStarted,
            job_result: None,
            tasks,
            details: None,
        }
    }

    pub fn finished(result: JobResult, tasks: Vec<TaskRef>, details: Option<String>) -> Self {
        Self {
            event_type: JobEventType::JobFinished,
            job_result: Some(result),
            tasks,
            details,
        }
    }
}

/// How a queue runs its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingBehavior {
    /// One task at a time across every node, in activation order
    Sequential,
    /// Up to `max_concurrency` tasks at once
    Parallel { max_concurrency: usize },
}

/// Whether the dispatcher wraps a processor in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// The processor gets the plain store handle and manages its own transactions
    Unsafe,
    /// The whole processor run is one unit of work
    Full,
}

/// A single execution of a task, handed to its processor
#[derive(Clone)]
pub struct TaskJob {
    pub task_id: TaskId,
    pub queue_id: String,
    pub task_type: String,
    pub activation: DateTime<Utc>,
    payload: Option<TaskPayload>,
    store: StoreHandle,
    details: Arc<RwLock<Option<String>>>,
}

impl TaskJob {
    pub fn new(
        task_id: TaskId,
        task: TaskRef,
        activation: DateTime<Utc>,
        payload: Option<TaskPayload>,
        store: StoreHandle,
    ) -> Self {
        Self {
            task_id,
            queue_id: task.queue_id,
            task_type: task.task_type,
            activation,
            payload,
            store,
            details: Arc::new(RwLock::new(None)),
        }
    }

    /// Decode the directive; `Ok(None)` when the task carries none
    pub fn directive<D: DeserializeOwned>(&self) -> Result<Option<D>, serde_json::Error> {
        self.payload.as_ref().map(TaskPayload::decode).transpose()
    }

    pub fn payload(&self) -> Option<&TaskPayload> {
        self.payload.as_ref()
    }

    /// Set the user-visible status text of this job
    pub fn update(&self, details: impl Into<String>) {
        *self.details.write().unwrap_or_else(PoisonError::into_inner) = Some(details.into());
    }

    pub fn details(&self) -> Option<String> {
        self.details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store handle the processor should use
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Same job bound to another store handle; status text is shared
    pub fn with_store(&self, store: StoreHandle) -> Self {
        Self {
            store,
            ..self.clone()
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.queue_id.clone(), self.task_type.clone())
    }
}

impl fmt::Debug for TaskJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskJob")
            .field("task_id", &self.task_id)
            .field("queue_id", &self.queue_id)
            .field("task_type", &self.task_type)
            .field("activation", &self.activation)
            .field("payload", &self.payload)
            .field("details", &self.details())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn job(payload: Option<TaskPayload>) -> TaskJob {
        TaskJob::new(
            TaskId::new(),
            TaskRef::new("queue-A", "typeX"),
            Utc::now(),
            payload,
            MemoryStore::arc(),
        )
    }

    #[test]
    fn test_task_ids_sort_in_creation_order() {
        let ids: Vec<TaskId> = (0..50).map(|_| TaskId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_directive_decoding() {
        assert_eq!(job(None).directive::<serde_json::Value>().unwrap(), None);

        let job = job(Some(TaskPayload(json!({ "command_id": "cmd-1" }))));
        let decoded: serde_json::Value = job.directive().unwrap().unwrap();
        assert_eq!(decoded["command_id"], "cmd-1");
        assert!(job.directive::<u32>().is_err());
    }

    #[test]
    fn test_status_text_is_shared_between_store_views() {
        let job = job(None);
        let bound = job.with_store(MemoryStore::arc());
        bound.update("Importing replication package...");
        assert_eq!(job.details().as_deref(), Some("Importing replication package..."));
    }

    #[test]
    fn test_terminal_results() {
        assert!(JobResult::Complete.is_terminal());
        assert!(JobResult::Fail.is_terminal());
        assert!(JobResult::Fatal.is_terminal());
        assert!(!JobResult::Cancelled.is_terminal());
    }
}
