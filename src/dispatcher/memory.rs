//! In-memory reference dispatcher
//!
//! Task records live in the backing store under
//! `tasks/{queue}/{task type}/{task id}` so that submissions and
//! cancellations made through a transactional handle commit or roll back
//! together with the rest of the unit of work. Every cancellation also bumps
//! `task-revisions/{queue}/{task type}`; two transactions that both cancel
//! the same pair therefore conflict instead of both committing.

use super::{
    JobEvent, PendingExecution, ProcessingBehavior, ProcessorRegistration, QueueRegistration,
    TaskDispatcher, TaskId, TaskJob, TaskPayload, TaskRef,
};
use crate::errors::{DispatchError, DispatchResult, StoreResult};
use crate::store::{
    KeyValueStore, StoreHandle, TransactionRunner, get_json, put_json, run_unit_of_work,
    unit_of_work,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, trace};

const TASKS_PREFIX: &str = "tasks/";
const REVISIONS_PREFIX: &str = "task-revisions/";
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TaskState {
    Pending,
    Running {
        node_id: String,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRecord {
    id: TaskId,
    queue_id: String,
    task_type: String,
    activation: DateTime<Utc>,
    directive: Option<TaskPayload>,
    created_at: DateTime<Utc>,
    state: TaskState,
}

impl TaskRecord {
    fn is_running(&self) -> bool {
        matches!(self.state, TaskState::Running { .. })
    }

    fn into_pending_execution(self) -> PendingExecution {
        let currently_executing = self.is_running();
        PendingExecution {
            task_id: self.id,
            queue_id: self.queue_id,
            task_type: self.task_type,
            activation: self.activation,
            directive: self.directive,
            currently_executing,
        }
    }
}

fn queue_prefix(queue_id: &str) -> String {
    format!("{TASKS_PREFIX}{}/", urlencoding::encode(queue_id))
}

fn task_prefix(queue_id: &str, task_type: &str) -> String {
    format!("{}{}/", queue_prefix(queue_id), urlencoding::encode(task_type))
}

fn task_key(queue_id: &str, task_type: &str, id: TaskId) -> String {
    format!("{}{}", task_prefix(queue_id, task_type), id)
}

fn revision_key(queue_id: &str, task_type: &str) -> String {
    format!(
        "{REVISIONS_PREFIX}{}/{}",
        urlencoding::encode(queue_id),
        urlencoding::encode(task_type)
    )
}

async fn load_records(
    store: &dyn KeyValueStore,
    prefix: &str,
) -> StoreResult<Vec<(String, TaskRecord)>> {
    let mut records = Vec::new();
    for (key, value) in store.scan_prefix(prefix).await? {
        records.push((key, serde_json::from_value(value)?));
    }
    Ok(records)
}

/// A task claimed by this node, ready to hand to its processor
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub job: TaskJob,
    pub processor: ProcessorRegistration,
}

/// Snapshot of the task records in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub pending: usize,
    pub running: usize,
    pub registered_queues: usize,
    /// `(pending, running)` per queue id
    pub by_queue: BTreeMap<String, (usize, usize)>,
}

/// Dispatcher that keeps its task records in the backing store
pub struct InMemoryDispatcher {
    store: StoreHandle,
    transactions: Option<Arc<dyn TransactionRunner>>,
    queues: RwLock<BTreeMap<String, Arc<QueueRegistration>>>,
    events: broadcast::Sender<JobEvent>,
    node_id: String,
}

impl InMemoryDispatcher {
    pub fn new(
        store: StoreHandle,
        transactions: Option<Arc<dyn TransactionRunner>>,
        node_id: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            transactions,
            queues: RwLock::new(BTreeMap::new()),
            events,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn transactions(&self) -> Option<&Arc<dyn TransactionRunner>> {
        self.transactions.as_ref()
    }

    pub async fn queue(&self, queue_id: &str) -> Option<Arc<QueueRegistration>> {
        self.queues.read().await.get(queue_id).cloned()
    }

    /// Broadcast a job event to every subscriber
    pub fn publish(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            trace!("No subscribers for job event");
        }
    }

    /// Claim every task that is due and has capacity on its queue
    ///
    /// Each queue is claimed in its own transaction. A queue whose claim
    /// hits a transient store error (typically another node claiming the
    /// same queue) is skipped until the next round.
    pub async fn claim_ready(&self, now: DateTime<Utc>) -> DispatchResult<Vec<ClaimedTask>> {
        let queues: Vec<Arc<QueueRegistration>> =
            self.queues.read().await.values().cloned().collect();

        let mut claimed = Vec::new();
        for queue in queues {
            match self.claim_from_queue(&queue, now).await {
                Ok(mut tasks) => claimed.append(&mut tasks),
                Err(DispatchError::Store(e)) if e.is_transient() => {
                    debug!("Skipping claim on queue '{}' this round: {}", queue.queue_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(claimed)
    }

    async fn claim_from_queue(
        &self,
        queue: &QueueRegistration,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ClaimedTask>> {
        let selected: Mutex<Vec<TaskRecord>> = Mutex::new(Vec::new());
        let prefix = queue_prefix(&queue.queue_id);

        let selected_ref = &selected;
        let prefix_ref = prefix.as_str();
        let node_id = self.node_id.as_str();

        let work = unit_of_work(move |txn| {
            async move {
                let records = load_records(txn.as_ref(), prefix_ref).await?;
                let running = records.iter().filter(|(_, r)| r.is_running()).count();
                let capacity = match queue.behavior {
                    ProcessingBehavior::Sequential => 1usize.saturating_sub(running),
                    ProcessingBehavior::Parallel { max_concurrency } => {
                        max_concurrency.saturating_sub(running)
                    }
                };
                if capacity == 0 {
                    return Ok(());
                }

                let mut ready: Vec<(String, TaskRecord)> = records
                    .into_iter()
                    .filter(|(_, r)| {
                        !r.is_running()
                            && r.activation <= now
                            && queue.processor(&r.task_type).is_some()
                    })
                    .collect();
                ready.sort_by_key(|(_, r)| (r.activation, r.id));

                let mut claimed = Vec::new();
                for (key, mut record) in ready.into_iter().take(capacity) {
                    record.state = TaskState::Running {
                        node_id: node_id.to_string(),
                        started_at: Utc::now(),
                    };
                    put_json(txn.as_ref(), &key, &record).await?;
                    claimed.push(record);
                }

                *selected_ref.lock().await = claimed;
                Ok(())
            }
            .boxed()
        });

        run_unit_of_work(self.transactions.as_ref(), &self.store, work).await?;

        let records = selected.into_inner();
        let mut claimed = Vec::with_capacity(records.len());
        for record in records {
            let Some(processor) = queue.processor(&record.task_type).cloned() else {
                continue;
            };
            let job = TaskJob::new(
                record.id,
                TaskRef::new(record.queue_id, record.task_type),
                record.activation,
                record.directive,
                self.store.clone(),
            );
            debug!(
                "Node '{}' claimed task {} ({}/{})",
                self.node_id, job.task_id, job.queue_id, job.task_type
            );
            claimed.push(ClaimedTask { job, processor });
        }

        Ok(claimed)
    }

    /// Remove the record of a finished execution
    pub async fn complete(&self, job: &TaskJob) -> DispatchResult<()> {
        let key = task_key(&job.queue_id, &job.task_type, job.task_id);
        if !self.store.delete(&key).await? {
            debug!("Task {} was already removed before it finished", job.task_id);
        }
        Ok(())
    }

    /// Put every execution this node still holds as running back to pending
    ///
    /// Used after aborting executions at shutdown and when a node starts, so
    /// that a sequential queue is not held by a claim nobody will finish.
    pub async fn release_claims(&self) -> DispatchResult<usize> {
        let mut released = 0;
        for (key, mut record) in load_records(self.store.as_ref(), TASKS_PREFIX).await? {
            let TaskState::Running { node_id, .. } = &record.state else {
                continue;
            };
            if *node_id != self.node_id {
                continue;
            }
            record.state = TaskState::Pending;
            put_json(self.store.as_ref(), &key, &record).await?;
            released += 1;
        }

        if released > 0 {
            info!("Node '{}' released {} unfinished task claims", self.node_id, released);
        }
        Ok(released)
    }

    /// Count pending and running task records
    pub async fn stats(&self) -> DispatchResult<DispatcherStats> {
        let mut stats = DispatcherStats {
            registered_queues: self.queues.read().await.len(),
            ..DispatcherStats::default()
        };

        for (_, record) in load_records(self.store.as_ref(), TASKS_PREFIX).await? {
            let counts = stats.by_queue.entry(record.queue_id.clone()).or_default();
            if record.is_running() {
                stats.running += 1;
                counts.1 += 1;
            } else {
                stats.pending += 1;
                counts.0 += 1;
            }
        }

        Ok(stats)
    }

    async fn bump_revision(
        &self,
        store: &dyn KeyValueStore,
        queue_id: &str,
        task_type: &str,
    ) -> StoreResult<()> {
        let key = revision_key(queue_id, task_type);
        let current: u64 = get_json(store, &key).await?.unwrap_or(0);
        put_json(store, &key, &(current + 1)).await
    }

    fn validate_registration(registration: &QueueRegistration) -> DispatchResult<()> {
        let invalid = |reason: &str| DispatchError::InvalidQueue {
            queue_id: registration.queue_id.clone(),
            reason: reason.to_string(),
        };

        if registration.queue_id.trim().is_empty() {
            return Err(invalid("queue id must not be empty"));
        }
        if registration.processors.is_empty() {
            return Err(invalid("at least one processor is required"));
        }
        if let ProcessingBehavior::Parallel { max_concurrency: 0 } = registration.behavior {
            return Err(invalid("parallel queues need a concurrency of at least 1"));
        }

        let mut seen = HashSet::new();
        for processor in &registration.processors {
            if !seen.insert(processor.task_type.as_str()) {
                return Err(invalid(&format!(
                    "task type '{}' is registered twice",
                    processor.task_type
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for InMemoryDispatcher {
    async fn add_task(
        &self,
        store: &StoreHandle,
        queue_id: &str,
        task_type: &str,
        directive: Option<TaskPayload>,
        activation: Option<DateTime<Utc>>,
    ) -> DispatchResult<TaskId> {
        let now = Utc::now();
        let record = TaskRecord {
            id: TaskId::new(),
            queue_id: queue_id.to_string(),
            task_type: task_type.to_string(),
            activation: activation.unwrap_or(now),
            directive,
            created_at: now,
            state: TaskState::Pending,
        };

        put_json(store.as_ref(), &task_key(queue_id, task_type, record.id), &record).await?;
        trace!("Stored task record {} for {}/{}", record.id, queue_id, task_type);
        Ok(record.id)
    }

    async fn cancel_all_future_executions(
        &self,
        queue_id: &str,
        task_type: &str,
        include_currently_executing: bool,
        store: &StoreHandle,
    ) -> DispatchResult<usize> {
        let mut removed = 0;
        let records = load_records(store.as_ref(), &task_prefix(queue_id, task_type)).await?;
        for (key, record) in records {
            if record.is_running() && !include_currently_executing {
                continue;
            }
            if store.delete(&key).await? {
                removed += 1;
            }
        }

        self.bump_revision(store.as_ref(), queue_id, task_type).await?;
        debug!("Cancelled {} future executions of {}/{}", removed, queue_id, task_type);
        Ok(removed)
    }

    async fn pending_executions(
        &self,
        queue_id: &str,
        task_type: &str,
        include_currently_executing: bool,
    ) -> DispatchResult<Vec<PendingExecution>> {
        let mut records: Vec<TaskRecord> =
            load_records(self.store.as_ref(), &task_prefix(queue_id, task_type))
                .await?
                .into_iter()
                .map(|(_, record)| record)
                .filter(|record| include_currently_executing || !record.is_running())
                .collect();
        records.sort_by_key(|r| (r.activation, r.id));

        Ok(records
            .into_iter()
            .map(TaskRecord::into_pending_execution)
            .collect())
    }

    async fn register_queue(&self, registration: QueueRegistration) -> DispatchResult<()> {
        Self::validate_registration(&registration)?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(&registration.queue_id) {
            return Err(DispatchError::DuplicateQueue {
                queue_id: registration.queue_id,
            });
        }

        info!(
            "Registered queue '{}' ({:?}) with task types {:?}",
            registration.queue_id,
            registration.behavior,
            registration
                .processors
                .iter()
                .map(|p| p.task_type.as_str())
                .collect::<Vec<_>>()
        );
        queues.insert(registration.queue_id.clone(), Arc::new(registration));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
