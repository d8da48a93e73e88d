//! Shared setup for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use taskmanager_extensions::config::Config;
use taskmanager_extensions::dispatcher::{
    DispatcherRunner, InMemoryDispatcher, JobEvent, JobEventType, TaskDispatcher,
};
use taskmanager_extensions::errors::{StoreError, StoreResult};
use taskmanager_extensions::store::{
    MemoryStore, MemoryTransactionRunner, StoreHandle, TransactionRunner, UnitOfWork,
};
use taskmanager_extensions::task_scheduling::{
    CommandList, ExtensionContext, HostCommand, ImportCommand, RecurrencePolicy,
    TaskManagerExtensions,
};
use tokio::sync::broadcast;

pub struct Node {
    pub memory: Arc<MemoryStore>,
    pub store: StoreHandle,
    pub dispatcher: Arc<InMemoryDispatcher>,
    pub runner: DispatcherRunner,
    pub extensions: TaskManagerExtensions,
    pub commands: Arc<CommandList>,
    /// Transactions opened by the extensions, which can be taken offline
    pub outage: Arc<OutageTransactions>,
    pub config: Config,
}

/// Transaction runner that fails every unit of work while offline
pub struct OutageTransactions {
    inner: MemoryTransactionRunner,
    offline: AtomicBool,
}

impl OutageTransactions {
    pub fn new(inner: MemoryTransactionRunner) -> Arc<Self> {
        Arc::new(Self {
            inner,
            offline: AtomicBool::new(false),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionRunner for OutageTransactions {
    async fn run(&self, work: UnitOfWork<'_>) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("transactions are offline"));
        }
        self.inner.run(work).await
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.dispatcher.poll_interval = Duration::from_millis(10);
    config.dispatcher.shutdown_grace = Duration::from_secs(1);
    config.store.transaction_timeout = Duration::from_secs(5);
    config.coordination.retry_delay = Duration::from_millis(200);
    config.coordination.retry_jitter_percent = 0;
    config
}

/// A server node; nodes built from the same `memory` share one backing store
pub async fn node(
    memory: Arc<MemoryStore>,
    node_id: &str,
    policy: Arc<dyn RecurrencePolicy>,
) -> Node {
    let config = test_config();
    let store: StoreHandle = memory.clone();
    let memory_transactions =
        MemoryTransactionRunner::new(memory.clone(), config.store.transaction_timeout);
    let outage = OutageTransactions::new(memory_transactions.clone());
    let transactions: Arc<dyn TransactionRunner> = Arc::new(memory_transactions);
    let dispatcher = Arc::new(InMemoryDispatcher::new(
        store.clone(),
        Some(transactions),
        node_id,
    ));
    let commands = Arc::new(CommandList::new());

    let extensions = TaskManagerExtensions::new(
        ExtensionContext {
            dispatcher: dispatcher.clone(),
            store: store.clone(),
            transactions: Some(outage.clone() as Arc<dyn TransactionRunner>),
            policy,
            commands: commands.clone(),
        },
        &config,
    );
    extensions
        .register_extensions_queue()
        .await
        .expect("coordination queue registers");

    let runner = DispatcherRunner::new(dispatcher.clone(), &config.dispatcher);

    Node {
        memory,
        store,
        dispatcher,
        runner,
        extensions,
        commands,
        outage,
        config,
    }
}

pub async fn single_node(policy: Arc<dyn RecurrencePolicy>) -> Node {
    node(MemoryStore::arc(), "node-1", policy).await
}

/// A policy that never re-arms anything
pub fn no_recurrence() -> Arc<dyn RecurrencePolicy> {
    Arc::new(|_queue_id: &str, _task_type: &str| -> Option<DateTime<Utc>> { None })
}

/// Every event currently buffered in `receiver`
pub fn drain_events(receiver: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub fn finished_events(events: &[JobEvent]) -> Vec<&JobEvent> {
    events
        .iter()
        .filter(|e| e.event_type == JobEventType::JobFinished)
        .collect()
}

pub async fn pending_count(node: &Node, queue_id: &str, task_type: &str) -> usize {
    node.dispatcher
        .pending_executions(queue_id, task_type, false)
        .await
        .expect("pending lookup")
        .len()
}

/// Import command that errors a fixed number of times, then succeeds
pub struct FlakyImport {
    pub id: String,
    pub max_attempts: u32,
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakyImport {
    pub fn new(id: &str, max_attempts: u32, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            max_attempts,
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImportCommand for FlakyImport {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn describe(&self) -> String {
        format!("flaky package {}", self.id)
    }

    async fn try_import(&self, _store: &StoreHandle) -> anyhow::Result<bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("transaction aborted on attempt {call}");
        }
        Ok(true)
    }
}

impl HostCommand for FlakyImport {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_import(&self) -> Option<&dyn ImportCommand> {
        Some(self)
    }
}
