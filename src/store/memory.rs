//! In-memory transactional key-value store
//!
//! Every entry carries a version. A transaction remembers the version of
//! each key it touched and buffers its writes; commit fails with
//! `StoreError::Conflict` when any touched key changed in the meantime.

use super::{KeyValueStore, StoreHandle, TransactionRunner, UnitOfWork};
use crate::errors::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
}

#[derive(Debug, Default)]
struct FaultPlan {
    failing_transactions: u32,
    unavailable: bool,
}

/// Shared in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    last_version: AtomicU64,
    faults: std::sync::Mutex<FaultPlan>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` transactions fail before running their work
    pub fn fail_next_transactions(&self, count: u32) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_transactions = count;
    }

    /// Simulate a store outage; every operation fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable = unavailable;
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable
        {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        Ok(())
    }

    fn take_transaction_fault(&self) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if faults.failing_transactions > 0 {
            faults.failing_transactions -= 1;
            true
        } else {
            false
        }
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn entry(&self, key: &str) -> StoreResult<Option<Entry>> {
        self.check_available()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn scan_entries(&self, prefix: &str) -> StoreResult<Vec<(String, Entry)>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    async fn commit(
        &self,
        observed: HashMap<String, Option<u64>>,
        writes: BTreeMap<String, Option<Value>>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;

        for (key, seen) in &observed {
            let current = entries.get(key).map(|entry| entry.version);
            if current != *seen {
                debug!("Transaction conflict on '{}' (seen {:?}, now {:?})", key, seen, current);
                return Err(StoreError::Conflict { key: key.clone() });
            }
        }

        let write_count = writes.len();
        for (key, write) in writes {
            match write {
                Some(value) => {
                    let version = self.next_version();
                    entries.insert(key, Entry { value, version });
                }
                None => {
                    entries.remove(&key);
                }
            }
        }

        trace!("Committed transaction with {} writes", write_count);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        self.check_available()?;
        let version = self.next_version();
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, version });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        Ok(self
            .scan_entries(prefix)
            .await?
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect())
    }
}

/// Store view bound to one open transaction
#[derive(Debug)]
pub struct MemoryTransaction {
    store: Arc<MemoryStore>,
    observed: Mutex<HashMap<String, Option<u64>>>,
    writes: Mutex<BTreeMap<String, Option<Value>>>,
}

impl MemoryTransaction {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            observed: Mutex::new(HashMap::new()),
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    async fn observe(&self, key: &str, version: Option<u64>) {
        self.observed
            .lock()
            .await
            .entry(key.to_string())
            .or_insert(version);
    }

    async fn observe_current(&self, key: &str) -> StoreResult<Option<Value>> {
        let entry = self.store.entry(key).await?;
        self.observe(key, entry.as_ref().map(|e| e.version)).await;
        Ok(entry.map(|e| e.value))
    }

    async fn commit(&self) -> StoreResult<()> {
        let observed = std::mem::take(&mut *self.observed.lock().await);
        let writes = std::mem::take(&mut *self.writes.lock().await);
        self.store.commit(observed, writes).await
    }
}

#[async_trait]
impl KeyValueStore for MemoryTransaction {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        if let Some(pending) = self.writes.lock().await.get(key) {
            return Ok(pending.clone());
        }
        self.observe_current(key).await
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        if !self.observed.lock().await.contains_key(key) {
            self.observe_current(key).await?;
        }
        self.writes.lock().await.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let pending = self.writes.lock().await.get(key).cloned();
        let existed = match pending {
            Some(write) => write.is_some(),
            None => self.observe_current(key).await?.is_some(),
        };
        self.writes.lock().await.insert(key.to_string(), None);
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let mut merged = BTreeMap::new();
        for (key, entry) in self.store.scan_entries(prefix).await? {
            self.observe(&key, Some(entry.version)).await;
            merged.insert(key, entry.value);
        }

        let writes = self.writes.lock().await;
        for (key, write) in writes.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match write {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }
}

/// Runs units of work as optimistic transactions against a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryTransactionRunner {
    store: Arc<MemoryStore>,
    timeout: Duration,
}

impl MemoryTransactionRunner {
    pub fn new(store: Arc<MemoryStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl TransactionRunner for MemoryTransactionRunner {
    async fn run(&self, work: UnitOfWork<'_>) -> StoreResult<()> {
        self.store.check_available()?;
        if self.store.take_transaction_fault() {
            warn!("Injected transaction failure");
            return Err(StoreError::unavailable("injected transaction failure"));
        }

        let transaction = Arc::new(MemoryTransaction::new(self.store.clone()));
        let handle: StoreHandle = transaction.clone();

        match tokio::time::timeout(self.timeout, work(handle)).await {
            Ok(Ok(())) => transaction.commit().await,
            Ok(Err(e)) => {
                debug!("Rolling back transaction: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Transaction exceeded {:?}, rolling back", self.timeout);
                Err(StoreError::Timeout {
                    elapsed: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::unit_of_work;
    use futures::FutureExt;
    use serde_json::json;

    fn runner(store: &Arc<MemoryStore>) -> MemoryTransactionRunner {
        MemoryTransactionRunner::new(store.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_commit_applies_buffered_writes() {
        let store = MemoryStore::arc();
        store.put("keep", json!(1)).await.unwrap();
        store.put("drop", json!(2)).await.unwrap();

        runner(&store)
            .run(unit_of_work(|txn| {
                async move {
                    txn.put("new", json!("value")).await?;
                    txn.delete("drop").await?;
                    // Reads inside the transaction see its own writes
                    assert_eq!(txn.get("new").await?, Some(json!("value")));
                    assert_eq!(txn.get("drop").await?, None);
                    Ok(())
                }
                .boxed()
            }))
            .await
            .unwrap();

        assert_eq!(store.get("new").await.unwrap(), Some(json!("value")));
        assert_eq!(store.get("drop").await.unwrap(), None);
        assert_eq!(store.get("keep").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_failed_work_rolls_back() {
        let store = MemoryStore::arc();

        let result = runner(&store)
            .run(unit_of_work(|txn| {
                async move {
                    txn.put("partial", json!(true)).await?;
                    Err(StoreError::aborted("import failed halfway"))
                }
                .boxed()
            }))
            .await;

        assert!(matches!(result, Err(StoreError::Aborted { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_writer_causes_conflict() {
        let store = MemoryStore::arc();
        store.put("counter", json!(1)).await.unwrap();
        let outside = store.clone();

        let result = runner(&store)
            .run(unit_of_work(move |txn| {
                async move {
                    let current = txn.get("counter").await?;
                    assert_eq!(current, Some(json!(1)));
                    // Another writer commits in between
                    outside.put("counter", json!(5)).await?;
                    txn.put("counter", json!(2)).await
                }
                .boxed()
            }))
            .await;

        assert!(matches!(result, Err(StoreError::Conflict { ref key }) if key == "counter"));
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_slow_work_times_out() {
        let store = MemoryStore::arc();
        let runner = MemoryTransactionRunner::new(store.clone(), Duration::from_millis(20));

        let result = runner
            .run(unit_of_work(|txn| {
                async move {
                    txn.put("slow", json!(1)).await?;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
                .boxed()
            }))
            .await;

        assert!(matches!(result, Err(StoreError::Timeout { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_injected_faults_and_outage() {
        let store = MemoryStore::arc();
        store.fail_next_transactions(1);

        let ok_work = || unit_of_work(|_txn| async { Ok(()) }.boxed());
        assert!(matches!(
            runner(&store).run(ok_work()).await,
            Err(StoreError::Unavailable { .. })
        ));
        assert!(runner(&store).run(ok_work()).await.is_ok());

        store.set_unavailable(true);
        assert!(store.get("any").await.is_err());
        assert!(runner(&store).run(ok_work()).await.is_err());
        store.set_unavailable(false);
        assert!(store.get("any").await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_prefix_merges_pending_writes() {
        let store = MemoryStore::arc();
        store.put("tasks/a/1", json!(1)).await.unwrap();
        store.put("tasks/a/2", json!(2)).await.unwrap();
        store.put("tasks/b/1", json!(3)).await.unwrap();

        runner(&store)
            .run(unit_of_work(|txn| {
                async move {
                    txn.delete("tasks/a/1").await?;
                    txn.put("tasks/a/3", json!(4)).await?;
                    let keys: Vec<String> = txn
                        .scan_prefix("tasks/a/")
                        .await?
                        .into_iter()
                        .map(|(key, _)| key)
                        .collect();
                    assert_eq!(keys, vec!["tasks/a/2".to_string(), "tasks/a/3".to_string()]);
                    Ok(())
                }
                .boxed()
            }))
            .await
            .unwrap();

        assert_eq!(store.scan_prefix("tasks/").await.unwrap().len(), 3);
    }
}
