//! Backing store contract
//!
//! The subsystem only needs two things from the backing store: a key-value
//! view it can read and write, and a way to run a unit of work against a
//! consistent snapshot that commits or rolls back as a whole.
//!
//! - `KeyValueStore`: async access to JSON values by key
//! - `TransactionRunner`: runs a `UnitOfWork` inside a transaction
//! - `MemoryStore`: in-memory reference implementation with optimistic
//!   concurrency, used by the demo host and the tests

pub mod memory;

use crate::errors::StoreResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

pub use memory::{MemoryStore, MemoryTransactionRunner};

/// Key-value access to the backing store
///
/// Implementations are either a plain handle (every call is applied
/// immediately) or a view bound to an open transaction (calls are applied
/// on commit).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Remove `key`; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Shared handle to a store or to an open transaction
pub type StoreHandle = Arc<dyn KeyValueStore>;

/// Work to run inside a transaction; receives the transactional handle
pub type UnitOfWork<'a> =
    Box<dyn FnOnce(StoreHandle) -> BoxFuture<'a, StoreResult<()>> + Send + 'a>;

/// Box a closure as a [`UnitOfWork`]
///
/// ```rust,ignore
/// runner.run(unit_of_work(move |txn| async move {
///     txn.put("key", serde_json::json!(1)).await
/// }.boxed())).await?;
/// ```
pub fn unit_of_work<'a, F>(work: F) -> UnitOfWork<'a>
where
    F: FnOnce(StoreHandle) -> BoxFuture<'a, StoreResult<()>> + Send + 'a,
{
    Box::new(work)
}

/// Runs units of work against a consistent snapshot
///
/// The work is committed if it returns `Ok` and rolled back otherwise.
/// Implementations abort work that exceeds their transaction timeout and
/// report it as `StoreError::Timeout`.
#[async_trait]
pub trait TransactionRunner: Send + Sync {
    async fn run(&self, work: UnitOfWork<'_>) -> StoreResult<()>;
}

/// Read and deserialize a value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and store a value
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    store.put(key, serde_json::to_value(value)?).await
}

/// Run `work` through `transactions` when available, otherwise directly
/// against `store` with no transactional guarantees
pub async fn run_unit_of_work(
    transactions: Option<&Arc<dyn TransactionRunner>>,
    store: &StoreHandle,
    work: UnitOfWork<'_>,
) -> StoreResult<()> {
    match transactions {
        Some(runner) => runner.run(work).await,
        None => work(store.clone()).await,
    }
}
