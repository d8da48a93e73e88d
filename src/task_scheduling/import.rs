//! Long-running import execution
//!
//! An import may outlive a single transaction. Each attempt runs the
//! command inside a fresh unit of work; because the store-side import skips
//! items that already exist, repeating an attempt after a partial failure is
//! safe and eventually completes the import.

use super::directives::ImportDirective;
use crate::config::ImportConfig;
use crate::dispatcher::TaskJob;
use crate::errors::StoreError;
use crate::store::{StoreHandle, TransactionRunner, run_unit_of_work, unit_of_work};
use crate::utils::jittered;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const STATUS_IMPORTING: &str = "Importing replication package...";
pub const STATUS_IMPORTED: &str = "Replication package imported successfully";
pub const STATUS_IMPORT_FAILED: &str = "Failed to import replication package";
pub const STATUS_IMPORT_CANCELLED: &str = "Import process cancelled due to repeated failures";

const STRUCTURE_PREFIX: &str = "structure/";

/// An import that can be re-run until it completes
#[async_trait]
pub trait ImportCommand: Send + Sync {
    fn id(&self) -> &str;

    /// Upper bound on attempts that end in an error
    fn max_attempts(&self) -> u32;

    /// Human readable description used in log lines
    fn describe(&self) -> String;

    /// Import through `store`; `Ok(false)` is a final, command-reported failure
    async fn try_import(&self, store: &StoreHandle) -> anyhow::Result<bool>;
}

/// A command registered by the host application
pub trait HostCommand: Send + Sync {
    fn id(&self) -> &str;

    /// The import behind this command, if it is an import command
    fn as_import(&self) -> Option<&dyn ImportCommand> {
        None
    }
}

/// Live view of the host application's registered commands
pub trait CommandRegistry: Send + Sync {
    fn commands(&self) -> Vec<Arc<dyn HostCommand>>;
}

impl<F> CommandRegistry for F
where
    F: Fn() -> Vec<Arc<dyn HostCommand>> + Send + Sync,
{
    fn commands(&self) -> Vec<Arc<dyn HostCommand>> {
        self()
    }
}

/// Mutable command list; changes are visible to the next lookup
#[derive(Default)]
pub struct CommandList {
    commands: RwLock<Vec<Arc<dyn HostCommand>>>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command, replacing any command with the same id
    pub fn register(&self, command: Arc<dyn HostCommand>) {
        let mut commands = self.commands.write().unwrap_or_else(PoisonError::into_inner);
        commands.retain(|existing| existing.id() != command.id());
        commands.push(command);
    }

    pub fn remove(&self, command_id: &str) -> bool {
        let mut commands = self.commands.write().unwrap_or_else(PoisonError::into_inner);
        let before = commands.len();
        commands.retain(|existing| existing.id() != command_id);
        commands.len() != before
    }
}

impl CommandRegistry for CommandList {
    fn commands(&self) -> Vec<Arc<dyn HostCommand>> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Deserialize)]
struct ReplicationPackage {
    #[serde(default)]
    name: Option<String>,
    items: Vec<StructureItem>,
}

#[derive(Debug, Deserialize)]
struct StructureItem {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

/// Imports structural items from a JSON replication package file
///
/// The package is `{ "name": "...", "items": [{ "key": "...", "value": ... }] }`.
/// Every item is written to `structure/{key}` unless that key already exists.
#[derive(Debug, Clone)]
pub struct ReplicationPackageCommand {
    id: String,
    package_path: PathBuf,
    max_attempts: u32,
}

impl ReplicationPackageCommand {
    pub fn new(id: impl Into<String>, package_path: impl Into<PathBuf>, max_attempts: u32) -> Self {
        Self {
            id: id.into(),
            package_path: package_path.into(),
            max_attempts,
        }
    }

    pub fn structure_key(item_key: &str) -> String {
        format!("{STRUCTURE_PREFIX}{item_key}")
    }
}

#[async_trait]
impl ImportCommand for ReplicationPackageCommand {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn describe(&self) -> String {
        self.package_path.display().to_string()
    }

    async fn try_import(&self, store: &StoreHandle) -> anyhow::Result<bool> {
        let contents = match tokio::fs::read_to_string(&self.package_path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Cannot read replication package {}: {}", self.describe(), e);
                return Ok(false);
            }
        };
        let package: ReplicationPackage = match serde_json::from_str(&contents) {
            Ok(package) => package,
            Err(e) => {
                warn!("Invalid replication package {}: {}", self.describe(), e);
                return Ok(false);
            }
        };

        let mut imported = 0;
        let mut skipped = 0;
        for item in package.items {
            let key = Self::structure_key(&item.key);
            if store.get(&key).await?.is_some() {
                skipped += 1;
                continue;
            }
            store.put(&key, item.value).await?;
            imported += 1;
        }

        debug!(
            "Package '{}': imported {} items, skipped {} existing",
            package.name.as_deref().unwrap_or("unnamed"),
            imported,
            skipped
        );
        Ok(true)
    }
}

impl HostCommand for ReplicationPackageCommand {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_import(&self) -> Option<&dyn ImportCommand> {
        Some(self)
    }
}

/// Where an import execution ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportState {
    /// No matching import command; nothing was attempted
    NotStarted,
    Succeeded,
    /// The command reported failure; not retried
    CommandFailed,
    /// An attempt failed with an error and another one will follow
    FailedRetryable,
    /// Every permitted attempt failed with an error
    FailedTerminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub command_id: String,
    pub state: ImportState,
    pub attempts: u32,
}

/// Drives one import command to completion across transactions
pub struct ImportExecutor {
    commands: Arc<dyn CommandRegistry>,
    transactions: Option<Arc<dyn TransactionRunner>>,
    retry_delay: Duration,
    retry_jitter_percent: u8,
}

impl ImportExecutor {
    pub fn new(
        commands: Arc<dyn CommandRegistry>,
        transactions: Option<Arc<dyn TransactionRunner>>,
        config: &ImportConfig,
    ) -> Self {
        Self {
            commands,
            transactions,
            retry_delay: config.retry_delay,
            retry_jitter_percent: config.retry_jitter_percent,
        }
    }

    /// Run the import named by `directive`, updating the job status text
    pub async fn execute(
        &self,
        job: &TaskJob,
        directive: Option<&ImportDirective>,
    ) -> ImportReport {
        let command_id = directive.map(|d| d.command_id.clone()).unwrap_or_default();

        let commands = self.commands.commands();
        let Some(command) = commands
            .iter()
            .find(|c| c.id() == command_id)
            .and_then(|c| c.as_import())
        else {
            warn!(
                "Attempt to import package with command ID '{}', but command not found \
                 or command was incorrect type",
                command_id
            );
            return ImportReport {
                command_id,
                state: ImportState::NotStarted,
                attempts: 0,
            };
        };

        job.update(STATUS_IMPORTING);
        let max_attempts = command.max_attempts().max(1);
        let mut attempts = 0;

        let state = loop {
            attempts += 1;
            match self.attempt(command, job.store()).await {
                Ok(true) => {
                    info!("Imported replication package {}", command.describe());
                    job.update(STATUS_IMPORTED);
                    break ImportState::Succeeded;
                }
                Ok(false) => {
                    warn!("Failed to import replication package {}", command.describe());
                    job.update(STATUS_IMPORT_FAILED);
                    break ImportState::CommandFailed;
                }
                Err(e) if attempts >= max_attempts => {
                    warn!(
                        "Import of {} failed {} times, giving up: {}",
                        command.describe(),
                        attempts,
                        e
                    );
                    job.update(STATUS_IMPORT_CANCELLED);
                    break ImportState::FailedTerminal;
                }
                Err(e) => {
                    debug!(
                        "Import attempt {}/{} of {} ended in {:?}: {}",
                        attempts,
                        max_attempts,
                        command.describe(),
                        ImportState::FailedRetryable,
                        e
                    );
                    if !self.retry_delay.is_zero() {
                        let delay = jittered(self.retry_delay, self.retry_jitter_percent);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        ImportReport {
            command_id,
            state,
            attempts,
        }
    }

    /// One attempt in its own unit of work; `Ok` carries the command's verdict
    async fn attempt(
        &self,
        command: &dyn ImportCommand,
        store: &StoreHandle,
    ) -> Result<bool, StoreError> {
        let verdict: Mutex<Option<bool>> = Mutex::new(None);
        let verdict_ref = &verdict;

        let work = unit_of_work(move |txn| {
            async move {
                let imported = command
                    .try_import(&txn)
                    .await
                    .map_err(|e| StoreError::aborted(format!("{e:#}")))?;
                *verdict_ref.lock().await = Some(imported);
                Ok(())
            }
            .boxed()
        });

        run_unit_of_work(self.transactions.as_ref(), store, work).await?;
        Ok(verdict.into_inner().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{TaskId, TaskRef};
    use crate::store::{KeyValueStore, MemoryStore, MemoryTransactionRunner};
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with an error a fixed number of times, then reports `verdict`
    struct FlakyImport {
        id: String,
        max_attempts: u32,
        failures: u32,
        verdict: bool,
        calls: AtomicU32,
    }

    impl FlakyImport {
        fn new(id: &str, max_attempts: u32, failures: u32, verdict: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                max_attempts,
                failures,
                verdict,
                calls: AtomicU32::new(0),
            })
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
            format!("flaky:{}", self.id)
        }

        async fn try_import(&self, store: &StoreHandle) -> anyhow::Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            store.put(&format!("attempt/{call}"), json!(call)).await?;
            if call <= self.failures {
                anyhow::bail!("transaction timed out on attempt {call}");
            }
            Ok(self.verdict)
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

    struct PlainCommand;

    impl HostCommand for PlainCommand {
        fn id(&self) -> &str {
            "cmd-plain"
        }
    }

    fn setup(commands: Vec<Arc<dyn HostCommand>>) -> (Arc<MemoryStore>, ImportExecutor, TaskJob) {
        let memory = MemoryStore::arc();
        let list = CommandList::new();
        for command in commands {
            list.register(command);
        }
        let transactions: Arc<dyn TransactionRunner> =
            Arc::new(MemoryTransactionRunner::new(memory.clone(), Duration::from_secs(5)));
        let executor =
            ImportExecutor::new(Arc::new(list), Some(transactions), &ImportConfig::default());
        let job = TaskJob::new(
            TaskId::new(),
            TaskRef::new("coordination", "import"),
            Utc::now(),
            None,
            memory.clone(),
        );
        (memory, executor, job)
    }

    #[rstest]
    #[case::first_try(0, 3)]
    #[case::one_failure(1, 3)]
    #[case::two_failures(2, 3)]
    #[tokio::test]
    async fn test_transient_failures_are_retried(#[case] failures: u32, #[case] max_attempts: u32) {
        let command = FlakyImport::new("cmd-1", max_attempts, failures, true);
        let (memory, executor, job) = setup(vec![command.clone() as Arc<dyn HostCommand>]);

        let report = executor.execute(&job, Some(&ImportDirective::new("cmd-1"))).await;

        assert_eq!(report.state, ImportState::Succeeded);
        assert_eq!(report.attempts, failures + 1);
        assert_eq!(command.calls.load(Ordering::SeqCst), failures + 1);
        assert!(job.details().unwrap().ends_with("imported successfully"));
        // Failed attempts were rolled back
        assert!(memory.get(&format!("attempt/{}", failures + 1)).await.unwrap().is_some());
        assert_eq!(memory.len().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_cancel_the_import() {
        let command = FlakyImport::new("cmd-1", 3, u32::MAX, true);
        let (_, executor, job) = setup(vec![command.clone() as Arc<dyn HostCommand>]);

        let report = executor.execute(&job, Some(&ImportDirective::new("cmd-1"))).await;

        assert_eq!(report.state, ImportState::FailedTerminal);
        assert_eq!(report.attempts, 3);
        assert_eq!(command.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.details().as_deref(), Some(STATUS_IMPORT_CANCELLED));
    }

    #[tokio::test]
    async fn test_command_reported_failure_is_not_retried() {
        let command = FlakyImport::new("cmd-1", 5, 0, false);
        let (_, executor, job) = setup(vec![command.clone() as Arc<dyn HostCommand>]);

        let report = executor.execute(&job, Some(&ImportDirective::new("cmd-1"))).await;

        assert_eq!(report.state, ImportState::CommandFailed);
        assert_eq!(report.attempts, 1);
        assert_eq!(job.details().as_deref(), Some(STATUS_IMPORT_FAILED));
    }

    #[rstest]
    #[case::unknown_id(Some("cmd-missing"))]
    #[case::not_an_import(Some("cmd-plain"))]
    #[case::no_directive(None)]
    #[tokio::test]
    async fn test_unresolvable_command_is_skipped(#[case] command_id: Option<&str>) {
        let command = FlakyImport::new("cmd-1", 3, 0, true);
        let (_, executor, job) =
            setup(vec![command.clone() as Arc<dyn HostCommand>, Arc::new(PlainCommand)]);

        let directive = command_id.map(ImportDirective::new);
        let report = executor.execute(&job, directive.as_ref()).await;

        assert_eq!(report.state, ImportState::NotStarted);
        assert_eq!(report.attempts, 0);
        assert_eq!(command.calls.load(Ordering::SeqCst), 0);
        assert_eq!(job.details(), None);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_still_tries_once() {
        let command = FlakyImport::new("cmd-1", 0, u32::MAX, true);
        let (_, executor, job) = setup(vec![command.clone() as Arc<dyn HostCommand>]);

        let report = executor.execute(&job, Some(&ImportDirective::new("cmd-1"))).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(report.state, ImportState::FailedTerminal);
    }

    #[tokio::test]
    async fn test_replication_package_skips_existing_items() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "name": "base", "items": [
                {{ "key": "class/invoice", "value": {{ "id": 101 }} }},
                {{ "key": "class/order", "value": {{ "id": 102 }} }}
            ] }}"#
        )
        .unwrap();

        let memory = MemoryStore::arc();
        memory
            .put("structure/class/invoice", json!({ "id": 1 }))
            .await
            .unwrap();
        let store: StoreHandle = memory.clone();

        let command = ReplicationPackageCommand::new("cmd-pkg", file.path(), 3);
        assert!(command.try_import(&store).await.unwrap());
        assert_eq!(
            memory.get("structure/class/invoice").await.unwrap(),
            Some(json!({ "id": 1 }))
        );
        assert_eq!(
            memory.get("structure/class/order").await.unwrap(),
            Some(json!({ "id": 102 }))
        );

        // Running it again changes nothing
        assert!(command.try_import(&store).await.unwrap());
        assert_eq!(memory.len().await, 2);
    }

    #[tokio::test]
    async fn test_unreadable_package_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = MemoryStore::arc();

        let missing = ReplicationPackageCommand::new("cmd-pkg", dir.path().join("missing.json"), 3);
        assert!(!missing.try_import(&store).await.unwrap());

        let invalid_path = dir.path().join("invalid.json");
        std::fs::write(&invalid_path, "not json").unwrap();
        let invalid = ReplicationPackageCommand::new("cmd-pkg", invalid_path, 3);
        assert!(!invalid.try_import(&store).await.unwrap());
    }

    #[test]
    fn test_command_list_replaces_same_id() {
        let list = CommandList::new();
        list.register(FlakyImport::new("cmd-1", 1, 0, true));
        list.register(FlakyImport::new("cmd-1", 2, 0, true));
        list.register(Arc::new(PlainCommand));
        assert_eq!(list.commands().len(), 2);
        assert!(list.remove("cmd-plain"));
        assert!(!list.remove("cmd-plain"));
    }
}
