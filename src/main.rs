use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskmanager_extensions::{
    config::{Config, defaults::DEFAULT_CONFIG_FILE},
    dispatcher::{
        DispatcherRunner, InMemoryDispatcher, ProcessingBehavior, ProcessorRegistration,
        QueueRegistration, TaskDispatcher, TaskJob, TaskProcessor, TransactionMode,
    },
    errors::ProcessingError,
    store::{MemoryStore, MemoryTransactionRunner, StoreHandle, TransactionRunner},
    task_scheduling::{
        CommandList, ExtensionContext, ReplicationPackageCommand, ScheduledRecurrence,
        TaskManagerExtensions,
    },
};

const DEMO_IMPORT_COMMAND_ID: &str = "demo-import";
const DEMO_IMPORT_MAX_ATTEMPTS: u32 = 3;

#[derive(Parser)]
#[command(name = "taskmanager-extensions")]
#[command(version)]
#[command(about = "Demo host for recurring task rescheduling and sequential coordination")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Stop after this long (e.g. "90s"); runs until Ctrl+C otherwise
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Replication package to import through the coordination queue
    #[arg(long, value_name = "FILE")]
    import_package: Option<PathBuf>,
}

/// Stand-in processor for configured recurring task types
struct LoggingProcessor;

#[async_trait]
impl TaskProcessor for LoggingProcessor {
    async fn process(&self, job: &TaskJob) -> Result<(), ProcessingError> {
        info!(
            "Running {} on {} (scheduled for {})",
            job.task_type,
            job.queue_id,
            job.activation.format("%Y-%m-%d %H:%M:%S UTC")
        );
        job.update(format!("{} finished", job.task_type));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("taskmanager_extensions={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting task manager extensions demo v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    let memory = MemoryStore::arc();
    let store: StoreHandle = memory.clone();
    let transactions: Arc<dyn TransactionRunner> = Arc::new(MemoryTransactionRunner::new(
        memory.clone(),
        config.store.transaction_timeout,
    ));
    let dispatcher = Arc::new(InMemoryDispatcher::new(
        store.clone(),
        Some(transactions.clone()),
        config.dispatcher.node_id.clone(),
    ));
    // Claims a previous run of this node left behind
    dispatcher.release_claims().await?;

    let policy = Arc::new(ScheduledRecurrence::from_config(&config.recurring)?);
    let commands = Arc::new(CommandList::new());
    if let Some(package) = &cli.import_package {
        commands.register(Arc::new(ReplicationPackageCommand::new(
            DEMO_IMPORT_COMMAND_ID,
            package,
            DEMO_IMPORT_MAX_ATTEMPTS,
        )));
    }

    let extensions = TaskManagerExtensions::new(
        ExtensionContext {
            dispatcher: dispatcher.clone(),
            store: store.clone(),
            transactions: Some(transactions),
            policy: policy.clone(),
            commands,
        },
        &config,
    );
    extensions.register_extensions_queue().await?;

    // One parallel queue per configured recurring queue id
    let mut recurring_queues: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for task in policy.tasks() {
        recurring_queues
            .entry(task.queue_id.as_str())
            .or_default()
            .push(task.task_type.as_str());
    }
    for (queue_id, task_types) in &recurring_queues {
        let registration = task_types.iter().fold(
            QueueRegistration::new(*queue_id, ProcessingBehavior::Parallel {
                max_concurrency: config.dispatcher.max_concurrency,
            }),
            |queue, task_type| {
                queue.with_processor(ProcessorRegistration::new(
                    *task_type,
                    TransactionMode::Full,
                    Arc::new(LoggingProcessor),
                ))
            },
        );
        dispatcher.register_queue(registration).await?;
    }

    let cancellation_token = CancellationToken::new();
    let listener_handle = extensions.spawn_listener(cancellation_token.clone());

    // Arm the first execution of every recurring task type
    for task in policy.tasks() {
        let outcome = extensions
            .listener()
            .reconcile(&task.queue_id, &task.task_type)
            .await?;
        info!("Initial schedule for {}: {:?}", task, outcome);
    }

    if cli.import_package.is_some() {
        extensions.queue_import(DEMO_IMPORT_COMMAND_ID).await?;
    }

    let runner = Arc::new(DispatcherRunner::new(dispatcher.clone(), &config.dispatcher));
    let runner_handle = tokio::spawn({
        let runner = runner.clone();
        let token = cancellation_token.clone();
        async move { runner.run(token).await }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
                Err(e) => warn!("Failed to listen for Ctrl+C ({}), shutting down", e),
            }
        }
        _ = wait_for(cli.run_for) => {
            info!("Run time elapsed, shutting down gracefully");
        }
    }

    cancellation_token.cancel();
    runner_handle.await??;
    listener_handle.await?;

    let health = extensions.health_check().await?;
    info!(
        "Coordination queue '{}': {} pending reschedules, {} pending imports",
        health.queue_id, health.pending_reschedules, health.pending_imports
    );
    info!("Task manager extensions demo stopped");
    Ok(())
}

async fn wait_for(run_for: Option<Duration>) {
    match run_for {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
