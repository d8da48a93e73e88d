//! Task rescheduling and recurring-execution orchestration
//!
//! Built on top of a host task dispatcher, this module:
//! - re-arms recurring task types after each terminal job outcome
//! - cancels and reschedules future executions, directly in a transaction or
//!   through a durable task when the direct path fails
//! - drives long-running imports across repeated transaction attempts
//!
//! The main components are:
//! - `TaskRescheduler`: cancel-and-reschedule with queued fallback
//! - `CoordinationQueue`: the sequential queue hosting reschedule and import tasks
//! - `ImportExecutor`: bounded-retry import loop
//! - `JobFinishListener`: reconciles future executions after finished jobs
//! - `TaskManagerExtensions`: wires everything together for the host

pub mod coordination;
pub mod directives;
pub mod extensions;
pub mod import;
pub mod listener;
pub mod recurrence;
pub mod rescheduler;

pub use coordination::{CoordinationQueue, ImportProcessor, RescheduleProcessor};
pub use directives::{ImportDirective, RescheduleDirective};
pub use extensions::{CoordinationHealth, ExtensionContext, TaskManagerExtensions};
pub use import::{
    CommandList, CommandRegistry, HostCommand, ImportCommand, ImportExecutor, ImportReport,
    ImportState, ReplicationPackageCommand,
};
pub use listener::{JobFinishListener, ReconcileOutcome};
pub use recurrence::{RecurrencePolicy, ScheduledRecurrence};
pub use rescheduler::{MutationAttempt, RescheduleOutcome, TaskRescheduler};
