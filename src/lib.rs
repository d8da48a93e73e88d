pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod store;
pub mod task_scheduling;
pub mod utils;

pub use config::Config;
pub use errors::{AppError, AppResult};
pub use task_scheduling::{ExtensionContext, TaskManagerExtensions};
