//! Error type definitions for the task manager extensions

use std::time::Duration;
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Task dispatcher errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Rescheduling errors
    #[error("Reschedule error: {0}")]
    Reschedule(#[from] RescheduleError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Errors raised by the backing store or one of its transactions
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store cannot be reached
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Another writer changed a key this transaction depends on
    #[error("Transaction conflict on key '{key}'")]
    Conflict { key: String },

    /// The unit of work exceeded the allowed transaction time
    #[error("Transaction timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The unit of work failed and the transaction was rolled back
    #[error("Transaction aborted: {reason}")]
    Aborted { reason: String },

    /// Stored value could not be (de)serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn aborted<S: Into<String>>(reason: S) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. }
                | StoreError::Conflict { .. }
                | StoreError::Timeout { .. }
        )
    }
}

/// Errors raised by the task dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The underlying store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A queue with this id is already registered
    #[error("Queue '{queue_id}' is already registered")]
    DuplicateQueue { queue_id: String },

    /// The queue registration is not usable
    #[error("Invalid queue '{queue_id}': {reason}")]
    InvalidQueue { queue_id: String, reason: String },

    /// Task payload could not be encoded
    #[error("Task payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Convert into a store error so the failure can abort a unit of work
    pub fn into_store_error(self) -> StoreError {
        match self {
            DispatchError::Store(e) => e,
            other => StoreError::aborted(other.to_string()),
        }
    }
}

/// Failure reported by a task processor
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// A dispatcher call made by the processor failed
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The task failed; the dispatcher may run it again
    #[error("Task failed: {0}")]
    Failed(#[from] anyhow::Error),

    /// The task failed in a way that must not be retried
    #[error("Task failed fatally: {message}")]
    Fatal { message: String },
}

impl ProcessingError {
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }
}

/// Errors that mean a scheduling intent could not be recorded
#[derive(Error, Debug)]
pub enum RescheduleError {
    /// Looking up pending executions failed
    #[error("Failed to read pending executions of {task_type} on {queue_id}: {source}")]
    PendingLookup {
        queue_id: String,
        task_type: String,
        #[source]
        source: DispatchError,
    },

    /// The reschedule directive could not be encoded as a task payload
    #[error("Failed to encode reschedule directive: {0}")]
    Encode(#[from] serde_json::Error),

    /// Both the direct mutation and the queued fallback failed
    #[error("Failed to queue reschedule of {task_type} on {queue_id}: {source}")]
    FallbackEnqueueFailed {
        queue_id: String,
        task_type: String,
        #[source]
        source: DispatchError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_store_errors() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(StoreError::Conflict { key: "a".to_string() }.is_transient());
        assert!(
            StoreError::Timeout {
                elapsed: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!StoreError::aborted("bad input").is_transient());
    }

    #[test]
    fn test_dispatch_error_into_store_error() {
        let err = DispatchError::Store(StoreError::unavailable("offline"));
        assert!(matches!(err.into_store_error(), StoreError::Unavailable { .. }));

        let err = DispatchError::DuplicateQueue {
            queue_id: "q".to_string(),
        };
        match err.into_store_error() {
            StoreError::Aborted { reason } => assert!(reason.contains("already registered")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
