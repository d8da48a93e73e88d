//! Centralized error handling for the task manager extensions
//!
//! Errors are grouped by the layer that produces them so that callers can
//! tell a transient environment problem (store outage, transaction conflict,
//! timeout) apart from a logic or configuration problem.
//!
//! # Error Categories
//!
//! - **Store Errors**: backing store availability, optimistic conflicts, timeouts
//! - **Dispatch Errors**: task submission, cancellation and queue registration
//! - **Processing Errors**: failures reported by task processors
//! - **Reschedule Errors**: scheduling intent that could not be recorded at all
//!
//! # Usage
//!
//! ```rust
//! use taskmanager_extensions::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Err(AppError::configuration("queue id must not be empty"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for backing store Results
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience type alias for dispatcher Results
pub type DispatchResult<T> = Result<T, DispatchError>;
