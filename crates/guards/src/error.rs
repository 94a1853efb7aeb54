//! Guard-level error types
//!
//! Two families live here:
//!
//! - [`GuardError`]: the failures the guards themselves synthesize (bulkhead
//!   rejection, timeout expiry, circuit open, cancellation). These flow back
//!   through the chain exactly like application failures, so an outer retry
//!   can choose to retry on a synthesized rejection the same way it would on
//!   an application error.
//! - [`ConfigError`]: policy validation failures raised by the policy
//!   builders at construction time.

use std::time::Duration;

use thiserror::Error;

/// Failures synthesized by the guards.
///
/// Each variant is a distinct failure cause; classifiers can match them with
/// `CauseMatcher::on_type::<GuardError>()` or a predicate over the variant.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The synchronous bulkhead had no free permit.
    #[error("bulkhead capacity exceeded: {capacity} concurrent executions")]
    BulkheadFull {
        /// Configured `max_concurrent` of the rejecting bulkhead.
        capacity: usize,
    },

    /// The asynchronous bulkhead's waiting queue was at capacity.
    #[error("bulkhead queue full: {capacity} waiting executions")]
    QueueFull {
        /// Configured `queue_capacity` of the rejecting bulkhead.
        capacity: usize,
    },

    /// The circuit breaker is open and rejected the call.
    #[error("circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// The deadline elapsed before the protected call completed.
    #[error("execution timed out after {timeout:?}")]
    Timeout {
        /// Configured deadline of the expiring timeout.
        timeout: Duration,
    },

    /// The task was cancelled before or while it ran.
    #[error("execution was cancelled")]
    Cancelled,

    /// Guard-internal bookkeeping failed after the task left the queue.
    ///
    /// Routed to the task's failure handler rather than left unhandled; the
    /// permit is released on this path like any other completion.
    #[error("task dispatch failed: {message}")]
    Dispatch {
        /// What went wrong between dequeue and execution.
        message: String,
    },
}

/// Policy validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration value combination is not usable.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Which constraint was violated.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid { message: message.into() }
    }
}

/// Result type for policy construction.
pub type ConfigResult<T> = Result<T, ConfigError>;
