//! Resilience guards composed around protected calls.
//!
//! Breakwater is the load-shedding and failure-isolation core consumed by an
//! interception layer: a set of independent guards that wrap the invocation
//! of an arbitrary unit of work and decide, per policy, whether the call may
//! run, how many may run concurrently, whether it should be retried, how
//! long it may take, and what to substitute if it ultimately fails.
//!
//! # Guards
//!
//! - [`bulkhead::Bulkhead`]: non-blocking concurrency admission for direct
//!   calls
//! - [`async_bulkhead::AsyncBulkhead`]: admission gate + bounded FIFO queue +
//!   worker dispatch for deferred work
//! - [`circuit_breaker::CircuitBreaker`]: failure-rate gating over a rolling
//!   window
//! - [`retry::Retry`]: bounded re-invocation with jittered backoff
//! - [`timeout::Timeout`]: single-shot deadline latch
//! - [`fallback::Fallback`]: substitute result for unrecoverable failures
//!
//! Every guard consumes and/or produces an [`outcome::Outcome`] and
//! classifies failure causes with ordered [`outcome::CauseMatcher`]
//! predicates. Guards are independently testable and have no compile-time
//! knowledge of each other; the caller builds a chain by nesting them around
//! the protected call. Each guard module also exposes a two-variant guard
//! slot (active / pass-through) selected once at call-site
//! construction for the "policy absent" case.
//!
//! The worker pool and timer are injected explicitly through
//! [`scheduler::Scheduler`]; observations are pushed through
//! [`metrics::MetricsSink`]. Both collaborators live outside this crate.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod async_bulkhead;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod outcome;
pub mod retry;
pub mod scheduler;
pub mod timeout;
pub mod window;

// Re-export commonly used types for convenience
// --------------------------------
pub use async_bulkhead::{
    AsyncBulkhead, AsyncBulkheadGuard, AsyncBulkheadMetrics, ExecutionTask, TaskHandle, TaskStatus,
};
pub use bulkhead::{Bulkhead, BulkheadGuard, BulkheadMetrics, BulkheadPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerPolicy, CircuitGuard, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, GuardError};
pub use fallback::{Fallback, FallbackContext, FallbackGuard, FallbackPolicy};
pub use metrics::{MetricsSink, NoopSink};
pub use outcome::{CauseMatcher, FailureCause, Outcome};
pub use retry::{AttemptCategory, Retry, RetryGuard, RetryPolicy, RetryVerdict};
pub use scheduler::{ScheduleHandle, Scheduler, TokioScheduler};
pub use timeout::{Timeout, TimeoutGuard, TimeoutPolicy, TimeoutState, TimeoutStateError};
pub use window::RollingWindow;
