//! Observation push interface
//!
//! Guards emit counters, gauges and duration timers through the narrow
//! [`MetricsSink`] trait so they can integrate with whatever metrics backend
//! the host runtime wires in, without coupling to it. The sink implementation
//! is an external collaborator; this crate only ships [`NoopSink`].
//!
//! In addition to the push interface, each guard keeps a cheap atomic
//! snapshot (`BulkheadMetrics`, `CircuitBreakerMetrics`, ...) for direct
//! introspection; those live with their guards.

use std::time::Duration;

/// Push interface for guard observations.
///
/// All methods have no-op default bodies so a sink only implements the
/// signals it cares about.
pub trait MetricsSink: Send + Sync {
    /// Increment a named counter.
    fn counter(&self, name: &'static str, value: u64) {
        let _ = (name, value);
    }

    /// Record the current value of a named gauge.
    fn gauge(&self, name: &'static str, value: f64) {
        let _ = (name, value);
    }

    /// Record a named duration observation.
    fn duration(&self, name: &'static str, value: Duration) {
        let _ = (name, value);
    }
}

/// Sink that drops every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}

/// Metric names emitted by the guards.
pub mod names {
    /// Calls admitted by a bulkhead (both variants).
    pub const BULKHEAD_ACCEPTED: &str = "bulkhead.calls.accepted";
    /// Calls rejected by a bulkhead (no permit / queue full).
    pub const BULKHEAD_REJECTED: &str = "bulkhead.calls.rejected";
    /// Currently running executions inside a bulkhead.
    pub const BULKHEAD_RUNNING: &str = "bulkhead.executions.running";
    /// Current depth of the asynchronous bulkhead's waiting queue.
    pub const BULKHEAD_QUEUE_DEPTH: &str = "bulkhead.queue.depth";
    /// Time a task spent waiting in the queue before dispatch.
    pub const BULKHEAD_QUEUE_WAIT: &str = "bulkhead.queue.wait";
    /// Execution time of a dispatched task.
    pub const BULKHEAD_EXECUTION: &str = "bulkhead.execution.duration";
    /// Calls rejected by an open circuit breaker.
    pub const CIRCUIT_REJECTED: &str = "circuit.calls.rejected";
    /// Breaker transitions into the open state.
    pub const CIRCUIT_OPENED: &str = "circuit.opened";
    /// Re-invocations requested by the retry guard.
    pub const RETRY_RETRIES: &str = "retry.retries";
    /// Deadlines that expired before the call completed.
    pub const TIMEOUT_EXPIRED: &str = "timeout.expired";
    /// Fallback handler invocations.
    pub const FALLBACK_APPLIED: &str = "fallback.applied";
}
