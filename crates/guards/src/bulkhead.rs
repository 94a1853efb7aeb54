//! Synchronous bulkhead guard
//!
//! A non-blocking counting admission gate for direct-call concurrency
//! limiting: [`run`](Bulkhead::run) either acquires a permit immediately and
//! executes the work on the caller's thread, or rejects with a synthesized
//! [`GuardError::BulkheadFull`] failure outcome without running the work at
//! all. There is no waiting queue; queueing belongs to the
//! [asynchronous variant](crate::async_bulkhead).
//!
//! Every successful admission has exactly one matching release: the permit is
//! an RAII guard returned to the gate when dropped, on success, failure and
//! unwind alike.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult, GuardError};
use crate::metrics::{names, MetricsSink, NoopSink};
use crate::outcome::Outcome;

/// Configuration shared by both bulkhead variants.
#[derive(Debug, Clone, Copy)]
pub struct BulkheadPolicy {
    /// Maximum number of concurrent executions.
    pub max_concurrent: usize,
    /// Waiting-queue capacity (asynchronous variant only; 0 = no queueing).
    pub queue_capacity: usize,
}

impl Default for BulkheadPolicy {
    fn default() -> Self {
        Self { max_concurrent: 10, queue_capacity: 10 }
    }
}

impl BulkheadPolicy {
    /// Create a configuration builder.
    pub fn builder() -> BulkheadPolicyBuilder {
        BulkheadPolicyBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadPolicy`].
#[derive(Debug, Default)]
pub struct BulkheadPolicyBuilder {
    policy: BulkheadPolicy,
}

impl BulkheadPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: BulkheadPolicy::default() }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.policy.max_concurrent = max;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.policy.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Metrics snapshot for the synchronous bulkhead.
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Executions admitted through the gate.
    pub accepted: u64,
    /// Executions rejected for lack of a permit.
    pub rejected: u64,
    /// Currently running executions.
    pub current_concurrent: usize,
    /// Configured permit count.
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Current utilization as a fraction (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Rejection rate as a fraction of all submissions (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return 0.0;
        }
        self.rejected as f64 / total as f64
    }
}

/// Counting admission gate without queueing.
pub struct Bulkhead {
    policy: BulkheadPolicy,
    available: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    sink: Arc<dyn MetricsSink>,
}

/// RAII permit: returns to the gate when dropped.
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.available.fetch_add(1, Ordering::Release);
    }
}

impl Bulkhead {
    /// Create a gate with the given policy.
    pub fn new(policy: BulkheadPolicy) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self {
            available: AtomicUsize::new(policy.max_concurrent),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            sink: Arc::new(NoopSink),
            policy,
        })
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attempt to take a permit without waiting.
    pub fn try_acquire(&self) -> Option<BulkheadPermit<'_>> {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(BulkheadPermit { bulkhead: self }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Run `work` under a permit, or reject without running it.
    ///
    /// Rejection synthesizes a [`GuardError::BulkheadFull`] failure outcome
    /// that flows back through the chain like any application failure.
    pub fn run<T, F>(&self, work: F) -> Outcome<T>
    where
        F: FnOnce() -> Outcome<T>,
    {
        let Some(_permit) = self.try_acquire() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.sink.counter(names::BULKHEAD_REJECTED, 1);
            debug!(capacity = self.policy.max_concurrent, "bulkhead rejected execution");
            return Outcome::failure(GuardError::BulkheadFull {
                capacity: self.policy.max_concurrent,
            });
        };

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.sink.counter(names::BULKHEAD_ACCEPTED, 1);
        self.sink.gauge(names::BULKHEAD_RUNNING, self.current_concurrent() as f64);

        // Permit released by the RAII guard on all paths, unwind included.
        work()
    }

    /// Currently running executions.
    pub fn current_concurrent(&self) -> usize {
        self.policy.max_concurrent.saturating_sub(self.available.load(Ordering::Acquire))
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            accepted: self.accepted.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Acquire),
            current_concurrent: self.current_concurrent(),
            max_concurrent: self.policy.max_concurrent,
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_concurrent", &self.policy.max_concurrent)
            .field("current_concurrent", &self.current_concurrent())
            .finish()
    }
}

/// Call-site bulkhead slot: an active gate or a pass-through for sites with
/// no bulkhead policy. Selected once at construction.
pub enum BulkheadGuard {
    /// Gate executions through the wrapped bulkhead.
    Active(Bulkhead),
    /// Run everything directly.
    PassThrough,
}

impl BulkheadGuard {
    /// Run `work` under the gate, or directly for pass-through.
    pub fn run<T, F>(&self, work: F) -> Outcome<T>
    where
        F: FnOnce() -> Outcome<T>,
    {
        match self {
            BulkheadGuard::Active(bulkhead) => bulkhead.run(work),
            BulkheadGuard::PassThrough => work(),
        }
    }
}
