//! Fallback guard
//!
//! Substitute-result policy applied when a failed outcome is classified as
//! fallback-eligible: the failure must not match `skip_on` and must match
//! `apply_on`. The caller-supplied handler receives the failure cause through
//! a [`FallbackContext`]; its success becomes the new outcome and its own
//! failure becomes a new failure outcome. Fallback failures are terminal:
//! they are not retried or re-guarded.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::metrics::{names, MetricsSink, NoopSink};
use crate::outcome::{CauseMatcher, FailureCause, Outcome};

/// Configuration for fallback eligibility.
#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    /// Causes excluded from fallback handling.
    pub skip_on: CauseMatcher,
    /// Causes eligible for fallback handling.
    pub apply_on: CauseMatcher,
}

impl FallbackPolicy {
    /// Policy applying the fallback to every failure.
    pub fn on_any_failure() -> Self {
        Self { skip_on: CauseMatcher::none(), apply_on: CauseMatcher::any() }
    }

    /// Set the causes excluded from fallback handling.
    pub fn skip_on(mut self, matcher: CauseMatcher) -> Self {
        self.skip_on = matcher;
        self
    }

    /// Set the causes eligible for fallback handling.
    pub fn apply_on(mut self, matcher: CauseMatcher) -> Self {
        self.apply_on = matcher;
        self
    }
}

/// Context handed to the fallback handler.
pub struct FallbackContext {
    /// The failure that made the protected call fallback-eligible.
    pub cause: FailureCause,
}

impl fmt::Debug for FallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackContext").field("cause", &self.cause).finish()
    }
}

type FallbackFn<T> = Arc<dyn Fn(&FallbackContext) -> Outcome<T> + Send + Sync>;

/// Substitute-result guard for a protected call site.
pub struct Fallback<T> {
    policy: FallbackPolicy,
    handler: FallbackFn<T>,
    sink: Arc<dyn MetricsSink>,
}

impl<T> Fallback<T> {
    /// Create a fallback with the caller-supplied handler.
    pub fn new<F>(policy: FallbackPolicy, handler: F) -> Self
    where
        F: Fn(&FallbackContext) -> Outcome<T> + Send + Sync + 'static,
    {
        Self { policy, handler: Arc::new(handler), sink: Arc::new(NoopSink) }
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Whether the fallback applies to this outcome: a failure whose cause is
    /// not matched by `skip_on` and is matched by `apply_on`.
    pub fn should_apply(&self, outcome: &Outcome<T>) -> bool {
        match outcome.cause() {
            None => false,
            Some(cause) => {
                !self.policy.skip_on.matches(cause) && self.policy.apply_on.matches(cause)
            }
        }
    }

    /// Substitute the failed outcome through the handler.
    ///
    /// Success outcomes pass through unchanged; for failures, the handler's
    /// result, success or failure, becomes the new outcome as-is.
    pub fn run(&self, outcome: Outcome<T>) -> Outcome<T> {
        let Some(cause) = outcome.cause() else {
            return outcome;
        };

        let context = FallbackContext { cause: Arc::clone(cause) };
        self.sink.counter(names::FALLBACK_APPLIED, 1);
        debug!(cause = %context.cause, "applying fallback");
        (self.handler)(&context)
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback").field("policy", &self.policy).finish()
    }
}

/// Call-site fallback slot: an active substitute or a pass-through for sites
/// with no fallback policy. Selected once at construction.
pub enum FallbackGuard<T> {
    /// Substitute eligible failures through the wrapped fallback.
    Active(Fallback<T>),
    /// Never applies; outcomes pass through unchanged.
    PassThrough,
}

impl<T> FallbackGuard<T> {
    /// Whether the fallback applies to this outcome.
    pub fn should_apply(&self, outcome: &Outcome<T>) -> bool {
        match self {
            FallbackGuard::Active(fallback) => fallback.should_apply(outcome),
            FallbackGuard::PassThrough => false,
        }
    }

    /// Substitute the outcome where eligible.
    pub fn run(&self, outcome: Outcome<T>) -> Outcome<T> {
        match self {
            FallbackGuard::Active(fallback) => fallback.run(outcome),
            FallbackGuard::PassThrough => outcome,
        }
    }
}
