//! Retry guard
//!
//! Bounded re-invocation with jittered backoff. The guard itself never runs
//! the protected call; the interception layer drives the loop, asking the
//! guard after each attempt whether to re-invoke and how long to wait first.
//!
//! Each recorded outcome is classified into an [`AttemptCategory`]:
//! `abort_on` classifiers take precedence over `retry_on`, and a cause
//! matched by neither is not retryable. Only a `retry_on` match is
//! retry-eligible, and even then the attempt cap and the optional deadline
//! can override the category to [`AttemptCategory::MaxRetriesReached`] or
//! [`AttemptCategory::MaxDurationReached`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::{names, MetricsSink, NoopSink};
use crate::outcome::{CauseMatcher, Outcome};

/// Configuration for retry behavior.
///
/// Immutable once built; a fresh [`Retry`] is constructed from it per
/// invocation of the protected call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of re-invocations after the initial attempt.
    pub max_retries: u32,
    /// Base delay between attempts.
    pub base_delay: Duration,
    /// Maximum random perturbation applied to the base delay in either
    /// direction; zero yields a constant delay stream.
    pub jitter: Duration,
    /// Deadline for the whole attempt sequence; zero means unbounded.
    pub max_duration: Duration,
    /// Causes eligible for retry.
    pub retry_on: CauseMatcher,
    /// Causes that abort the sequence; takes precedence over `retry_on`.
    pub abort_on: CauseMatcher,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
            max_duration: Duration::ZERO,
            retry_on: CauseMatcher::any(),
            abort_on: CauseMatcher::none(),
        }
    }
}

impl RetryPolicy {
    /// Create a configuration builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.max_duration.is_zero() && self.base_delay >= self.max_duration {
            return Err(ConfigError::invalid("base_delay must be smaller than max_duration"));
        }
        Ok(())
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.policy.max_duration = duration;
        self
    }

    pub fn retry_on(mut self, matcher: CauseMatcher) -> Self {
        self.policy.retry_on = matcher;
        self
    }

    pub fn abort_on(mut self, matcher: CauseMatcher) -> Self {
        self.policy.abort_on = matcher;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Classification of one recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptCategory {
    /// The attempt succeeded.
    Success,
    /// The cause matched `abort_on`; the sequence ends here.
    MatchedAbortOn,
    /// The cause matched `retry_on` and no cap overrode it.
    MatchedRetryOn,
    /// The cause matched neither classifier; not retryable.
    UnmatchedFailure,
    /// Retry-eligible, but the attempt cap was reached.
    MaxRetriesReached,
    /// Retry-eligible, but the sequence deadline was exceeded.
    MaxDurationReached,
}

/// Decision returned by [`Retry::record_result`].
#[derive(Debug, Clone, Copy)]
pub struct RetryVerdict {
    /// How the attempt was classified.
    pub category: AttemptCategory,
    /// Whether the interception layer should re-invoke the call.
    pub should_retry: bool,
    /// Delay before the re-invocation; present only when retrying.
    pub delay: Option<Duration>,
}

impl RetryVerdict {
    fn stop(category: AttemptCategory) -> Self {
        Self { category, should_retry: false, delay: None }
    }
}

/// Attempt counter and delay generator for one invocation sequence.
///
/// Not shared across invocations: the interception layer constructs one
/// `Retry` per protected call from the long-lived policy.
pub struct Retry<C: Clock = SystemClock> {
    policy: RetryPolicy,
    clock: C,
    sink: Arc<dyn MetricsSink>,
    attempts: u32,
    started_at: Option<Instant>,
}

impl Retry<SystemClock> {
    /// Create a retry sequence with the given policy using the system clock.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> Retry<C> {
    /// Create a retry sequence with a custom clock (useful for testing).
    pub fn with_clock(policy: RetryPolicy, clock: C) -> Self {
        Self { policy, clock, sink: Arc::new(NoopSink), attempts: 0, started_at: None }
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Record the start of the attempt sequence for deadline tracking.
    ///
    /// Calling again re-arms the sequence: the timestamp is overwritten and
    /// the attempt counter reset.
    pub fn start(&mut self) {
        self.started_at = Some(self.clock.now());
        self.attempts = 0;
    }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one attempt's outcome and decide whether to re-invoke.
    pub fn record_result<T>(&mut self, outcome: &Outcome<T>) -> RetryVerdict {
        self.attempts += 1;

        let category = match outcome.cause() {
            None => AttemptCategory::Success,
            Some(cause) => {
                if self.policy.abort_on.matches(cause) {
                    AttemptCategory::MatchedAbortOn
                } else if self.policy.retry_on.matches(cause) {
                    AttemptCategory::MatchedRetryOn
                } else {
                    AttemptCategory::UnmatchedFailure
                }
            }
        };

        if category != AttemptCategory::MatchedRetryOn {
            return RetryVerdict::stop(category);
        }

        // Retry-eligible; the caps may still override the category.
        if u64::from(self.attempts) >= u64::from(self.policy.max_retries) + 1 {
            debug!(attempts = self.attempts, "retry attempts exhausted");
            return RetryVerdict::stop(AttemptCategory::MaxRetriesReached);
        }
        if !self.policy.max_duration.is_zero() && self.elapsed() > self.policy.max_duration {
            debug!(elapsed_ms = self.elapsed().as_millis() as u64, "retry deadline exceeded");
            return RetryVerdict::stop(AttemptCategory::MaxDurationReached);
        }

        let delay = self.next_delay();
        self.sink.counter(names::RETRY_RETRIES, 1);
        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "retrying");
        RetryVerdict { category, should_retry: true, delay: Some(delay) }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.map(|at| self.clock.now().duration_since(at)).unwrap_or(Duration::ZERO)
    }

    /// Next delay from the generator: a constant `base_delay` stream with
    /// zero jitter, otherwise an independent uniform draw from
    /// `[base_delay - jitter, base_delay + jitter]`, clamped to non-negative
    /// and saturating at the maximum representable duration.
    fn next_delay(&self) -> Duration {
        if self.policy.jitter.is_zero() {
            return self.policy.base_delay;
        }

        let low = self.policy.base_delay.saturating_sub(self.policy.jitter);
        let high =
            self.policy.base_delay.checked_add(self.policy.jitter).unwrap_or(Duration::MAX);

        let span_nanos = (high - low).as_nanos().min(u128::from(u64::MAX)) as u64;
        if span_nanos == 0 {
            return low;
        }
        let offset = rand::thread_rng().gen_range(0..=span_nanos);
        low.checked_add(Duration::from_nanos(offset)).unwrap_or(Duration::MAX)
    }
}

impl<C: Clock> fmt::Debug for Retry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("max_retries", &self.policy.max_retries)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Call-site retry slot: an active sequence or a pass-through for sites with
/// no retry policy. Selected once at construction.
pub enum RetryGuard<C: Clock = SystemClock> {
    /// Drive re-invocation through the wrapped sequence.
    Active(Retry<C>),
    /// Never retries.
    PassThrough,
}

impl<C: Clock> RetryGuard<C> {
    /// Record the sequence start (no-op for pass-through).
    pub fn start(&mut self) {
        if let RetryGuard::Active(retry) = self {
            retry.start();
        }
    }

    /// Record one attempt's outcome.
    ///
    /// The pass-through never retries: successes classify as
    /// [`AttemptCategory::Success`] and failures as
    /// [`AttemptCategory::UnmatchedFailure`].
    pub fn record_result<T>(&mut self, outcome: &Outcome<T>) -> RetryVerdict {
        match self {
            RetryGuard::Active(retry) => retry.record_result(outcome),
            RetryGuard::PassThrough => RetryVerdict::stop(if outcome.is_failure() {
                AttemptCategory::UnmatchedFailure
            } else {
                AttemptCategory::Success
            }),
        }
    }
}
