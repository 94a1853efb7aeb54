//! Circuit breaker guard
//!
//! Three-state gate (Closed / Open / Half-Open) over a protected call site,
//! driven by a [`RollingWindow`] of recent classified results. The breaker
//! exposes the narrow contract consumed by the interception layer:
//! [`request_permission`](CircuitBreaker::request_permission) before the call
//! and [`record_result`](CircuitBreaker::record_result) after it.
//!
//! Admission and recording both make compound decisions ("has enough time
//! passed AND should we flip state") over the composite state (current
//! state, window, trial counters, timestamps), so the whole composite lives
//! behind one mutex per breaker instance rather than spread across
//! independently-atomic fields.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::{names, MetricsSink, NoopSink};
use crate::outcome::{CauseMatcher, Outcome};
use crate::window::RollingWindow;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests.
    Closed,
    /// Circuit is open, rejecting requests.
    Open,
    /// Circuit is half-open, allowing limited trial requests to test
    /// recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
///
/// Immutable once built; shared read-only across all concurrent invocations
/// of the call site.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    /// Number of recent results considered for the failure ratio.
    pub rolling_window_size: usize,
    /// Fraction of the window (0, 1] that must be failures to open.
    pub failure_ratio: f64,
    /// Time to stay open before admitting a half-open trial.
    pub open_duration: Duration,
    /// Successful trials required to close from half-open.
    pub half_open_success_threshold: u32,
    /// Causes classified as SUCCESS regardless of `fail_on`.
    pub skip_on: CauseMatcher,
    /// Causes classified as FAILURE; unmatched causes count as SUCCESS.
    pub fail_on: CauseMatcher,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            rolling_window_size: 20,
            failure_ratio: 0.5,
            open_duration: Duration::from_secs(5),
            half_open_success_threshold: 2,
            skip_on: CauseMatcher::none(),
            fail_on: CauseMatcher::any(),
        }
    }
}

impl CircuitBreakerPolicy {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerPolicyBuilder {
        CircuitBreakerPolicyBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.rolling_window_size == 0 {
            return Err(ConfigError::invalid("rolling_window_size must be greater than 0"));
        }
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(ConfigError::invalid("failure_ratio must be within (0, 1]"));
        }
        if self.half_open_success_threshold == 0 {
            return Err(ConfigError::invalid("half_open_success_threshold must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerPolicy`].
#[derive(Debug, Default)]
pub struct CircuitBreakerPolicyBuilder {
    policy: CircuitBreakerPolicy,
}

impl CircuitBreakerPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: CircuitBreakerPolicy::default() }
    }

    pub fn rolling_window_size(mut self, size: usize) -> Self {
        self.policy.rolling_window_size = size;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.policy.failure_ratio = ratio;
        self
    }

    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.policy.open_duration = duration;
        self
    }

    pub fn half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.policy.half_open_success_threshold = threshold;
        self
    }

    pub fn skip_on(mut self, matcher: CauseMatcher) -> Self {
        self.policy.skip_on = matcher;
        self
    }

    pub fn fail_on(mut self, matcher: CauseMatcher) -> Self {
        self.policy.fail_on = matcher;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Circuit breaker metrics snapshot.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub window_failures: usize,
    pub window_filled: usize,
    pub half_open_trials_running: u32,
    pub half_open_successes: u32,
    pub times_opened: u64,
    pub calls_rejected: u64,
}

/// Composite breaker state; one lock domain per call site.
struct BreakerCore {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    last_trial_at: Option<Instant>,
    trials_running: u32,
    trial_successes: u32,
    times_opened: u64,
    calls_rejected: u64,
}

/// Failure-rate gating guard for a single protected call site.
///
/// Long-lived: one instance per call site, shared by all of its concurrent
/// invocations. The clock is injected so open-duration behavior is testable
/// without real delays.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    policy: CircuitBreakerPolicy,
    core: Mutex<BreakerCore>,
    clock: C,
    sink: Arc<dyn MetricsSink>,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the given policy using the system clock.
    pub fn new(policy: CircuitBreakerPolicy) -> ConfigResult<Self> {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing).
    pub fn with_clock(policy: CircuitBreakerPolicy, clock: C) -> ConfigResult<Self> {
        policy.validate()?;

        let window = RollingWindow::new(policy.rolling_window_size, policy.failure_ratio);
        debug!(
            window_size = policy.rolling_window_size,
            failure_ratio = policy.failure_ratio,
            open_duration_ms = policy.open_duration.as_millis() as u64,
            "circuit breaker initialized"
        );

        Ok(Self {
            policy,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                last_trial_at: None,
                trials_running: 0,
                trial_successes: 0,
                times_opened: 0,
                calls_rejected: 0,
            }),
            clock,
            sink: Arc::new(NoopSink),
        })
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Whether the next invocation may run.
    ///
    /// `Closed` always admits. `Open` admits once `open_duration` has
    /// elapsed, flipping to half-open and counting the triggering call as the
    /// first trial. `HalfOpen` admits up to `half_open_success_threshold`
    /// concurrently-running trials, plus one extra when the last trial has
    /// been running longer than `open_duration` (so a trial that never
    /// completes cannot starve recovery probing indefinitely).
    pub fn request_permission(&self) -> bool {
        let now = self.clock.now();
        let mut core = self.core.lock();

        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed =
                    core.opened_at.map(|at| now.duration_since(at)).unwrap_or(Duration::ZERO);
                if elapsed >= self.policy.open_duration {
                    core.state = CircuitState::HalfOpen;
                    core.trials_running = 1;
                    core.trial_successes = 0;
                    core.last_trial_at = Some(now);
                    info!(elapsed_ms = elapsed.as_millis() as u64, "circuit breaker half-open");
                    true
                } else {
                    core.calls_rejected += 1;
                    self.sink.counter(names::CIRCUIT_REJECTED, 1);
                    false
                }
            }
            CircuitState::HalfOpen => {
                if core.trials_running < self.policy.half_open_success_threshold {
                    core.trials_running += 1;
                    core.last_trial_at = Some(now);
                    return true;
                }

                // Stalled-trial escape hatch: if nothing has been admitted for
                // a full open_duration, let one more probe through even at the
                // running cap. Unbounded across repeats when trials keep
                // hanging.
                let stalled = core
                    .last_trial_at
                    .map(|at| now.duration_since(at) >= self.policy.open_duration)
                    .unwrap_or(true);
                if stalled {
                    core.trials_running += 1;
                    core.last_trial_at = Some(now);
                    warn!(
                        running = core.trials_running,
                        "circuit breaker admitting extra half-open trial after stall"
                    );
                    true
                } else {
                    core.calls_rejected += 1;
                    self.sink.counter(names::CIRCUIT_REJECTED, 1);
                    false
                }
            }
        }
    }

    /// Record the outcome of an admitted invocation.
    ///
    /// Outcomes are classified by policy: causes matched by `skip_on` count
    /// as SUCCESS, causes matched by `fail_on` as FAILURE, and unmatched
    /// causes as SUCCESS (default-permissive). Results arriving while the
    /// breaker is open are discarded.
    pub fn record_result<T>(&self, outcome: &Outcome<T>) {
        let is_failure = self.classify_as_failure(outcome);
        let now = self.clock.now();
        let mut core = self.core.lock();

        match core.state {
            CircuitState::Closed => {
                core.window.record(is_failure);
                if core.window.is_over_threshold() {
                    self.open(&mut core, now);
                }
            }
            CircuitState::HalfOpen => {
                if is_failure {
                    self.open(&mut core, now);
                } else {
                    core.trial_successes += 1;
                    core.trials_running = core.trials_running.saturating_sub(1);
                    if core.trial_successes >= self.policy.half_open_success_threshold {
                        self.close(&mut core);
                    }
                }
            }
            CircuitState::Open => {
                // Late results from pre-open invocations carry no signal.
            }
        }
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let core = self.core.lock();
        CircuitBreakerMetrics {
            state: core.state,
            window_failures: core.window.failure_count(),
            window_filled: core.window.filled_count(),
            half_open_trials_running: core.trials_running,
            half_open_successes: core.trial_successes,
            times_opened: core.times_opened,
            calls_rejected: core.calls_rejected,
        }
    }

    /// Force the breaker open (for operational intervention).
    pub fn force_open(&self) {
        let now = self.clock.now();
        let mut core = self.core.lock();
        warn!("circuit breaker forced open");
        self.open(&mut core, now);
    }

    /// Reset the breaker to closed with a cleared window.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        info!("circuit breaker manually reset");
        self.close(&mut core);
    }

    fn classify_as_failure<T>(&self, outcome: &Outcome<T>) -> bool {
        match outcome.cause() {
            None => false,
            Some(cause) => {
                if self.policy.skip_on.matches(cause) {
                    false
                } else {
                    self.policy.fail_on.matches(cause)
                }
            }
        }
    }

    fn open(&self, core: &mut BreakerCore, now: Instant) {
        core.state = CircuitState::Open;
        core.opened_at = Some(now);
        core.last_trial_at = None;
        core.trials_running = 0;
        core.trial_successes = 0;
        core.times_opened += 1;
        self.sink.counter(names::CIRCUIT_OPENED, 1);
        warn!(
            window_failures = core.window.failure_count(),
            open_duration_ms = self.policy.open_duration.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn close(&self, core: &mut BreakerCore) {
        core.state = CircuitState::Closed;
        core.window.clear();
        core.opened_at = None;
        core.last_trial_at = None;
        core.trials_running = 0;
        core.trial_successes = 0;
        info!("circuit breaker closed");
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("state", &core.state)
            .field("window_failures", &core.window.failure_count())
            .field("times_opened", &core.times_opened)
            .finish()
    }
}

/// Call-site breaker slot: an active breaker or a pass-through for sites
/// with no circuit-breaker policy. Selected once at construction.
pub enum CircuitGuard<C: Clock = SystemClock> {
    /// Gate invocations through the wrapped breaker.
    Active(CircuitBreaker<C>),
    /// Admit everything, record nothing.
    PassThrough,
}

impl<C: Clock> CircuitGuard<C> {
    /// Whether the next invocation may run.
    pub fn request_permission(&self) -> bool {
        match self {
            CircuitGuard::Active(breaker) => breaker.request_permission(),
            CircuitGuard::PassThrough => true,
        }
    }

    /// Record the outcome of an admitted invocation.
    pub fn record_result<T>(&self, outcome: &Outcome<T>) {
        if let CircuitGuard::Active(breaker) = self {
            breaker.record_result(outcome);
        }
    }
}
