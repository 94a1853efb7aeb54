//! Timeout guard
//!
//! A single-shot, idempotent deadline latch: `New → Started → {Finished |
//! TimedOut}`. [`start`](Timeout::start) schedules the expiry job on the
//! shared [`Scheduler`]; [`stop`](Timeout::stop) cancels it. Whichever of
//! stop and expiry wins the race decides the terminal state: cancellation is
//! guaranteed if it races ahead of expiry, otherwise the expiry wins and is
//! reported through [`is_timed_out`](Timeout::is_timed_out) and the
//! registered callback, which fires exactly once.
//!
//! Every transition is a check-then-transition over the latch state, so all
//! of them run under one lock. The expiry job itself runs on a pool thread,
//! never inline with `start()`; the callback is invoked outside the lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{names, MetricsSink, NoopSink};
use crate::scheduler::{ScheduleHandle, Scheduler};

/// Deadline configuration. A zero duration disables the deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Time allowed for the protected call; zero means no deadline.
    pub duration: Duration,
}

impl TimeoutPolicy {
    /// Policy enforcing the given deadline.
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Policy with the deadline disabled.
    pub fn disabled() -> Self {
        Self { duration: Duration::ZERO }
    }

    /// Whether this policy enforces a deadline.
    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }
}

/// Latch states of a [`Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    /// Constructed, not yet armed.
    New,
    /// Armed; the expiry job is scheduled (or disabled by policy).
    Started,
    /// Stopped before expiry; the deadline can no longer fire.
    Finished,
    /// The deadline elapsed before `stop()`.
    TimedOut,
}

impl fmt::Display for TimeoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutState::New => write!(f, "NEW"),
            TimeoutState::Started => write!(f, "STARTED"),
            TimeoutState::Finished => write!(f, "FINISHED"),
            TimeoutState::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Misuse of the latch lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutStateError {
    /// `start()` was called on a latch that already left `New`.
    #[error("timeout was already started")]
    AlreadyStarted,
    /// `stop()` was called before `start()`.
    #[error("timeout was not started")]
    NotStarted,
    /// `stop()` was called twice.
    #[error("timeout was already stopped")]
    AlreadyStopped,
}

type ExpiryCallback = Box<dyn FnOnce() + Send>;

struct TimeoutInner {
    state: TimeoutState,
    callback: Option<ExpiryCallback>,
    handle: Option<ScheduleHandle>,
}

/// Deadline tracker for one invocation of a protected call.
pub struct Timeout {
    policy: TimeoutPolicy,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn MetricsSink>,
    inner: Arc<Mutex<TimeoutInner>>,
}

impl Timeout {
    /// Create a latch over the shared scheduler.
    pub fn new(policy: TimeoutPolicy, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            policy,
            scheduler,
            sink: Arc::new(NoopSink),
            inner: Arc::new(Mutex::new(TimeoutInner {
                state: TimeoutState::New,
                callback: None,
                handle: None,
            })),
        }
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Arm the deadline.
    ///
    /// Schedules the expiry job after `policy.duration` (schedules nothing
    /// when the policy is disabled). Calling `start` twice is an error.
    pub fn start(&self) -> Result<(), TimeoutStateError> {
        let mut inner = self.inner.lock();
        if inner.state != TimeoutState::New {
            return Err(TimeoutStateError::AlreadyStarted);
        }
        inner.state = TimeoutState::Started;

        if self.policy.is_enabled() {
            let watched = Arc::clone(&self.inner);
            let sink = Arc::clone(&self.sink);
            let duration = self.policy.duration;
            let handle = self.scheduler.schedule_once(
                duration,
                Box::new(move || Self::expire(&watched, sink.as_ref(), duration)),
            );
            inner.handle = Some(handle);
        } else {
            debug!("timeout disabled by policy, nothing scheduled");
        }

        Ok(())
    }

    /// Disarm the deadline.
    ///
    /// Cancels the scheduled expiry and finishes the latch. An error before
    /// `start()` or on a second `stop()`; a safe no-op once the deadline has
    /// already expired.
    pub fn stop(&self) -> Result<(), TimeoutStateError> {
        let handle = {
            let mut inner = self.inner.lock();
            match inner.state {
                TimeoutState::New => return Err(TimeoutStateError::NotStarted),
                TimeoutState::Finished => return Err(TimeoutStateError::AlreadyStopped),
                TimeoutState::TimedOut => return Ok(()),
                TimeoutState::Started => {
                    inner.state = TimeoutState::Finished;
                    inner.handle.take()
                }
            }
        };

        if let Some(handle) = handle {
            handle.cancel();
        }
        Ok(())
    }

    /// Register the expiry callback.
    ///
    /// May be registered before or after expiry; when the latch has already
    /// timed out, the callback fires immediately on the caller's thread.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state == TimeoutState::TimedOut {
            drop(inner);
            callback();
        } else {
            inner.callback = Some(Box::new(callback));
        }
    }

    /// Whether the deadline elapsed before `stop()`. Permanent once true.
    pub fn is_timed_out(&self) -> bool {
        self.inner.lock().state == TimeoutState::TimedOut
    }

    /// Current latch state.
    pub fn state(&self) -> TimeoutState {
        self.inner.lock().state
    }

    /// Expiry job: transitions `Started → TimedOut` and fires the callback
    /// exactly once. Loses cleanly to a `stop()` that got there first.
    fn expire(inner: &Mutex<TimeoutInner>, sink: &dyn MetricsSink, duration: Duration) {
        let callback = {
            let mut inner = inner.lock();
            if inner.state != TimeoutState::Started {
                return;
            }
            inner.state = TimeoutState::TimedOut;
            inner.handle = None;
            inner.callback.take()
        };

        sink.counter(names::TIMEOUT_EXPIRED, 1);
        warn!(timeout_ms = duration.as_millis() as u64, "execution timed out");

        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("duration", &self.policy.duration)
            .field("state", &self.state())
            .finish()
    }
}

/// Call-site timeout slot: an active latch or a pass-through for sites with
/// no timeout policy. Selected once at construction.
pub enum TimeoutGuard {
    /// Enforce the wrapped deadline.
    Active(Timeout),
    /// Never schedules, never expires.
    PassThrough,
}

impl TimeoutGuard {
    /// Arm the deadline (no-op for pass-through).
    pub fn start(&self) -> Result<(), TimeoutStateError> {
        match self {
            TimeoutGuard::Active(timeout) => timeout.start(),
            TimeoutGuard::PassThrough => Ok(()),
        }
    }

    /// Disarm the deadline (no-op for pass-through).
    pub fn stop(&self) -> Result<(), TimeoutStateError> {
        match self {
            TimeoutGuard::Active(timeout) => timeout.stop(),
            TimeoutGuard::PassThrough => Ok(()),
        }
    }

    /// Register the expiry callback (dropped for pass-through).
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            TimeoutGuard::Active(timeout) => timeout.set_callback(callback),
            TimeoutGuard::PassThrough => {}
        }
    }

    /// Whether the deadline elapsed (always false for pass-through).
    pub fn is_timed_out(&self) -> bool {
        match self {
            TimeoutGuard::Active(timeout) => timeout.is_timed_out(),
            TimeoutGuard::PassThrough => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn timeout_guard(millis: u64) -> Timeout {
        Timeout::new(TimeoutPolicy::new(Duration::from_millis(millis)), Arc::new(TokioScheduler))
    }

    /// Stopping at half the deadline prevents the callback from ever firing
    /// and `is_timed_out` stays false permanently.
    #[tokio::test]
    async fn test_stop_beats_expiry() {
        let timeout = timeout_guard(100);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        timeout.set_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timeout.start().expect("first start should succeed");

        sleep(Duration::from_millis(50)).await;
        timeout.stop().expect("stop before expiry should succeed");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timeout.is_timed_out());
        assert_eq!(timeout.state(), TimeoutState::Finished);
    }

    /// Without `stop()`, the callback fires once around the deadline and
    /// `is_timed_out` becomes permanently true; a late `stop()` is a safe
    /// no-op.
    #[tokio::test]
    async fn test_expiry_fires_once() {
        let timeout = timeout_guard(50);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        timeout.set_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timeout.start().expect("first start should succeed");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timeout.is_timed_out());

        assert_eq!(timeout.stop(), Ok(()));
        assert!(timeout.is_timed_out());
    }

    /// Registering the callback after expiry fires it immediately.
    #[tokio::test]
    async fn test_late_callback_fires_immediately() {
        let timeout = timeout_guard(20);
        timeout.start().expect("first start should succeed");
        sleep(Duration::from_millis(50)).await;
        assert!(timeout.is_timed_out());

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        timeout.set_callback(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Validates lifecycle misuse errors.
    ///
    /// Assertions:
    /// - `stop` before `start` is `NotStarted`.
    /// - second `start` is `AlreadyStarted`.
    /// - second `stop` is `AlreadyStopped`.
    #[tokio::test]
    async fn test_lifecycle_errors() {
        let timeout = timeout_guard(100);

        assert_eq!(timeout.stop(), Err(TimeoutStateError::NotStarted));

        timeout.start().expect("first start should succeed");
        assert_eq!(timeout.start(), Err(TimeoutStateError::AlreadyStarted));

        timeout.stop().expect("first stop should succeed");
        assert_eq!(timeout.stop(), Err(TimeoutStateError::AlreadyStopped));
    }

    /// A zero-duration policy disables the deadline entirely.
    #[tokio::test]
    async fn test_disabled_policy_never_expires() {
        let timeout =
            Timeout::new(TimeoutPolicy::disabled(), Arc::new(TokioScheduler));
        timeout.start().expect("first start should succeed");

        sleep(Duration::from_millis(30)).await;
        assert!(!timeout.is_timed_out());
        timeout.stop().expect("stop should succeed");
        assert_eq!(timeout.state(), TimeoutState::Finished);
    }

    #[tokio::test]
    async fn test_pass_through_guard() {
        let guard = TimeoutGuard::PassThrough;
        assert_eq!(guard.start(), Ok(()));
        assert!(!guard.is_timed_out());
        assert_eq!(guard.stop(), Ok(()));
    }
}
