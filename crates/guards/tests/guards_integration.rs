//! Integration tests for the guard chain
//!
//! Exercises the guards the way the interception layer composes them: permits
//! and queues under real contention, breaker recovery driven by a mock clock,
//! retry loops fed by synthesized guard failures, timeout expiry aborting
//! in-flight work, and fallback as the last link in the chain.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breakwater_guards::{
    AsyncBulkhead, AttemptCategory, Bulkhead, BulkheadPolicy, CauseMatcher, CircuitBreaker,
    CircuitBreakerPolicy, CircuitState, Fallback, FallbackPolicy, GuardError, MetricsSink,
    MockClock, Outcome, Retry, RetryPolicy, RollingWindow, TaskStatus, Timeout, TimeoutPolicy,
    TokioScheduler,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Custom error type for testing
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
struct TestError {
    message: String,
}

impl TestError {
    fn new(message: &str) -> Self {
        Self { message: message.to_string() }
    }
}

fn guard_error<T>(outcome: &Outcome<T>) -> Option<&GuardError> {
    outcome.cause().and_then(|cause| cause.downcast_ref::<GuardError>())
}

/// Sink capturing every observation, for asserting the push interface.
#[derive(Default)]
struct RecordingSink {
    counters: Mutex<Vec<(&'static str, u64)>>,
    gauges: Mutex<Vec<(&'static str, f64)>>,
    durations: Mutex<Vec<&'static str>>,
}

impl MetricsSink for RecordingSink {
    fn counter(&self, name: &'static str, value: u64) {
        self.counters.lock().push((name, value));
    }

    fn gauge(&self, name: &'static str, value: f64) {
        self.gauges.lock().push((name, value));
    }

    fn duration(&self, name: &'static str, _value: Duration) {
        self.durations.lock().push(name);
    }
}

impl RecordingSink {
    fn counter_total(&self, name: &str) -> u64 {
        self.counters.lock().iter().filter(|(n, _)| *n == name).map(|(_, v)| v).sum()
    }
}

/// Validates the synchronous bulkhead under real thread contention: with two
/// permits, three concurrently blocking units yield exactly two running and
/// one rejected outcome, and a fourth submission is admitted once a permit
/// frees up.
#[test]
fn test_sync_bulkhead_concurrent_limit() {
    let policy = BulkheadPolicy::builder()
        .max_concurrent(2)
        .queue_capacity(0)
        .build()
        .expect("policy should be valid");
    let bulkhead = Arc::new(Bulkhead::new(policy).expect("policy should be valid"));

    let started = Arc::new(AtomicU32::new(0));
    let mut releases = Vec::new();
    let mut workers = Vec::new();

    for _ in 0..2 {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        releases.push(release_tx);
        let bulkhead = Arc::clone(&bulkhead);
        let started = Arc::clone(&started);
        workers.push(std::thread::spawn(move || {
            bulkhead.run(|| {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv();
                Outcome::success(())
            })
        }));
    }

    // Both blocking units hold their permits before the third submission.
    while started.load(Ordering::SeqCst) < 2 {
        std::thread::yield_now();
    }

    let rejected = bulkhead.run(|| Outcome::success(()));
    assert!(matches!(guard_error(&rejected), Some(GuardError::BulkheadFull { capacity: 2 })));

    // Complete one unit; the next submission is admitted.
    releases[0].send(()).expect("worker should be waiting");
    let first = workers.remove(0).join().expect("worker should not panic");
    assert!(!first.is_failure());

    let admitted = bulkhead.run(|| Outcome::success(4));
    assert_eq!(admitted.value(), Some(&4));

    releases[1].send(()).expect("worker should be waiting");
    let second = workers.remove(0).join().expect("worker should not panic");
    assert!(!second.is_failure());
    assert_eq!(bulkhead.current_concurrent(), 0);
}

/// Validates the asynchronous bulkhead pipeline and its observations: task1
/// runs, task2 queues, task3 is rejected; completing task1 redispatches
/// task2, and the sink saw the accept/reject counters plus queue-wait and
/// execution timers.
#[tokio::test(flavor = "multi_thread")]
async fn test_async_bulkhead_pipeline_with_observations() {
    let sink = Arc::new(RecordingSink::default());
    let policy = BulkheadPolicy::builder()
        .max_concurrent(1)
        .queue_capacity(1)
        .build()
        .expect("policy should be valid");
    let bulkhead: AsyncBulkhead<u32> =
        AsyncBulkhead::new(policy, Arc::new(TokioScheduler))
            .expect("policy should be valid")
            .with_sink(sink.clone());

    let gate = Arc::new(Semaphore::new(0));
    let submit = |value: u32| {
        let gate = Arc::clone(&gate);
        bulkhead.submit(async move {
            gate.acquire().await.expect("gate stays open").forget();
            Outcome::success(value)
        })
    };

    let first = submit(1);
    for _ in 0..400 {
        if first.status() == TaskStatus::Running {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(first.status(), TaskStatus::Running);

    let second = submit(2);
    assert_eq!(second.status(), TaskStatus::Queued);

    let third = submit(3);
    assert_eq!(third.status(), TaskStatus::Rejected);
    assert!(matches!(guard_error(&third.join().await), Some(GuardError::QueueFull { capacity: 1 })));

    gate.add_permits(2);
    assert_eq!(first.join().await.into_value(), Some(1));
    assert_eq!(second.join().await.into_value(), Some(2));

    assert_eq!(sink.counter_total("bulkhead.calls.accepted"), 2);
    assert_eq!(sink.counter_total("bulkhead.calls.rejected"), 1);
    assert!(sink.durations.lock().iter().any(|n| *n == "bulkhead.queue.wait"));
    assert!(sink.durations.lock().iter().any(|n| *n == "bulkhead.execution"));
}

/// Drives a breaker + retry chain the way the interception layer does, with
/// the circuit-open rejection flowing into the retry classifier like any
/// application failure.
#[test]
fn test_breaker_rejection_is_retryable() {
    let clock = MockClock::new();
    let breaker_policy = CircuitBreakerPolicy::builder()
        .rolling_window_size(2)
        .failure_ratio(1.0)
        .open_duration(Duration::from_millis(100))
        .half_open_success_threshold(1)
        .build()
        .expect("policy should be valid");
    let breaker =
        CircuitBreaker::with_clock(breaker_policy, clock.clone()).expect("policy should be valid");

    let retry_policy = RetryPolicy::builder()
        .max_retries(5)
        .base_delay(Duration::from_millis(1))
        .retry_on(CauseMatcher::any())
        .build()
        .expect("policy should be valid");
    let mut retry = Retry::new(retry_policy);
    retry.start();

    let invocations = AtomicU32::new(0);
    let mut categories = Vec::new();

    // Protected call that always fails; the loop is the interception layer.
    loop {
        let outcome: Outcome<u32> = if breaker.request_permission() {
            invocations.fetch_add(1, Ordering::SeqCst);
            let outcome = Outcome::failure(TestError::new("backend down"));
            breaker.record_result(&outcome);
            outcome
        } else {
            Outcome::failure(GuardError::CircuitOpen)
        };

        let verdict = retry.record_result(&outcome);
        categories.push(verdict.category);
        if !verdict.should_retry {
            break;
        }
    }

    // Two real invocations opened the breaker; the remaining attempts were
    // synthesized rejections that the retry policy still classified as
    // retry-eligible.
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(categories.len(), 6);
    assert_eq!(categories[5], AttemptCategory::MaxRetriesReached);
    assert!(categories[..5].iter().all(|c| *c == AttemptCategory::MatchedRetryOn));

    // After the open duration the breaker probes and recovers.
    clock.advance_millis(100);
    assert!(breaker.request_permission());
    breaker.record_result(&Outcome::success(1));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Timeout expiry aborts a long-running bulkhead task: the callback fires
/// once, the task is interrupted cooperatively, and the permit frees up for
/// the next submission.
#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_expiry_aborts_running_task() {
    let scheduler = Arc::new(TokioScheduler);
    let policy = BulkheadPolicy::builder()
        .max_concurrent(1)
        .queue_capacity(0)
        .build()
        .expect("policy should be valid");
    let bulkhead: Arc<AsyncBulkhead<u32>> =
        Arc::new(AsyncBulkhead::new(policy, scheduler.clone()).expect("policy should be valid"));

    let handle = Arc::new(bulkhead.submit(async {
        sleep(Duration::from_secs(30)).await;
        Outcome::success(1)
    }));
    for _ in 0..400 {
        if handle.status() == TaskStatus::Running {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    let timeout = Timeout::new(TimeoutPolicy::new(Duration::from_millis(50)), scheduler);
    let for_expiry = Arc::clone(&handle);
    timeout.set_callback(move || {
        for_expiry.abort(true);
    });
    timeout.start().expect("start should succeed");

    // The 30s task is torn down well before its own deadline.
    for _ in 0..400 {
        if bulkhead.current_concurrent() == 0 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(bulkhead.current_concurrent(), 0);
    assert!(timeout.is_timed_out());
    assert_eq!(timeout.stop(), Ok(()));

    let next = bulkhead.submit(async { Outcome::success(2) });
    assert_eq!(next.join().await.into_value(), Some(2));
}

/// Fallback closes the chain: after retries exhaust, the eligible failure is
/// substituted, and a failure raised by the handler itself is terminal.
#[test]
fn test_fallback_after_retries_exhausted() {
    let retry_policy = RetryPolicy::builder()
        .max_retries(1)
        .base_delay(Duration::from_millis(1))
        .build()
        .expect("policy should be valid");
    let mut retry = Retry::new(retry_policy);
    retry.start();

    let mut outcome: Outcome<u32> = Outcome::failure(TestError::new("flaky"));
    loop {
        let verdict = retry.record_result(&outcome);
        if !verdict.should_retry {
            assert_eq!(verdict.category, AttemptCategory::MaxRetriesReached);
            break;
        }
        outcome = Outcome::failure(TestError::new("flaky"));
    }

    let fallback = Fallback::new(FallbackPolicy::on_any_failure(), |context| {
        assert!(context.cause.downcast_ref::<TestError>().is_some());
        Outcome::success(0)
    });
    assert!(fallback.should_apply(&outcome));
    let substituted = fallback.run(outcome);
    assert_eq!(substituted.value(), Some(&0));

    // A handler that itself fails produces a terminal failure outcome.
    let failing: Fallback<u32> = Fallback::new(FallbackPolicy::on_any_failure(), |_| {
        Outcome::failure(TestError::new("no fallback data"))
    });
    let terminal = failing.run(Outcome::failure(TestError::new("flaky")));
    assert!(terminal.is_failure());
}

/// Exhaustive rolling-window property: for every 10-step boolean sequence,
/// `is_over_threshold` agrees with a naive reference over the most recent
/// `size` entries and is false while the window is filling.
#[test]
fn test_rolling_window_matches_reference() {
    const SIZE: usize = 4;
    const STEPS: usize = 10;
    let threshold = 2; // ceil(4 * 0.5)

    for pattern in 0u32..(1 << STEPS) {
        let mut window = RollingWindow::new(SIZE, 0.5);
        let mut history = Vec::new();

        for step in 0..STEPS {
            let is_failure = pattern >> step & 1 == 1;
            window.record(is_failure);
            history.push(is_failure);

            let expected = if history.len() < SIZE {
                false
            } else {
                let recent_failures =
                    history[history.len() - SIZE..].iter().filter(|f| **f).count();
                recent_failures >= threshold
            };
            assert_eq!(
                window.is_over_threshold(),
                expected,
                "pattern {pattern:#b} diverged at step {step}"
            );
        }
    }
}

/// The half-open stall heuristic admits probes without an upper bound while
/// trials hang; a completed probe then restores normal accounting.
#[test]
fn test_half_open_stall_heuristic_is_unbounded() {
    let clock = MockClock::new();
    let policy = CircuitBreakerPolicy::builder()
        .rolling_window_size(2)
        .failure_ratio(1.0)
        .open_duration(Duration::from_millis(100))
        .half_open_success_threshold(1)
        .build()
        .expect("policy should be valid");
    let breaker =
        CircuitBreaker::with_clock(policy, clock.clone()).expect("policy should be valid");

    breaker.record_result(&Outcome::<()>::failure(TestError::new("down")));
    breaker.record_result(&Outcome::<()>::failure(TestError::new("down")));
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance_millis(100);
    assert!(breaker.request_permission());

    // Each full open_duration of silence admits one more trial, without
    // bound, while nothing completes.
    for expected_running in 2..6 {
        assert!(!breaker.request_permission(), "cap holds inside the stall window");
        clock.advance_millis(100);
        assert!(breaker.request_permission());
        assert_eq!(breaker.metrics().half_open_trials_running, expected_running);
    }

    breaker.record_result(&Outcome::success(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
}
