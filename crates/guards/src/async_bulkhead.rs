//! Asynchronous bulkhead guard
//!
//! Admission gate plus bounded FIFO waiting queue for deferred-style work: a
//! counting gate over `max_concurrent` running permits and a queue of at most
//! `queue_capacity` waiting tasks. [`submit`](AsyncBulkhead::submit) never
//! blocks: a task is dispatched immediately when a permit is free and nothing
//! is waiting, queued while capacity remains, and rejected synchronously
//! otherwise. Freed slots are offered to the queue head at once, so a permit
//! is never left idle while the queue is non-empty.
//!
//! Each submission is tracked by an [`ExecutionTask`] status machine
//! (`New → Queued → Submitted → Running → Complete`, or `Rejected` /
//! `Cancelled`). Every transition that touches enqueue/dequeue/permit state
//! runs under the bulkhead's single mutex, and the lock order is always
//! bulkhead-then-task, so `submit`, `abort` and the task's own completion can
//! never observe a half-applied transition or leak a permit. `release` is
//! gated on the `Running → Complete` edge, which makes a second release a
//! no-op.
//!
//! Results are delivered over a oneshot channel owned by the returned
//! [`TaskHandle`]; the channel doubles as the task's failure handler, so
//! guard-internal dispatch errors resolve it with a synthesized failure while
//! still returning the permit.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bulkhead::BulkheadPolicy;
use crate::error::{ConfigResult, GuardError};
use crate::metrics::{names, MetricsSink, NoopSink};
use crate::outcome::Outcome;
use crate::scheduler::Scheduler;

/// Lifecycle states of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet through admission.
    New,
    /// Waiting in the FIFO queue.
    Queued,
    /// Dispatched to the worker pool, not yet running.
    Submitted,
    /// The unit of work is executing.
    Running,
    /// Finished; the result has been delivered and the permit returned.
    Complete,
    /// Refused at submission because the queue was at capacity.
    Rejected,
    /// Aborted before completion.
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::New => write!(f, "NEW"),
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Submitted => write!(f, "SUBMITTED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Complete => write!(f, "COMPLETE"),
            TaskStatus::Rejected => write!(f, "REJECTED"),
            TaskStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

struct TaskCore<T> {
    status: TaskStatus,
    work: Option<BoxFuture<'static, Outcome<T>>>,
    done: Option<oneshot::Sender<Outcome<T>>>,
}

/// One submission tracked through the status machine.
///
/// Lock order: when both are needed, the bulkhead mutex is taken before the
/// task mutex. Status-only reads may take the task mutex alone.
pub struct ExecutionTask<T> {
    state: Mutex<TaskCore<T>>,
    cancel: CancellationToken,
    enqueued_at: Instant,
}

impl<T> ExecutionTask<T> {
    fn new(work: BoxFuture<'static, Outcome<T>>, done: oneshot::Sender<Outcome<T>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TaskCore { status: TaskStatus::New, work: Some(work), done: Some(done) }),
            cancel: CancellationToken::new(),
            enqueued_at: Instant::now(),
        })
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }
}

struct BulkheadInner<T> {
    permits_free: usize,
    queue: VecDeque<Arc<ExecutionTask<T>>>,
}

struct BulkheadShared<T> {
    policy: BulkheadPolicy,
    inner: Mutex<BulkheadInner<T>>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn MetricsSink>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

/// Metrics snapshot for the asynchronous bulkhead.
#[derive(Debug, Clone)]
pub struct AsyncBulkheadMetrics {
    /// Submissions admitted (dispatched or queued).
    pub accepted: u64,
    /// Submissions rejected at the queue capacity.
    pub rejected: u64,
    /// Tasks that ran to completion.
    pub completed: u64,
    /// Tasks aborted before completion.
    pub cancelled: u64,
    /// Currently running executions.
    pub current_concurrent: usize,
    /// Currently waiting tasks.
    pub queue_depth: usize,
    /// Configured permit count.
    pub max_concurrent: usize,
    /// Configured waiting-queue capacity.
    pub queue_capacity: usize,
}

/// Admission gate + bounded FIFO waiting queue + worker dispatch.
pub struct AsyncBulkhead<T: Send + 'static> {
    shared: Arc<BulkheadShared<T>>,
}

impl<T: Send + 'static> AsyncBulkhead<T> {
    /// Create a bulkhead dispatching onto the shared scheduler.
    pub fn new(policy: BulkheadPolicy, scheduler: Arc<dyn Scheduler>) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self {
            shared: Arc::new(BulkheadShared {
                inner: Mutex::new(BulkheadInner {
                    permits_free: policy.max_concurrent,
                    queue: VecDeque::with_capacity(policy.queue_capacity),
                }),
                policy,
                scheduler,
                sink: Arc::new(NoopSink),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        })
    }

    /// Attach a metrics sink, replacing the default no-op sink.
    pub fn with_sink(self, sink: Arc<dyn MetricsSink>) -> Self {
        // Shared state is freshly constructed and not yet handed out.
        let shared = match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                shared.sink = sink;
                shared
            }
            Err(shared) => return Self { shared },
        };
        Self { shared: Arc::new(shared) }
    }

    /// Submit a unit of work.
    ///
    /// Non-blocking: the task is dispatched at once when a permit is free and
    /// the queue is empty, appended to the queue while capacity remains, and
    /// otherwise marked [`TaskStatus::Rejected`] with a synthesized
    /// [`GuardError::QueueFull`] failure delivered through the handle.
    pub fn submit<F>(&self, work: F) -> TaskHandle<T>
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = ExecutionTask::new(Box::pin(work), tx);
        let shared = &self.shared;

        let (dispatch_now, rejection) = {
            let mut inner = shared.inner.lock();
            let mut state = task.state.lock();

            if inner.permits_free > 0 && inner.queue.is_empty() {
                // Free slot and nobody waiting: skip the queue entirely.
                inner.permits_free -= 1;
                state.status = TaskStatus::Submitted;
                (true, None)
            } else if inner.queue.len() < shared.policy.queue_capacity {
                state.status = TaskStatus::Queued;
                drop(state);
                inner.queue.push_back(Arc::clone(&task));
                shared.sink.gauge(names::BULKHEAD_QUEUE_DEPTH, inner.queue.len() as f64);
                (false, None)
            } else {
                state.status = TaskStatus::Rejected;
                (false, state.done.take())
            }
        };

        if let Some(done) = rejection {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            shared.sink.counter(names::BULKHEAD_REJECTED, 1);
            debug!(capacity = shared.policy.queue_capacity, "bulkhead queue full, task rejected");
            let _ = done
                .send(Outcome::failure(GuardError::QueueFull { capacity: shared.policy.queue_capacity }));
        } else {
            shared.accepted.fetch_add(1, Ordering::Relaxed);
            shared.sink.counter(names::BULKHEAD_ACCEPTED, 1);
            if dispatch_now {
                Self::dispatch(shared, Arc::clone(&task));
            }
        }

        TaskHandle { task, shared: Some(Arc::clone(shared)), rx }
    }

    /// Currently waiting tasks.
    pub fn queue_depth(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Currently running executions.
    pub fn current_concurrent(&self) -> usize {
        self.shared.policy.max_concurrent - self.shared.inner.lock().permits_free
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> AsyncBulkheadMetrics {
        let inner = self.shared.inner.lock();
        AsyncBulkheadMetrics {
            accepted: self.shared.accepted.load(Ordering::Acquire),
            rejected: self.shared.rejected.load(Ordering::Acquire),
            completed: self.shared.completed.load(Ordering::Acquire),
            cancelled: self.shared.cancelled.load(Ordering::Acquire),
            current_concurrent: self.shared.policy.max_concurrent - inner.permits_free,
            queue_depth: inner.queue.len(),
            max_concurrent: self.shared.policy.max_concurrent,
            queue_capacity: self.shared.policy.queue_capacity,
        }
    }

    /// Hand a dispatched task to the worker pool.
    fn dispatch(shared: &Arc<BulkheadShared<T>>, task: Arc<ExecutionTask<T>>) {
        let scheduler = Arc::clone(&shared.scheduler);
        let shared = Arc::clone(shared);
        scheduler.dispatch(Box::pin(async move {
            // Submitted -> Running right before executing the work. An abort
            // that won the race has already returned the permit; nothing to do.
            let work = {
                let mut inner = shared.inner.lock();
                let mut state = task.state.lock();
                if state.status != TaskStatus::Submitted {
                    return;
                }
                match state.work.take() {
                    Some(work) => {
                        state.status = TaskStatus::Running;
                        drop(state);
                        shared.sink.duration(names::BULKHEAD_QUEUE_WAIT, task.enqueued_at.elapsed());
                        shared
                            .sink
                            .gauge(names::BULKHEAD_RUNNING, (shared.policy.max_concurrent - inner.permits_free) as f64);
                        work
                    }
                    None => {
                        // Bookkeeping failure between dequeue and execution:
                        // route it to the failure handler and still release.
                        state.status = TaskStatus::Complete;
                        let done = state.done.take();
                        drop(state);
                        inner.permits_free += 1;
                        let followers = Self::drain(&mut inner);
                        drop(inner);
                        warn!("dispatched task had no work attached");
                        if let Some(done) = done {
                            let _ = done.send(Outcome::failure(GuardError::Dispatch {
                                message: "task reached the pool without a unit of work".into(),
                            }));
                        }
                        for follower in followers {
                            Self::dispatch(&shared, follower);
                        }
                        return;
                    }
                }
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                () = task.cancel.cancelled() => Outcome::failure(GuardError::Cancelled),
                outcome = work => outcome,
            };
            shared.sink.duration(names::BULKHEAD_EXECUTION, started.elapsed());
            Self::release(&shared, &task, outcome);
        }));
    }

    /// Return the permit and deliver the result.
    ///
    /// Only the `Running -> Complete` transition releases; any other status
    /// means the permit has already been returned (or never held), so a
    /// repeated call returns it at most once.
    fn release(shared: &Arc<BulkheadShared<T>>, task: &Arc<ExecutionTask<T>>, outcome: Outcome<T>) {
        let (done, followers) = {
            let mut inner = shared.inner.lock();
            let mut state = task.state.lock();
            if state.status != TaskStatus::Running {
                return;
            }
            state.status = TaskStatus::Complete;
            let done = state.done.take();
            drop(state);
            inner.permits_free += 1;
            (done, Self::drain(&mut inner))
        };

        shared.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
        // A freed slot is immediately offered to the next queued task.
        for follower in followers {
            Self::dispatch(shared, follower);
        }
    }

    /// Pop queue heads into free permits. Called with the bulkhead lock held;
    /// the caller dispatches the returned tasks after unlocking.
    fn drain(inner: &mut BulkheadInner<T>) -> Vec<Arc<ExecutionTask<T>>> {
        let mut ready = Vec::new();
        while inner.permits_free > 0 {
            let Some(task) = inner.queue.pop_front() else {
                break;
            };
            let mut state = task.state.lock();
            if state.status == TaskStatus::Queued {
                state.status = TaskStatus::Submitted;
                inner.permits_free -= 1;
                drop(state);
                ready.push(task);
            }
        }
        ready
    }

    fn abort_task(
        shared: &Arc<BulkheadShared<T>>,
        task: &Arc<ExecutionTask<T>>,
        may_interrupt: bool,
    ) -> bool {
        let (aborted, done, followers) = {
            let mut inner = shared.inner.lock();
            let mut state = task.state.lock();
            match state.status {
                TaskStatus::Queued => {
                    state.status = TaskStatus::Cancelled;
                    let done = state.done.take();
                    drop(state);
                    inner.queue.retain(|queued| !Arc::ptr_eq(queued, task));
                    (true, done, Vec::new())
                }
                TaskStatus::Submitted => {
                    // Dispatched but not yet running: the pool-side transition
                    // will see the status change and back off, so the reserved
                    // permit comes back here.
                    state.status = TaskStatus::Cancelled;
                    let done = state.done.take();
                    drop(state);
                    task.cancel.cancel();
                    inner.permits_free += 1;
                    let followers = Self::drain(&mut inner);
                    (true, done, followers)
                }
                TaskStatus::Running => {
                    if may_interrupt {
                        // Best-effort: the running work must cooperate, and it
                        // alone releases the permit when it genuinely stops.
                        task.cancel.cancel();
                        (true, None, Vec::new())
                    } else {
                        (false, None, Vec::new())
                    }
                }
                _ => (false, None, Vec::new()),
            }
        };

        if let Some(done) = done {
            shared.cancelled.fetch_add(1, Ordering::Relaxed);
            let _ = done.send(Outcome::failure(GuardError::Cancelled));
        }
        for follower in followers {
            Self::dispatch(shared, follower);
        }
        aborted
    }
}

impl<T: Send + 'static> fmt::Debug for AsyncBulkhead<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("AsyncBulkhead")
            .field("max_concurrent", &self.shared.policy.max_concurrent)
            .field("queue_capacity", &self.shared.policy.queue_capacity)
            .field("permits_free", &inner.permits_free)
            .field("queue_depth", &inner.queue.len())
            .finish()
    }
}

/// Handle to a submitted task.
pub struct TaskHandle<T: Send + 'static> {
    task: Arc<ExecutionTask<T>>,
    shared: Option<Arc<BulkheadShared<T>>>,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Whether the submission made it past admission.
    pub fn was_accepted(&self) -> bool {
        self.task.status() != TaskStatus::Rejected
    }

    /// Current status of the task.
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// Abort the task.
    ///
    /// A queued task is removed from the queue; a dispatched-but-not-running
    /// task is cancelled and its reserved permit returned; a running task is
    /// interrupted cooperatively when `may_interrupt` is set, and keeps its
    /// permit until the work itself stops. Returns whether an abort was
    /// initiated.
    pub fn abort(&self, may_interrupt: bool) -> bool {
        match &self.shared {
            Some(shared) => AsyncBulkhead::abort_task(shared, &self.task, may_interrupt),
            None => {
                // Direct-dispatch handle: only a running task can be aborted.
                if may_interrupt && self.task.status() == TaskStatus::Running {
                    self.task.cancel.cancel();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Await the task's final outcome.
    pub async fn join(self) -> Outcome<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::failure(GuardError::Dispatch {
                message: "task result channel dropped".into(),
            }),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("status", &self.status()).finish()
    }
}

/// Call-site async-bulkhead slot: an active gate or a direct dispatcher for
/// sites with no bulkhead policy. Selected once at construction.
pub enum AsyncBulkheadGuard<T: Send + 'static> {
    /// Gate submissions through the wrapped bulkhead.
    Active(AsyncBulkhead<T>),
    /// Dispatch every submission straight to the pool.
    PassThrough(Arc<dyn Scheduler>),
}

impl<T: Send + 'static> AsyncBulkheadGuard<T> {
    /// Submit a unit of work through the configured slot.
    pub fn submit<F>(&self, work: F) -> TaskHandle<T>
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        match self {
            AsyncBulkheadGuard::Active(bulkhead) => bulkhead.submit(work),
            AsyncBulkheadGuard::PassThrough(scheduler) => {
                let (tx, rx) = oneshot::channel();
                let task = ExecutionTask::new(Box::pin(work), tx);
                task.state.lock().status = TaskStatus::Submitted;

                let for_pool = Arc::clone(&task);
                scheduler.dispatch(Box::pin(async move {
                    let work = {
                        let mut state = for_pool.state.lock();
                        state.status = TaskStatus::Running;
                        state.work.take()
                    };
                    let Some(work) = work else { return };
                    let outcome = tokio::select! {
                        () = for_pool.cancel.cancelled() => {
                            Outcome::failure(GuardError::Cancelled)
                        }
                        outcome = work => outcome,
                    };
                    let done = {
                        let mut state = for_pool.state.lock();
                        state.status = TaskStatus::Complete;
                        state.done.take()
                    };
                    if let Some(done) = done {
                        let _ = done.send(outcome);
                    }
                }));

                TaskHandle { task, shared: None, rx }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    fn bulkhead(max_concurrent: usize, queue_capacity: usize) -> AsyncBulkhead<u32> {
        let policy = BulkheadPolicy::builder()
            .max_concurrent(max_concurrent)
            .queue_capacity(queue_capacity)
            .build()
            .expect("test policy should be valid");
        AsyncBulkhead::new(policy, Arc::new(TokioScheduler)).expect("test policy should be valid")
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn gated_work(gate: &Arc<Semaphore>, value: u32) -> impl Future<Output = Outcome<u32>> {
        let gate = Arc::clone(gate);
        async move {
            let permit = gate.acquire().await;
            permit.expect("gate semaphore stays open").forget();
            Outcome::success(value)
        }
    }

    fn cause_is_cancelled(outcome: &Outcome<u32>) -> bool {
        outcome
            .cause()
            .and_then(|cause| cause.downcast_ref::<GuardError>())
            .map(|err| matches!(err, GuardError::Cancelled))
            .unwrap_or(false)
    }

    /// Walks the canonical pipeline: max 1, queue 1, three submissions land in
    /// Running / Queued / Rejected, and completing the first redispatches the
    /// queued task without a fourth submission.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_redispatch_on_release() {
        let bulkhead = bulkhead(1, 1);
        let gate = Arc::new(Semaphore::new(0));

        let first = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| first.status() == TaskStatus::Running).await;

        let second = bulkhead.submit(gated_work(&gate, 2));
        assert_eq!(second.status(), TaskStatus::Queued);

        let third = bulkhead.submit(gated_work(&gate, 3));
        assert_eq!(third.status(), TaskStatus::Rejected);
        assert!(!third.was_accepted());
        assert!(third.join().await.is_failure());

        // Finish the first task; the queued one takes the slot.
        gate.add_permits(1);
        assert_eq!(first.join().await.into_value(), Some(1));
        wait_for(|| second.status() == TaskStatus::Running).await;

        gate.add_permits(1);
        assert_eq!(second.join().await.into_value(), Some(2));
        assert_eq!(bulkhead.current_concurrent(), 0);
        assert_eq!(bulkhead.queue_depth(), 0);
    }

    /// Queue capacity counts waiting tasks only: with capacity 0 a submission
    /// still runs when a permit is free, and is rejected otherwise.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_queue_capacity_still_executes() {
        let bulkhead = bulkhead(1, 0);
        let gate = Arc::new(Semaphore::new(0));

        let first = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| first.status() == TaskStatus::Running).await;

        let second = bulkhead.submit(gated_work(&gate, 2));
        assert_eq!(second.status(), TaskStatus::Rejected);

        gate.add_permits(1);
        assert_eq!(first.join().await.into_value(), Some(1));
    }

    /// Aborting a queued task removes it from the queue; later releases skip
    /// it and pick the next waiter.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_queued_task() {
        let bulkhead = bulkhead(1, 2);
        let gate = Arc::new(Semaphore::new(0));

        let running = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| running.status() == TaskStatus::Running).await;
        let doomed = bulkhead.submit(gated_work(&gate, 2));
        let survivor = bulkhead.submit(gated_work(&gate, 3));
        assert_eq!(bulkhead.queue_depth(), 2);

        assert!(doomed.abort(false));
        assert_eq!(doomed.status(), TaskStatus::Cancelled);
        assert_eq!(bulkhead.queue_depth(), 1);
        assert!(cause_is_cancelled(&doomed.join().await));

        gate.add_permits(1);
        assert_eq!(running.join().await.into_value(), Some(1));
        wait_for(|| survivor.status() == TaskStatus::Running).await;
        gate.add_permits(1);
        assert_eq!(survivor.join().await.into_value(), Some(3));
    }

    /// Interrupting a running task is cooperative: the select observes the
    /// token, the outcome is a cancellation failure, and the slot is handed
    /// to the next waiter exactly once.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_running_task_with_interrupt() {
        let bulkhead = bulkhead(1, 1);
        let gate = Arc::new(Semaphore::new(0));

        let running = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| running.status() == TaskStatus::Running).await;
        let waiting = bulkhead.submit(gated_work(&gate, 2));

        assert!(running.abort(true));
        let outcome = running.join().await;
        assert!(cause_is_cancelled(&outcome));

        wait_for(|| waiting.status() == TaskStatus::Running).await;
        assert_eq!(bulkhead.current_concurrent(), 1);
        gate.add_permits(1);
        assert_eq!(waiting.join().await.into_value(), Some(2));
    }

    /// Without `may_interrupt`, a running task is left alone.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_running_task_without_interrupt() {
        let bulkhead = bulkhead(1, 0);
        let gate = Arc::new(Semaphore::new(0));

        let running = bulkhead.submit(gated_work(&gate, 9));
        wait_for(|| running.status() == TaskStatus::Running).await;

        assert!(!running.abort(false));
        gate.add_permits(1);
        assert_eq!(running.join().await.into_value(), Some(9));
    }

    /// A second release of the same task returns the permit at most once:
    /// the running count never exceeds `max_concurrent`.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_is_idempotent() {
        let bulkhead = bulkhead(1, 0);
        let gate = Arc::new(Semaphore::new(0));

        let running = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| running.status() == TaskStatus::Running).await;
        let task = Arc::clone(&running.task);

        gate.add_permits(1);
        assert_eq!(running.join().await.into_value(), Some(1));
        wait_for(|| bulkhead.shared.inner.lock().permits_free == 1).await;

        // Forced duplicate release: the status is already Complete, so the
        // permit count must not move.
        AsyncBulkhead::release(&bulkhead.shared, &task, Outcome::success(1));
        assert_eq!(bulkhead.shared.inner.lock().permits_free, 1);
        assert_eq!(bulkhead.current_concurrent(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_metrics_snapshot() {
        let bulkhead = bulkhead(1, 1);
        let gate = Arc::new(Semaphore::new(0));

        let first = bulkhead.submit(gated_work(&gate, 1));
        wait_for(|| first.status() == TaskStatus::Running).await;
        let _second = bulkhead.submit(gated_work(&gate, 2));
        let third = bulkhead.submit(gated_work(&gate, 3));
        assert!(!third.was_accepted());

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.accepted, 2);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.current_concurrent, 1);
        assert_eq!(metrics.queue_depth, 1);

        gate.add_permits(2);
        let _ = first.join().await;
    }

    /// The pass-through guard dispatches straight to the pool and still
    /// supports join and cooperative interruption.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_pass_through_direct_dispatch() {
        let guard: AsyncBulkheadGuard<u32> = AsyncBulkheadGuard::PassThrough(Arc::new(TokioScheduler));

        let quick = guard.submit(async { Outcome::success(5) });
        assert!(quick.was_accepted());
        assert_eq!(quick.join().await.into_value(), Some(5));

        let gate = Arc::new(Semaphore::new(0));
        let hung = guard.submit(gated_work(&gate, 1));
        wait_for(|| hung.status() == TaskStatus::Running).await;
        assert!(hung.abort(true));
        assert!(cause_is_cancelled(&hung.join().await));
    }
}
