//! Shared deferred-execution facility
//!
//! The guards never spawn onto an ambient/global executor; the worker pool
//! and timer facility are passed explicitly into each guard's constructor as
//! a [`Scheduler`]. The [`Timeout`](crate::timeout::Timeout) guard uses
//! [`Scheduler::schedule_once`] for its expiry callback and the asynchronous
//! bulkhead uses [`Scheduler::dispatch`] to hand dequeued tasks to the pool.
//!
//! [`TokioScheduler`] is the production implementation; both operations run
//! on the surrounding tokio runtime, never inline with the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::sleep;

/// Handle for cancelling a scheduled one-shot job.
///
/// Cancellation is guaranteed if it races ahead of expiry; once the job has
/// started running, cancelling is a no-op.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Cancel the scheduled job.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether the job has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Worker-pool and timer abstraction shared by the guards.
pub trait Scheduler: Send + Sync {
    /// Run `job` on the pool after `delay`, unless cancelled first.
    fn schedule_once(&self, delay: Duration, job: Box<dyn FnOnce() + Send>) -> ScheduleHandle;

    /// Run `work` on the pool as soon as a worker picks it up.
    fn dispatch(&self, work: BoxFuture<'static, ()>);
}

/// [`Scheduler`] backed by the surrounding tokio runtime.
///
/// Must be used from within a runtime context; the scheduled job and the
/// dispatched work both run on pool threads, never inline with the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, job: Box<dyn FnOnce() + Send>) -> ScheduleHandle {
        let handle = ScheduleHandle::new();
        let watched = handle.clone();

        tokio::spawn(async move {
            sleep(delay).await;
            if !watched.is_cancelled() {
                job();
            }
        });

        handle
    }

    fn dispatch(&self, work: BoxFuture<'static, ()>) {
        tokio::spawn(work);
    }
}
