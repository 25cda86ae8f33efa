//! Worker pool contract for the parallel ops.
//!
//! The engine only needs one shape of parallelism: hand out a batch of
//! independent jobs, wait for all of them. [`WorkerPool::run`] must not
//! return before every job has finished — chunk results are written
//! through borrows that end with the call.
//!
//! [`CoroutinePool`] implements the contract on May coroutines; the
//! work-stealing runtime spreads the chunks across its worker threads.
//! Cancellation is cooperative: ops poll a [`CancelFlag`] between items
//! and bail out, they are never interrupted mid-item.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One unit of work. Borrows are fine: the pool joins before returning.
pub type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

pub trait WorkerPool: Sync {
    /// Parallelism the pool is sized for; ops chunk work accordingly.
    fn workers(&self) -> usize;

    /// Run every job and join them all.
    fn run(&self, jobs: Vec<Job<'_>>);
}

/// May-backed pool.
pub struct CoroutinePool {
    workers: usize,
}

impl CoroutinePool {
    pub fn new(workers: usize) -> Self {
        CoroutinePool {
            workers: workers.max(1),
        }
    }
}

impl WorkerPool for CoroutinePool {
    fn workers(&self) -> usize {
        self.workers
    }

    fn run(&self, jobs: Vec<Job<'_>>) {
        may::coroutine::scope(|scope| {
            for job in jobs {
                // SAFETY: jobs use no coroutine-local storage, and the
                // scope joins every spawn before `run` returns, so the
                // borrowed data outlives the coroutines.
                unsafe {
                    scope.spawn(job);
                }
            }
        });
    }
}

/// Shared stop bit observed by workers between items.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
