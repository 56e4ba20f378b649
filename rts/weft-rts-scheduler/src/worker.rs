//! Worker threads and per-thread scheduler state.

use crate::deque::WorkQueue;
use crate::pool::Pool;
use crate::task::{cancel_ignoring, do_exec, JobRef};
use crate::{trace, TraceEvent};
use crossbeam::sync::Parker;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The pool and queue of the current worker thread.
pub(crate) struct WorkerContext {
    pub(crate) pool: Arc<Pool>,
    pub(crate) queue: Arc<WorkQueue>,
}

static HINT_SEED: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
    /// Random hint picking this thread's submission queue; 0 until first use.
    static QUEUE_HINT: Cell<u32> = const { Cell::new(0) };
}

/// Run `f` with the current worker context, if this is a worker thread.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&WorkerContext>) -> R) -> R {
    WORKER.with(|w| f(w.borrow().as_ref()))
}

/// This thread's queue hint, seeding it on first use.
pub(crate) fn queue_hint() -> u32 {
    QUEUE_HINT.with(|p| {
        let mut r = p.get();
        if r == 0 {
            r = HINT_SEED
                .fetch_add(0x9e37_79b9, Ordering::Relaxed)
                .wrapping_add(0x9e37_79b9);
            if r == 0 {
                r = 1;
            }
            p.set(r);
        }
        r
    })
}

/// Move this thread to a different queue hint after contention.
pub(crate) fn advance_queue_hint(mut r: u32) -> u32 {
    r ^= r << 13;
    r ^= r >> 17;
    r ^= r << 5;
    QUEUE_HINT.with(|p| p.set(r));
    r
}

/// Clears the worker context and deregisters when the thread exits,
/// including by unwinding.
struct ExitGuard {
    pool: Arc<Pool>,
    queue: Arc<WorkQueue>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        WORKER.with(|w| w.borrow_mut().take());
        let worker = self.queue.index() >> 1;
        tracing::debug!(pool = %self.pool.id(), worker, "worker exiting");
        self.pool.deregister_worker(&self.queue, None);
        trace(TraceEvent::WorkerExit {
            pool: self.pool.id(),
            worker,
            timestamp: Instant::now(),
        });
    }
}

/// Body of a worker thread.
pub(crate) fn run(pool: Arc<Pool>, queue: Arc<WorkQueue>, parker: Parker) {
    let worker = queue.index() >> 1;
    WORKER.with(|w| {
        *w.borrow_mut() = Some(WorkerContext {
            pool: Arc::clone(&pool),
            queue: Arc::clone(&queue),
        });
    });
    tracing::debug!(pool = %pool.id(), worker, "worker started");
    trace(TraceEvent::WorkerStart {
        pool: pool.id(),
        worker,
        timestamp: Instant::now(),
    });
    let guard = ExitGuard {
        pool: Arc::clone(&pool),
        queue: Arc::clone(&queue),
    };
    pool.run_worker(&queue, &parker);
    drop(guard);
}

// ============================================================================
// Worker-side Operations
// ============================================================================

/// Whether the calling thread is a scheduler worker.
#[must_use]
pub fn in_worker() -> bool {
    with_current(|ctx| ctx.is_some())
}

/// Index of the current worker within its scheduler, if any.
#[must_use]
pub fn current_worker_index() -> Option<usize> {
    with_current(|ctx| ctx.map(|w| w.queue.index() >> 1))
}

/// Run queued tasks until the current worker's scheduler is quiescent.
///
/// Outside a worker this waits for quiescence of the common scheduler.
pub fn help_quiesce() {
    let own = with_current(|ctx| ctx.map(|w| (Arc::clone(&w.pool), Arc::clone(&w.queue))));
    match own {
        Some((pool, queue)) => pool.help_quiesce_pool(&queue),
        None => {
            crate::scheduler::common_pool().await_quiescence(std::time::Duration::MAX);
        }
    }
}

/// Number of tasks forked by the current worker that have not run yet.
///
/// Outside a worker this counts the caller's submission queue in the
/// common scheduler.
#[must_use]
pub fn queued_task_count() -> usize {
    let local = with_current(|ctx| ctx.map(|w| w.queue.queue_size()));
    local.unwrap_or_else(|| {
        crate::scheduler::common_pool()
            .submitter_queue()
            .map_or(0, |q| q.queue_size())
    })
}

/// How many more tasks the current worker holds than other workers could
/// steal, as a hint for whether to fork further.
///
/// Idle workers shrink the allowance. Returns 0 outside a worker.
#[must_use]
pub fn surplus_queued_task_count() -> isize {
    with_current(|ctx| {
        let Some(w) = ctx else {
            return 0;
        };
        let p = w.pool.parallelism() as isize;
        let idle = p - w.pool.active_thread_count() as isize;
        let n = w.queue.queue_size() as isize;
        let allowance = if idle > p >> 1 {
            0
        } else if idle > p >> 2 {
            1
        } else if idle > p >> 3 {
            2
        } else if idle > p >> 4 {
            4
        } else {
            8
        };
        n - allowance
    })
}

/// A task taken off a queue without running it.
#[must_use = "a polled task neither runs nor completes unless handled"]
pub struct PolledTask {
    job: JobRef,
}

impl PolledTask {
    /// Run the task on the calling thread.
    pub fn run(self) {
        do_exec(&self.job);
    }

    /// Cancel the task instead of running it.
    pub fn cancel(self) {
        cancel_ignoring(&self.job);
    }
}

impl std::fmt::Debug for PolledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledTask")
            .field("header", self.job.header())
            .finish()
    }
}

/// Take the next local task of the current worker, or a stolen one.
///
/// Returns `None` outside a worker or when no work is visible.
pub fn poll_task() -> Option<PolledTask> {
    let own = with_current(|ctx| ctx.map(|w| (Arc::clone(&w.pool), Arc::clone(&w.queue))));
    let (pool, queue) = own?;
    pool.next_task_for(&queue).map(|job| PolledTask { job })
}
