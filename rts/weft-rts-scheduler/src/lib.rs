//! Work-stealing fork/join scheduler for the weft runtime.
//!
//! Key features:
//!
//! - **Work stealing** - Each worker owns a deque; idle workers steal from
//!   the opposite end of others' deques
//! - **Helping joins** - A joining worker runs tasks of whoever stole the
//!   task it waits for, instead of blocking
//! - **Compensation** - A worker that must block wakes or starts a spare so
//!   the scheduler keeps its parallelism
//! - **Counted completers** - Completion trees that finish without joins
//! - **Event tracing** - Hooks for observability
//!
//! # Fork/Join
//!
//! ```ignore
//! use weft_rts_scheduler::{Scheduler, Task};
//!
//! fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let left = Task::new(move || fib(n - 1));
//!     left.fork();
//!     fib(n - 2) + left.join().unwrap()
//! }
//!
//! let scheduler = Scheduler::new(4);
//! let result = scheduler.invoke(&Task::new(|| fib(30)))?;
//! ```
//!
//! # Worker Lifecycle
//!
//! ```text
//!   signal                 steal
//!     |                      |
//!     v                      v
//! +-------+   found     +---------+
//! | Start | ----------> | Running | <----------------+
//! +-------+             +---------+                  |
//!                           |  no work (two stable   | signalled
//!                           |  sweeps)               |
//!                           v                        |
//!                      +----------+   park      +--------+
//!                      | Inactive | ----------> | Parked |
//!                      +----------+             +--------+
//!                                                   |
//!                                  keep-alive / stop v
//!                                               +------+
//!                                               | Exit |
//!                                               +------+
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod blocker;
mod completer;
mod config;
mod ctl;
mod deque;
mod error;
mod pool;
mod scheduler;
mod task;
mod worker;

pub use blocker::{managed_block, ManagedBlocker};
pub use completer::Completer;
pub use config::{
    env_override, SchedulerConfig, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_SPARES, MAX_PARALLELISM,
};
pub use error::{panic_message, Cause, ConfigError, RejectedError, TaskError};
pub use scheduler::{Executor, Scheduler, SchedulerStats, ThreadPerTaskExecutor};
pub use task::{check_cancelled, invoke_both, Runnable, Task};
pub use worker::{
    current_worker_index, help_quiesce, in_worker, poll_task, queued_task_count,
    surplus_queued_task_count, PolledTask,
};

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// ============================================================================
// Event Tracing
// ============================================================================

/// Events emitted by schedulers.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// A worker thread started.
    WorkerStart {
        /// Scheduler ID.
        pool: PoolId,
        /// Worker index.
        worker: usize,
        /// Timestamp.
        timestamp: Instant,
    },
    /// An idle worker parked.
    WorkerPark {
        /// Scheduler ID.
        pool: PoolId,
        /// Worker index.
        worker: usize,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A worker thread exited.
    WorkerExit {
        /// Scheduler ID.
        pool: PoolId,
        /// Worker index.
        worker: usize,
        /// Timestamp.
        timestamp: Instant,
    },
    /// A spare worker was started for a blocked one.
    Compensate {
        /// Scheduler ID.
        pool: PoolId,
        /// Workers including the new spare.
        pool_size: usize,
        /// Timestamp.
        timestamp: Instant,
    },
    /// Shutdown began.
    Shutdown {
        /// Scheduler ID.
        pool: PoolId,
        /// Whether queued tasks are cancelled.
        now: bool,
        /// Timestamp.
        timestamp: Instant,
    },
    /// Every worker exited after shutdown.
    Terminated {
        /// Scheduler ID.
        pool: PoolId,
        /// Timestamp.
        timestamp: Instant,
    },
}

/// Callback for trace events.
pub type TraceCallback = Box<dyn Fn(TraceEvent) + Send + Sync>;

/// Global trace callback.
static TRACE_CALLBACK: RwLock<Option<TraceCallback>> = RwLock::new(None);

/// Set the global trace callback.
///
/// Events from every scheduler are delivered to this callback on the thread
/// that caused them.
pub fn set_trace_callback(callback: TraceCallback) {
    *TRACE_CALLBACK.write() = Some(callback);
}

/// Clear the global trace callback.
pub fn clear_trace_callback() {
    *TRACE_CALLBACK.write() = None;
}

/// Emit a trace event.
pub(crate) fn trace(event: TraceEvent) {
    if let Some(callback) = TRACE_CALLBACK.read().as_ref() {
        callback(event);
    }
}

/// Unique identifier for a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({})", self.0)
    }
}
