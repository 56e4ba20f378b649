//! The public scheduler handle, the common scheduler and executors.

use crate::completer::Completer;
use crate::config::SchedulerConfig;
use crate::error::{ConfigError, RejectedError, TaskError};
use crate::pool::Pool;
use crate::task::{join_status, RunJob, Runnable, Task};
use crate::PoolId;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

// ============================================================================
// Statistics
// ============================================================================

/// A snapshot of scheduler counters. Values may be stale by the time they
/// are read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Target number of active workers.
    pub parallelism: usize,
    /// Workers started and not yet exited.
    pub pool_size: usize,
    /// Workers scanning for or running tasks.
    pub active_threads: usize,
    /// Active workers not blocked in a join or managed block.
    pub running_threads: usize,
    /// Tasks stolen by workers.
    pub steals: u64,
    /// Tasks waiting in worker queues.
    pub queued_tasks: usize,
    /// Tasks waiting in submission queues.
    pub queued_submissions: usize,
}

// ============================================================================
// Scheduler
// ============================================================================

struct Handle {
    pool: Arc<Pool>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.pool.is_common() {
            self.pool.shutdown();
        }
    }
}

/// A work-stealing fork/join scheduler.
///
/// Clones share the same pool. When the last clone of a scheduler other
/// than the common one is dropped the pool is shut down: queued tasks still
/// run, and workers exit once it is quiescent.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<Handle>,
}

static COMMON: OnceLock<Scheduler> = OnceLock::new();

/// The pool of the common scheduler, created on first use.
pub(crate) fn common_pool() -> &'static Arc<Pool> {
    &Scheduler::common().handle.pool
}

impl Scheduler {
    /// Create a scheduler with the given parallelism.
    ///
    /// # Panics
    ///
    /// Panics if `parallelism` is zero or above
    /// [`MAX_PARALLELISM`](crate::MAX_PARALLELISM).
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self::with_config(SchedulerConfig::with_parallelism(parallelism))
    }

    /// Create a scheduler with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; see
    /// [`try_with_config`](Self::try_with_config).
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        match Self::try_with_config(config) {
            Ok(scheduler) => scheduler,
            Err(err) => panic!("invalid scheduler configuration: {err}"),
        }
    }

    /// Create a scheduler, checking the configuration first.
    pub fn try_with_config(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_pool(Pool::new(config, false)))
    }

    /// Create a scheduler with one worker per available core.
    #[must_use]
    pub fn with_default_config() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    fn from_pool(pool: Arc<Pool>) -> Self {
        Self {
            handle: Arc::new(Handle { pool }),
        }
    }

    /// The process-wide scheduler used by [`Task::fork`] outside workers and
    /// by default for asynchronous stages.
    ///
    /// It is created on first use from [`SchedulerConfig::from_env`] and
    /// ignores shutdown requests. Its workers retire when idle.
    pub fn common() -> &'static Scheduler {
        COMMON.get_or_init(|| {
            let config = SchedulerConfig::from_env();
            tracing::debug!(parallelism = config.parallelism, "starting common scheduler");
            Self::from_pool(Pool::new(config, true))
        })
    }

    fn pool(&self) -> &Arc<Pool> {
        &self.handle.pool
    }

    /// Identifier of this scheduler in trace events and logs.
    #[must_use]
    pub fn id(&self) -> PoolId {
        self.pool().id()
    }

    /// Whether this is the common scheduler.
    #[must_use]
    pub fn is_common(&self) -> bool {
        self.pool().is_common()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Run `f` asynchronously and return its task.
    pub fn spawn<F, T>(&self, f: F) -> Result<Task<T>, RejectedError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = Task::once(f);
        self.submit(&task)?;
        Ok(task)
    }

    /// Queue `task` for asynchronous execution.
    pub fn submit<T: Send + 'static>(&self, task: &Task<T>) -> Result<(), RejectedError> {
        self.pool().external_push(task.job()).map_err(|err| {
            tracing::debug!(pool = %self.id(), %err, "submission rejected");
            err
        })
    }

    /// Queue a counted completer for asynchronous execution.
    pub fn submit_completer(&self, completer: &Completer) -> Result<(), RejectedError> {
        self.pool().external_push(completer.job())
    }

    /// Run a closure asynchronously. Nobody observes its outcome; panics are
    /// logged.
    pub fn execute<F>(&self, f: F) -> Result<(), RejectedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool().external_push(RunJob::new(Box::new(f)))
    }

    /// Submit `task` and wait for its result.
    pub fn invoke<T>(&self, task: &Task<T>) -> Result<T, TaskError>
    where
        T: Clone + Send + 'static,
    {
        self.submit(task)?;
        task.join()
    }

    /// Submit every closure, wait for all of them, and return their tasks.
    ///
    /// If a submission is rejected, the tasks already submitted are
    /// cancelled.
    pub fn invoke_all<I, F, T>(&self, fs: I) -> Result<Vec<Task<T>>, RejectedError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut tasks = Vec::new();
        for f in fs {
            let task = Task::once(f);
            if let Err(err) = self.submit(&task) {
                for t in &tasks {
                    Task::cancel(t);
                }
                return Err(err);
            }
            tasks.push(task);
        }
        for task in &tasks {
            join_status(&task.job(), None)?;
        }
        Ok(tasks)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting new tasks. Queued tasks still run, and workers exit
    /// once the pool is quiescent. Has no effect on the common scheduler.
    pub fn shutdown(&self) {
        self.pool().shutdown();
    }

    /// Stop accepting tasks, cancel queued ones, and ask running ones to
    /// stop via [`check_cancelled`](crate::check_cancelled). Has no effect on
    /// the common scheduler.
    pub fn shutdown_now(&self) {
        self.pool().shutdown_now();
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.pool().is_shutdown()
    }

    /// Whether every worker has exited after shutdown.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.pool().is_terminated()
    }

    /// Whether termination has begun but not completed.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.pool().is_terminating()
    }

    /// Whether no worker is active.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.pool().is_quiescent()
    }

    /// Block until terminated or `timeout` elapses. Returns whether the
    /// scheduler terminated.
    ///
    /// On the common scheduler this waits for quiescence instead and
    /// returns `false`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.pool().await_termination(timeout)
    }

    /// Wait until quiescent, running queued tasks on the calling thread.
    /// Returns `false` on timeout.
    pub fn await_quiescence(&self, timeout: Duration) -> bool {
        self.pool().await_quiescence(timeout)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Target number of active workers.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.pool().parallelism()
    }

    /// Whether local queues drain first-in-first-out.
    #[must_use]
    pub fn async_mode(&self) -> bool {
        self.pool().config().async_mode
    }

    /// Workers started and not yet exited.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool().pool_size()
    }

    /// Workers scanning for or running tasks.
    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.pool().active_thread_count()
    }

    /// Active workers not blocked waiting for joins or managed blocks.
    #[must_use]
    pub fn running_thread_count(&self) -> usize {
        self.pool().running_thread_count()
    }

    /// Tasks stolen across the life of the scheduler.
    #[must_use]
    pub fn steal_count(&self) -> u64 {
        self.pool().steal_count()
    }

    /// Tasks waiting in worker queues.
    #[must_use]
    pub fn queued_task_count(&self) -> usize {
        self.pool().queued_task_count()
    }

    /// Tasks submitted from outside and not yet started.
    #[must_use]
    pub fn queued_submission_count(&self) -> usize {
        self.pool().queued_submission_count()
    }

    /// Whether any submitted task has not started.
    #[must_use]
    pub fn has_queued_submissions(&self) -> bool {
        self.pool().has_queued_submissions()
    }

    /// Snapshot of the scheduler counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let pool = self.pool();
        SchedulerStats {
            parallelism: pool.parallelism(),
            pool_size: pool.pool_size(),
            active_threads: pool.active_thread_count(),
            running_threads: pool.running_thread_count(),
            steals: pool.steal_count(),
            queued_tasks: pool.queued_task_count(),
            queued_submissions: pool.queued_submission_count(),
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_terminated() {
            "Terminated"
        } else if self.is_terminating() {
            "Terminating"
        } else if self.is_shutdown() {
            "Shutting down"
        } else {
            "Running"
        };
        let stats = self.stats();
        write!(
            f,
            "{}[{state}, parallelism = {}, size = {}, active = {}, running = {}, steals = {}, tasks = {}, submissions = {}]",
            self.id(),
            stats.parallelism,
            stats.pool_size,
            stats.active_threads,
            stats.running_threads,
            stats.steals,
            stats.queued_tasks,
            stats.queued_submissions,
        )
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id())
            .field("common", &self.is_common())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Executors
// ============================================================================

/// Something that runs closures, typically on other threads.
pub trait Executor: Send + Sync {
    /// Arrange for `runnable` to run. Fails if it cannot be accepted.
    fn execute(&self, runnable: Runnable) -> Result<(), RejectedError>;
}

impl Executor for Scheduler {
    fn execute(&self, runnable: Runnable) -> Result<(), RejectedError> {
        self.pool().external_push(RunJob::new(runnable))
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, runnable: Runnable) -> Result<(), RejectedError> {
        (**self).execute(runnable)
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, runnable: Runnable) -> Result<(), RejectedError> {
        (**self).execute(runnable)
    }
}

/// Runs each closure on a fresh thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadPerTaskExecutor {
    name: Option<String>,
}

impl ThreadPerTaskExecutor {
    /// An executor whose threads carry `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Executor for ThreadPerTaskExecutor {
    fn execute(&self, runnable: Runnable) -> Result<(), RejectedError> {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        builder
            .spawn(runnable)
            .map(drop)
            .map_err(|err| RejectedError::Spawn(Arc::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_try_with_config_rejects_zero() {
        let err = Scheduler::try_with_config(SchedulerConfig::with_parallelism(0)).unwrap_err();
        assert!(matches!(err, ConfigError::Parallelism { got: 0, .. }));
    }

    #[test]
    fn test_spawn_and_join() {
        let scheduler = Scheduler::new(2);
        let task = scheduler.spawn(|| 6 * 7).unwrap();
        assert_eq!(task.join().unwrap(), 42);
    }

    #[test]
    fn test_execute_runs_closure() {
        let scheduler = Scheduler::new(2);
        let (tx, rx) = mpsc::channel();
        scheduler
            .execute(move || {
                tx.send(crate::in_worker()).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_invoke_all_returns_completed_tasks() {
        let scheduler = Scheduler::new(3);
        let tasks = scheduler
            .invoke_all((0..10).map(|i| move || i * i))
            .unwrap();
        let squares: Vec<_> = tasks.iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(squares, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_display_mentions_state() {
        let scheduler = Scheduler::new(1);
        assert!(scheduler.to_string().contains("Running"));
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(10)));
        assert!(scheduler.to_string().contains("Terminated"));
    }

    #[test]
    fn test_common_is_shared_and_ignores_shutdown() {
        let a = Scheduler::common();
        let b = Scheduler::common();
        assert_eq!(a.id(), b.id());
        assert!(a.is_common());
        a.shutdown();
        assert!(!a.is_shutdown());
    }

    #[test]
    fn test_thread_per_task_executor() {
        let runs = Arc::new(AtomicUsize::new(0));
        let executor = ThreadPerTaskExecutor::named("weft-test");
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let runs = runs.clone();
            let tx = tx.clone();
            executor
                .execute(Box::new(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tx.send(thread::current().name().map(str::to_owned)).unwrap();
                }))
                .unwrap();
        }
        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(name.as_deref(), Some("weft-test"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_dropping_last_handle_shuts_down() {
        let scheduler = Scheduler::new(1);
        let clone = scheduler.clone();
        drop(scheduler);
        assert!(!clone.is_shutdown());
        let pool = Arc::clone(clone.pool());
        drop(clone);
        assert!(pool.is_shutdown());
    }
}
