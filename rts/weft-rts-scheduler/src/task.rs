//! Tasks and their status word.
//!
//! A task runs at most once. Its status is a single `AtomicI32`:
//!
//! ```text
//!  31   28 27        17  16     15           0
//! +-------+------------+------+---------------+
//! | kind  |   unused   |SIGNAL|   user tag    |
//! +-------+------------+------+---------------+
//! ```
//!
//! The terminal kind is set exactly once by a CAS and makes the word
//! negative. `SIGNAL` records that some thread waits on the task's monitor
//! and must be notified on completion.

use crate::error::{RejectedError, TaskError};
use crate::pool::Pool;
use crate::{scheduler, worker};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub(crate) const DONE_MASK: i32 = 0xf000_0000_u32 as i32;
pub(crate) const NORMAL: i32 = 0xf000_0000_u32 as i32;
pub(crate) const CANCELLED: i32 = 0xc000_0000_u32 as i32;
pub(crate) const EXCEPTIONAL: i32 = 0x8000_0000_u32 as i32;
pub(crate) const SIGNAL: i32 = 0x0001_0000;
pub(crate) const TAG_MASK: i32 = 0x0000_ffff;

// ============================================================================
// Task Header
// ============================================================================

/// State shared by every kind of schedulable job.
pub(crate) struct TaskHeader {
    status: AtomicI32,
    monitor: Mutex<()>,
    completed: Condvar,
    /// Failure recorded before the status turns exceptional.
    failure: Mutex<Option<TaskError>>,
    /// Pool whose submission queue received this task from outside.
    home: Mutex<Option<Weak<Pool>>>,
}

impl TaskHeader {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicI32::new(0),
            monitor: Mutex::new(()),
            completed: Condvar::new(),
            failure: Mutex::new(None),
            home: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.status() < 0
    }

    /// Mark completion with the given kind, waking waiters.
    ///
    /// Returns the kind on success or the existing status if the task was
    /// already done.
    pub(crate) fn set_completion(&self, completion: i32) -> i32 {
        let mut s = self.status();
        loop {
            if s < 0 {
                return s;
            }
            match self.status.compare_exchange_weak(
                s,
                s | completion,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if s & SIGNAL != 0 {
                        let _guard = self.monitor.lock();
                        self.completed.notify_all();
                    }
                    return completion;
                }
                Err(current) => s = current,
            }
        }
    }

    /// Record a failure and complete exceptionally.
    ///
    /// Returns the terminal kind now held by the task.
    pub(crate) fn set_exceptional(&self, err: TaskError) -> i32 {
        let mut slot = self.failure.lock();
        let s = self.status();
        if s < 0 {
            return s & DONE_MASK;
        }
        *slot = Some(err);
        self.set_completion(EXCEPTIONAL) & DONE_MASK
    }

    pub(crate) fn failure(&self) -> Option<TaskError> {
        match self.status() & DONE_MASK {
            EXCEPTIONAL => self.failure.lock().clone(),
            CANCELLED => Some(TaskError::Cancelled),
            _ => None,
        }
    }

    /// Decode a terminal status.
    pub(crate) fn outcome(&self, s: i32) -> Result<(), TaskError> {
        match s & DONE_MASK {
            NORMAL => Ok(()),
            CANCELLED => Err(TaskError::Cancelled),
            // A reinitialize since `s` was read clears the slot.
            _ => Err(self.failure.lock().clone().unwrap_or(TaskError::Cancelled)),
        }
    }

    /// Block until done or `deadline` passes. Used by non-worker threads.
    pub(crate) fn wait_done(&self, deadline: Option<Instant>) -> i32 {
        loop {
            let s = self.status();
            if s < 0 {
                return s;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return s;
            }
            if self
                .status
                .compare_exchange(s, s | SIGNAL, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut guard = self.monitor.lock();
                if self.status() >= 0 {
                    match deadline {
                        Some(d) => {
                            self.completed.wait_until(&mut guard, d);
                        }
                        None => self.completed.wait(&mut guard),
                    }
                }
            }
        }
    }

    /// Wait once for completion. Used by workers after compensation.
    pub(crate) fn internal_wait(&self, timeout: Option<Duration>) {
        let s = self.status();
        if s >= 0
            && self
                .status
                .compare_exchange(s, s | SIGNAL, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let mut guard = self.monitor.lock();
            if self.status() >= 0 {
                match timeout {
                    Some(t) => {
                        self.completed.wait_for(&mut guard, t);
                    }
                    None => self.completed.wait(&mut guard),
                }
            } else {
                self.completed.notify_all();
            }
        }
    }

    pub(crate) fn reinitialize(&self) {
        *self.failure.lock() = None;
        self.status.store(0, Ordering::Release);
    }

    pub(crate) fn tag(&self) -> u16 {
        (self.status() & TAG_MASK) as u16
    }

    pub(crate) fn set_tag(&self, tag: u16) -> u16 {
        let mut s = self.status();
        loop {
            let next = (s & !TAG_MASK) | i32::from(tag);
            match self
                .status
                .compare_exchange_weak(s, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (s & TAG_MASK) as u16,
                Err(current) => s = current,
            }
        }
    }

    pub(crate) fn compare_and_set_tag(&self, expect: u16, tag: u16) -> bool {
        let mut s = self.status();
        loop {
            if (s & TAG_MASK) as u16 != expect {
                return false;
            }
            let next = (s & !TAG_MASK) | i32::from(tag);
            match self
                .status
                .compare_exchange_weak(s, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => s = current,
            }
        }
    }

    pub(crate) fn set_home(&self, pool: &Arc<Pool>) {
        *self.home.lock() = Some(Arc::downgrade(pool));
    }

    pub(crate) fn home(&self) -> Option<Arc<Pool>> {
        self.home.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for TaskHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.status();
        let state = match s & DONE_MASK {
            NORMAL => "completed",
            CANCELLED => "cancelled",
            EXCEPTIONAL => "failed",
            _ => "pending",
        };
        f.debug_struct("TaskHeader")
            .field("state", &state)
            .field("tag", &(s & TAG_MASK))
            .finish()
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Something a worker can execute.
pub(crate) trait Job: Send + Sync + 'static {
    fn header(&self) -> &TaskHeader;

    /// Run the body. Returns `true` if the job completed normally and its
    /// status should be set by the caller.
    fn exec(self: Arc<Self>) -> bool;

    /// Whether this job takes part in a counted-completion tree.
    fn is_completer(&self) -> bool {
        false
    }

    /// The completer this job reports to.
    fn completer_parent(&self) -> Option<JobRef> {
        None
    }

    /// Hook run after this job completes exceptionally.
    fn on_exceptional(&self, _err: &TaskError) {}
}

pub(crate) type JobRef = Arc<dyn Job>;

#[inline]
pub(crate) fn same_job(a: &JobRef, b: &JobRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Whether `job` is a completer whose parent chain reaches `root`.
pub(crate) fn rooted_at(job: &JobRef, root: &JobRef) -> bool {
    if !job.is_completer() {
        return false;
    }
    let mut current = job.clone();
    loop {
        if same_job(&current, root) {
            return true;
        }
        match current.completer_parent() {
            Some(parent) => current = parent,
            None => return false,
        }
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<JobRef>> = const { RefCell::new(None) };
}

/// Restores the previously running task when dropped.
struct RunningTask(Option<JobRef>);

impl RunningTask {
    fn enter(job: &JobRef) -> Self {
        Self(CURRENT_TASK.with(|c| c.borrow_mut().replace(job.clone())))
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        let prev = self.0.take();
        CURRENT_TASK.with(|c| *c.borrow_mut() = prev);
    }
}

/// Record a failure on `job` and run its exceptional hook.
pub(crate) fn record_failure(job: &dyn Job, err: TaskError) -> i32 {
    let hook = err.clone();
    let s = job.header().set_exceptional(err);
    if s == EXCEPTIONAL {
        job.on_exceptional(&hook);
    }
    s
}

/// Run `job` if it is not done yet. Panics become exceptional completion.
///
/// Returns the status after running, negative if the job is done.
pub(crate) fn do_exec(job: &JobRef) -> i32 {
    let header = job.header();
    let mut s = header.status();
    if s >= 0 {
        let _running = RunningTask::enter(job);
        let runnable = job.clone();
        match panic::catch_unwind(AssertUnwindSafe(move || runnable.exec())) {
            Ok(true) => s = header.set_completion(NORMAL),
            Ok(false) => s = header.status(),
            Err(payload) => s = record_failure(job.as_ref(), TaskError::from_panic(payload)),
        }
    }
    s
}

/// Cancel a job, ignoring anything it might raise.
pub(crate) fn cancel_ignoring(job: &JobRef) {
    if job.header().status() >= 0 {
        job.header().set_completion(CANCELLED);
    }
}

/// Check whether the running task has been cancelled, or whether its
/// worker was interrupted by `shutdown_now`.
///
/// Tasks may call this in long loops to stop early. Cancellation is
/// cooperative: nothing interrupts a running body.
#[must_use]
pub fn check_cancelled() -> bool {
    let cancelled = CURRENT_TASK.with(|c| {
        c.borrow()
            .as_ref()
            .is_some_and(|job| job.header().status() & DONE_MASK == CANCELLED)
    });
    cancelled || worker::with_current(|ctx| ctx.is_some_and(|w| w.queue.is_interrupted()))
}

/// Push `job` on the current worker's queue, or submit it to the common
/// scheduler when called from outside a worker.
pub(crate) fn fork_job(job: &JobRef) {
    let pushed = worker::with_current(|ctx| ctx.map(|w| w.pool.push_local(&w.queue, job.clone())));
    let result = match pushed {
        Some(result) => result,
        None => scheduler::common_pool().external_push(job.clone()),
    };
    if let Err(err) = result {
        tracing::warn!(%err, "fork rejected");
        record_failure(job.as_ref(), TaskError::Rejected(err));
    }
}

/// Wait until `job` is done or `deadline` passes, helping where possible.
pub(crate) fn join_status(job: &JobRef, deadline: Option<Instant>) -> Result<i32, RejectedError> {
    let s = job.header().status();
    if s < 0 {
        return Ok(s);
    }
    worker::with_current(|ctx| match ctx {
        Some(w) => {
            if deadline.is_none() && w.queue.try_unpush(job) {
                let s = do_exec(job);
                if s < 0 {
                    return Ok(s);
                }
            }
            w.pool.await_join(&w.queue, job, deadline)
        }
        None => Ok(external_await_done(job, deadline)),
    })
}

fn external_await_done(job: &JobRef, deadline: Option<Instant>) -> i32 {
    let header = job.header();
    let mut s = header.status();
    if s >= 0 {
        if let Some(pool) = header.home() {
            if job.is_completer() {
                s = pool.external_help_complete(job, 0);
            } else if pool.try_external_unpush(job) {
                s = do_exec(job);
            }
        }
    }
    if s >= 0 {
        s = header.wait_done(deadline);
    }
    s
}

/// Run `job` on the calling thread, then wait for it.
pub(crate) fn invoke_status(job: &JobRef) -> Result<i32, RejectedError> {
    let s = do_exec(job);
    if s < 0 {
        return Ok(s);
    }
    join_status(job, None)
}

/// Remove `job` from the queue it was forked to, if it is still on top.
pub(crate) fn try_unfork(job: &JobRef) -> bool {
    let local = worker::with_current(|ctx| ctx.map(|w| w.queue.try_unpush(job)));
    match local {
        Some(unpushed) => unpushed,
        None => job
            .header()
            .home()
            .is_some_and(|pool| pool.try_external_unpush(job)),
    }
}

// ============================================================================
// Value Tasks
// ============================================================================

enum Body<T> {
    Repeatable(Box<dyn FnMut() -> T + Send>),
    Once(Option<Box<dyn FnOnce() -> T + Send>>),
}

struct TaskCell<T> {
    header: TaskHeader,
    body: Mutex<Body<T>>,
    result: Mutex<Option<T>>,
}

impl<T: Send + 'static> TaskCell<T> {
    /// Store `value` and complete normally unless already done.
    fn finish(&self, value: T) -> bool {
        let mut slot = self.result.lock();
        if self.header.is_done() {
            return false;
        }
        *slot = Some(value);
        self.header.set_completion(NORMAL);
        true
    }
}

impl<T: Send + 'static> Job for TaskCell<T> {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn exec(self: Arc<Self>) -> bool {
        let value = {
            let mut body = self.body.lock();
            match &mut *body {
                Body::Repeatable(f) => f(),
                Body::Once(f) => {
                    let f = f.take();
                    drop(body);
                    match f {
                        Some(f) => f(),
                        None => panic!("task body already consumed"),
                    }
                }
            }
        };
        self.finish(value);
        false
    }
}

/// A unit of fork/join work producing a `T`.
///
/// Handles are cheap to clone; all clones refer to the same task.
///
/// # Example
///
/// ```ignore
/// let left = Task::new(|| fib(n - 1));
/// left.fork();
/// let right = fib(n - 2);
/// left.join()? + right
/// ```
pub struct Task<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Create a task from a body that may run again after `reinitialize`.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::with_body(Body::Repeatable(Box::new(f)))
    }

    /// Create a task from a body that runs at most once.
    ///
    /// Reinitializing and re-running such a task completes it with
    /// [`TaskError::Panicked`].
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::with_body(Body::Once(Some(Box::new(f))))
    }

    fn with_body(body: Body<T>) -> Self {
        Self {
            cell: Arc::new(TaskCell {
                header: TaskHeader::new(),
                body: Mutex::new(body),
                result: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn job(&self) -> JobRef {
        self.cell.clone()
    }

    /// Arrange to run this task asynchronously.
    ///
    /// On a worker thread the task goes on that worker's queue; elsewhere it
    /// is submitted to the common scheduler. Forking the same task twice
    /// without completing and reinitializing it in between is an error.
    /// If the task cannot be queued it completes with [`TaskError::Rejected`].
    pub fn fork(&self) -> &Self {
        fork_job(&self.job());
        self
    }

    /// Wait for the task and return its value.
    ///
    /// A worker thread helps run other tasks while it waits. Cyclic joins
    /// deadlock and are not detected.
    pub fn join(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let s = join_status(&self.job(), None)?;
        self.report(s)
    }

    /// Run the task on the calling thread and return its value.
    pub fn invoke(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let s = invoke_status(&self.job())?;
        self.report(s)
    }

    /// Wait for the task without reporting its outcome.
    pub fn quietly_join(&self) {
        let _ = join_status(&self.job(), None);
    }

    /// Run the task without reporting its outcome.
    pub fn quietly_invoke(&self) {
        let _ = invoke_status(&self.job());
    }

    /// Wait at most `timeout` for the task.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let deadline = Instant::now().checked_add(timeout);
        let s = join_status(&self.job(), deadline)?;
        if s >= 0 {
            return Err(TaskError::Timeout);
        }
        self.report(s)
    }

    fn report(&self, s: i32) -> Result<T, TaskError>
    where
        T: Clone,
    {
        self.cell.header.outcome(s)?;
        // Missing only if the task was reinitialized after `s` was read.
        self.cell.result.lock().clone().ok_or(TaskError::Cancelled)
    }

    /// Cancel the task if it has not completed.
    ///
    /// Returns `true` if the task is now cancelled. A running body keeps
    /// running; see [`check_cancelled`].
    pub fn cancel(&self) -> bool {
        self.cell.header.set_completion(CANCELLED) & DONE_MASK == CANCELLED
    }

    /// Complete the task with `value` unless it is already done.
    pub fn complete(&self, value: T) {
        self.cell.finish(value);
    }

    /// Complete the task with a failure unless it is already done.
    pub fn complete_exceptionally<E>(&self, err: E)
    where
        E: Error + Send + Sync + 'static,
    {
        record_failure(self.cell.as_ref(), TaskError::failed(err));
    }

    /// Reset the task so it can be forked again.
    ///
    /// The caller must ensure no other thread is still joining it.
    pub fn reinitialize(&self) {
        let mut slot = self.cell.result.lock();
        *slot = None;
        self.cell.header.reinitialize();
    }

    /// Try to take back a task this thread forked and that has not started.
    pub fn try_unfork(&self) -> bool {
        try_unfork(&self.job())
    }

    /// The value of a normally completed task.
    pub fn raw_result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.cell.result.lock().clone()
    }

    /// The failure of an abnormally completed task.
    pub fn failure(&self) -> Option<TaskError> {
        self.cell.header.failure()
    }

    /// Whether the task completed in any way.
    pub fn is_done(&self) -> bool {
        self.cell.header.is_done()
    }

    /// Whether the task was cancelled before completing.
    pub fn is_cancelled(&self) -> bool {
        self.cell.header.status() & DONE_MASK == CANCELLED
    }

    /// Whether the task completed without failure or cancellation.
    pub fn is_completed_normally(&self) -> bool {
        self.cell.header.status() & DONE_MASK == NORMAL
    }

    /// Whether the task failed or was cancelled.
    pub fn is_completed_abnormally(&self) -> bool {
        self.cell.header.status() < NORMAL
    }

    /// The 16-bit user tag.
    pub fn tag(&self) -> u16 {
        self.cell.header.tag()
    }

    /// Replace the user tag, returning the previous one.
    pub fn set_tag(&self, tag: u16) -> u16 {
        self.cell.header.set_tag(tag)
    }

    /// Replace the user tag if it equals `expect`.
    pub fn compare_and_set_tag(&self, expect: u16, tag: u16) -> bool {
        self.cell.header.compare_and_set_tag(expect, tag)
    }

    /// Fork all but the first task, invoke the first, then join the rest.
    ///
    /// The first failure is returned and the remaining tasks are cancelled.
    pub fn invoke_all(tasks: &[Task<T>]) -> Result<(), TaskError> {
        let Some((first, rest)) = tasks.split_first() else {
            return Ok(());
        };
        for task in rest.iter().rev() {
            task.fork();
        }
        let mut failure = None;
        let job = first.job();
        let s = invoke_status(&job)?;
        if let Err(err) = first.cell.header.outcome(s) {
            failure = Some(err);
        }
        for task in rest {
            if failure.is_some() {
                task.cancel();
            } else {
                let s = join_status(&task.job(), None)?;
                if let Err(err) = task.cell.header.outcome(s) {
                    failure = Some(err);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("header", &self.cell.header)
            .finish_non_exhaustive()
    }
}

/// Fork `b`, invoke `a`, then join `b`.
pub fn invoke_both<A, B>(a: &Task<A>, b: &Task<B>) -> Result<(A, B), TaskError>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    b.fork();
    let left = a.invoke()?;
    let right = b.join()?;
    Ok((left, right))
}

// ============================================================================
// Fire-and-forget Jobs
// ============================================================================

/// A boxed closure handed to an executor.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// A submitted closure nobody joins. Panics are logged.
pub(crate) struct RunJob {
    header: TaskHeader,
    body: Mutex<Option<Runnable>>,
}

impl RunJob {
    pub(crate) fn new(runnable: Runnable) -> JobRef {
        Arc::new(Self {
            header: TaskHeader::new(),
            body: Mutex::new(Some(runnable)),
        })
    }
}

impl Job for RunJob {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn exec(self: Arc<Self>) -> bool {
        let Some(runnable) = self.body.lock().take() else {
            return true;
        };
        match panic::catch_unwind(AssertUnwindSafe(runnable)) {
            Ok(()) => true,
            Err(payload) => {
                let err = TaskError::from_panic(payload);
                tracing::error!(error = %err, "submitted job panicked");
                self.header.set_exceptional(err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("bad input")]
    struct BadInput;

    #[test]
    fn test_status_kinds_are_negative_and_ordered() {
        assert!(NORMAL < 0 && CANCELLED < 0 && EXCEPTIONAL < 0);
        assert!(CANCELLED < NORMAL && EXCEPTIONAL < NORMAL);
        assert_eq!(NORMAL & DONE_MASK, NORMAL);
        assert_eq!((CANCELLED | SIGNAL | 0x7) & DONE_MASK, CANCELLED);
    }

    #[test]
    fn test_set_completion_is_one_shot() {
        let header = TaskHeader::new();
        assert_eq!(header.set_completion(NORMAL), NORMAL);
        assert_eq!(header.set_completion(CANCELLED) & DONE_MASK, NORMAL);
        assert!(header.is_done());
        assert!(header.outcome(header.status()).is_ok());
    }

    #[test]
    fn test_set_exceptional_records_failure() {
        let header = TaskHeader::new();
        assert_eq!(header.set_exceptional(TaskError::failed(BadInput)), EXCEPTIONAL);
        match header.outcome(header.status()) {
            Err(TaskError::Failed(cause)) => assert_eq!(cause.to_string(), "bad input"),
            other => panic!("unexpected {other:?}"),
        }
        header.reinitialize();
        assert_eq!(header.status(), 0);
        assert!(header.failure().is_none());
    }

    #[test]
    fn test_outcome_read_across_reinitialize() {
        let header = TaskHeader::new();
        header.set_exceptional(TaskError::failed(BadInput));
        let s = header.status();
        header.reinitialize();
        assert!(matches!(header.outcome(s), Err(TaskError::Cancelled)));

        let task = Task::new(|| 5);
        assert_eq!(task.invoke().unwrap(), 5);
        let s = task.cell.header.status();
        task.reinitialize();
        assert!(matches!(task.report(s), Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_tags_survive_completion() {
        let header = TaskHeader::new();
        assert_eq!(header.set_tag(7), 0);
        assert!(header.compare_and_set_tag(7, 9));
        assert!(!header.compare_and_set_tag(7, 11));
        header.set_completion(NORMAL);
        assert_eq!(header.tag(), 9);
    }

    #[test]
    fn test_invoke_runs_inline() {
        let task = Task::new(|| 6 * 7);
        assert_eq!(task.invoke().unwrap(), 42);
        assert!(task.is_completed_normally());
        assert_eq!(task.raw_result(), Some(42));
    }

    #[test]
    fn test_cancel_before_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Task::new(move || counter.fetch_add(1, Ordering::SeqCst));
        assert!(task.cancel());
        assert!(task.is_cancelled());
        assert!(task.is_completed_abnormally());
        assert!(matches!(task.join(), Err(TaskError::Cancelled)));
        assert!(matches!(task.invoke(), Err(TaskError::Cancelled)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let task = Task::new(|| 1);
        task.invoke().unwrap();
        assert!(!task.cancel());
        assert!(!task.is_cancelled());
        assert_eq!(task.join().unwrap(), 1);
    }

    #[test]
    fn test_panic_is_captured() {
        let task: Task<u32> = Task::new(|| panic!("boom"));
        match task.invoke() {
            Err(TaskError::Panicked(msg)) => assert_eq!(&*msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(task.is_completed_abnormally());
        assert!(matches!(task.failure(), Some(TaskError::Panicked(_))));
    }

    #[test]
    fn test_complete_and_complete_exceptionally() {
        let task = Task::new(|| 0);
        task.complete(5);
        task.complete_exceptionally(BadInput);
        assert_eq!(task.join().unwrap(), 5);

        let failing = Task::new(|| 0);
        failing.complete_exceptionally(BadInput);
        failing.complete(5);
        assert!(matches!(failing.join(), Err(TaskError::Failed(_))));
    }

    #[test]
    fn test_reinitialize_allows_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = Task::new(move || counter.fetch_add(1, Ordering::SeqCst) + 1);
        assert_eq!(task.invoke().unwrap(), 1);
        task.reinitialize();
        assert!(!task.is_done());
        assert!(task.raw_result().is_none());
        assert_eq!(task.invoke().unwrap(), 2);
    }

    #[test]
    fn test_once_body_cannot_rerun() {
        let task = Task::once(|| String::from("done"));
        assert_eq!(task.invoke().unwrap(), "done");
        task.reinitialize();
        assert!(matches!(task.invoke(), Err(TaskError::Panicked(_))));
    }

    #[test]
    fn test_get_timeout_on_unforked_task_times_out() {
        let task = Task::new(|| 1);
        let start = Instant::now();
        assert!(matches!(
            task.get_timeout(Duration::from_millis(30)),
            Err(TaskError::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_external_waiter_is_woken() {
        let task = Task::new(|| 0_u64);
        let remote = task.clone();
        let handle = std::thread::spawn(move || remote.join());
        std::thread::sleep(Duration::from_millis(20));
        task.complete(99);
        assert_eq!(handle.join().unwrap().unwrap(), 99);
    }

    #[test]
    fn test_check_cancelled_outside_task() {
        assert!(!check_cancelled());
    }

    #[test]
    fn test_check_cancelled_sees_own_cancellation() {
        let slot: Arc<Mutex<Option<Task<()>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let me = slot.clone();
        let flag = seen.clone();
        let task = Task::new(move || {
            if let Some(this) = me.lock().as_ref() {
                this.cancel();
            }
            flag.store(check_cancelled(), Ordering::SeqCst);
        });
        *slot.lock() = Some(task.clone());
        assert!(matches!(task.invoke(), Err(TaskError::Cancelled)));
        assert!(seen.load(Ordering::SeqCst));
        *slot.lock() = None;
    }
}
