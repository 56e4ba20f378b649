//! Counted completers: tasks that finish when their pending children do.
//!
//! A completer carries a pending count and an optional parent. Instead of
//! joining children, a computation forks them, bumps its pending count, and
//! returns. Each finishing child calls [`Completer::try_complete`], which
//! decrements the first nonzero pending count up the parent chain, running
//! completion hooks on the way, and completes the root when every count
//! reaches zero.
//!
//! Joining a completer never walks steal chains; the joiner instead runs
//! queued tasks belonging to the same completion tree.

use crate::error::TaskError;
use crate::task::{
    fork_job, invoke_status, join_status, record_failure, Job, JobRef, TaskHeader, CANCELLED,
    DONE_MASK, NORMAL,
};
use crate::{scheduler, worker};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

type Compute = Box<dyn FnMut(&Completer) + Send>;
type Hook = Box<dyn Fn(&Completer, &Completer) + Send + Sync>;

struct CompleterCell {
    header: TaskHeader,
    pending: AtomicI32,
    parent: Option<Completer>,
    compute: Mutex<Compute>,
    on_completion: Mutex<Option<Hook>>,
}

impl Job for CompleterCell {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn exec(self: Arc<Self>) -> bool {
        let handle = Completer { cell: self };
        let mut compute = handle.cell.compute.lock();
        compute(&handle);
        false
    }

    fn is_completer(&self) -> bool {
        true
    }

    fn completer_parent(&self) -> Option<JobRef> {
        self.parent.as_ref().map(Completer::job)
    }

    fn on_exceptional(&self, err: &TaskError) {
        if let Some(parent) = &self.parent {
            if !parent.is_done() {
                record_failure(parent.cell.as_ref(), err.clone());
            }
        }
    }
}

/// A task in a counted-completion tree.
///
/// Handles are cheap to clone; all clones refer to the same completer.
#[derive(Clone)]
pub struct Completer {
    cell: Arc<CompleterCell>,
}

impl Completer {
    /// Create a root completer.
    pub fn new<F>(compute: F) -> Self
    where
        F: FnMut(&Completer) + Send + 'static,
    {
        Self::build(None, 0, Box::new(compute))
    }

    /// Create a completer reporting to `parent`.
    pub fn child<F>(parent: &Completer, compute: F) -> Self
    where
        F: FnMut(&Completer) + Send + 'static,
    {
        Self::build(Some(parent.clone()), 0, Box::new(compute))
    }

    /// Create a completer reporting to `parent` with an initial pending count.
    pub fn child_with_pending<F>(parent: &Completer, pending: i32, compute: F) -> Self
    where
        F: FnMut(&Completer) + Send + 'static,
    {
        Self::build(Some(parent.clone()), pending, Box::new(compute))
    }

    fn build(parent: Option<Completer>, pending: i32, compute: Compute) -> Self {
        Self {
            cell: Arc::new(CompleterCell {
                header: TaskHeader::new(),
                pending: AtomicI32::new(pending),
                parent,
                compute: Mutex::new(compute),
                on_completion: Mutex::new(None),
            }),
        }
    }

    /// Install a hook run when this completer's pending count is found at
    /// zero during [`try_complete`](Self::try_complete), or on
    /// [`complete`](Self::complete).
    ///
    /// The hook receives this completer and the one whose completion
    /// triggered it.
    #[must_use]
    pub fn on_completion<F>(self, hook: F) -> Self
    where
        F: Fn(&Completer, &Completer) + Send + Sync + 'static,
    {
        *self.cell.on_completion.lock() = Some(Box::new(hook));
        self
    }

    pub(crate) fn job(&self) -> JobRef {
        self.cell.clone()
    }

    fn run_on_completion(&self, caller: &Completer) {
        if let Some(hook) = self.cell.on_completion.lock().as_ref() {
            hook(self, caller);
        }
    }

    fn quietly_complete(&self) {
        self.cell.header.set_completion(NORMAL);
    }

    // ========================================================================
    // Tree Navigation
    // ========================================================================

    /// The completer this one reports to.
    #[must_use]
    pub fn parent(&self) -> Option<&Completer> {
        self.cell.parent.as_ref()
    }

    /// The root of this completer's tree.
    #[must_use]
    pub fn root(&self) -> Completer {
        let mut a = self.clone();
        while let Some(p) = a.cell.parent.clone() {
            a = p;
        }
        a
    }

    // ========================================================================
    // Pending Count
    // ========================================================================

    /// Current pending count.
    #[must_use]
    pub fn pending_count(&self) -> i32 {
        self.cell.pending.load(Ordering::Acquire)
    }

    /// Set the pending count.
    pub fn set_pending_count(&self, count: i32) {
        self.cell.pending.store(count, Ordering::Release);
    }

    /// Atomically add `delta` to the pending count.
    pub fn add_to_pending_count(&self, delta: i32) {
        self.cell.pending.fetch_add(delta, Ordering::AcqRel);
    }

    /// Set the pending count to `count` if it equals `expect`.
    pub fn compare_and_set_pending_count(&self, expect: i32, count: i32) -> bool {
        self.cell
            .pending
            .compare_exchange(expect, count, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Decrement the pending count unless it is zero. Returns the count
    /// seen before.
    pub fn decrement_pending_count_unless_zero(&self) -> i32 {
        let mut c = self.pending_count();
        while c != 0 {
            match self.cell.pending.compare_exchange(
                c,
                c - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => c = current,
            }
        }
        c
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Decrement the pending count, or if it is zero, run the completion
    /// hook and repeat on the parent. The root completes once its count is
    /// found at zero.
    pub fn try_complete(&self) {
        self.walk_completion(true);
    }

    /// Like [`try_complete`](Self::try_complete) without running hooks.
    pub fn propagate_completion(&self) {
        self.walk_completion(false);
    }

    fn walk_completion(&self, hooks: bool) {
        let mut a = self.clone();
        let mut s = self.clone();
        loop {
            let c = a.pending_count();
            if c == 0 {
                if hooks {
                    a.run_on_completion(&s);
                }
                let Some(parent) = a.cell.parent.clone() else {
                    a.quietly_complete();
                    return;
                };
                s = a;
                a = parent;
            } else if a.compare_and_set_pending_count(c, c - 1) {
                return;
            }
        }
    }

    /// Complete regardless of the pending count, run the hook, and then
    /// [`try_complete`](Self::try_complete) the parent.
    pub fn complete(&self) {
        self.run_on_completion(self);
        self.quietly_complete();
        if let Some(parent) = &self.cell.parent {
            parent.try_complete();
        }
    }

    /// Complete the root of this tree normally.
    pub fn quietly_complete_root(&self) {
        self.root().quietly_complete();
    }

    /// Complete with a failure; the failure propagates to every incomplete
    /// ancestor.
    pub fn complete_exceptionally<E>(&self, err: E)
    where
        E: Error + Send + Sync + 'static,
    {
        record_failure(self.cell.as_ref(), TaskError::failed(err));
    }

    /// Cancel the completer if it has not completed.
    pub fn cancel(&self) -> bool {
        self.cell.header.set_completion(CANCELLED) & DONE_MASK == CANCELLED
    }

    /// Run tasks of this completer's tree, at most `max_tasks` of them, while
    /// it is incomplete.
    pub fn help_complete(&self, max_tasks: i32) {
        if max_tasks <= 0 || self.is_done() {
            return;
        }
        let job = self.job();
        let own = worker::with_current(|ctx| ctx.map(|w| (Arc::clone(&w.pool), Arc::clone(&w.queue))));
        match own {
            Some((pool, queue)) => {
                pool.help_complete(&queue, &job, max_tasks);
            }
            None => {
                let pool = self
                    .cell
                    .header
                    .home()
                    .unwrap_or_else(|| Arc::clone(scheduler::common_pool()));
                pool.external_help_complete(&job, max_tasks);
            }
        }
    }

    // ========================================================================
    // Fork / Join
    // ========================================================================

    /// Arrange to run this completer asynchronously.
    pub fn fork(&self) -> &Self {
        fork_job(&self.job());
        self
    }

    /// Wait for the completer, running tasks of its tree meanwhile.
    pub fn join(&self) -> Result<(), TaskError> {
        let s = join_status(&self.job(), None)?;
        self.cell.header.outcome(s)
    }

    /// Run the completer on the calling thread, then wait for its tree.
    pub fn invoke(&self) -> Result<(), TaskError> {
        let s = invoke_status(&self.job())?;
        self.cell.header.outcome(s)
    }

    /// Wait for the completer without reporting its outcome.
    pub fn quietly_join(&self) {
        let _ = join_status(&self.job(), None);
    }

    /// Whether the completer completed in any way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.header.is_done()
    }

    /// Whether the completer completed without failure or cancellation.
    #[must_use]
    pub fn is_completed_normally(&self) -> bool {
        self.cell.header.status() & DONE_MASK == NORMAL
    }

    /// Whether the completer failed or was cancelled.
    #[must_use]
    pub fn is_completed_abnormally(&self) -> bool {
        self.cell.header.status() < NORMAL
    }

    /// Whether the completer was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cell.header.status() & DONE_MASK == CANCELLED
    }

    /// The failure of an abnormally completed completer.
    #[must_use]
    pub fn failure(&self) -> Option<TaskError> {
        self.cell.header.failure()
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("header", &self.cell.header)
            .field("pending", &self.pending_count())
            .field("has_parent", &self.cell.parent.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("leaf failed")]
    struct LeafFailed;

    #[test]
    fn test_root_completes_when_count_reaches_zero() {
        let root = Completer::new(|_| {});
        root.set_pending_count(2);
        root.try_complete();
        assert_eq!(root.pending_count(), 1);
        assert!(!root.is_done());
        root.try_complete();
        assert_eq!(root.pending_count(), 0);
        assert!(!root.is_done());
        root.try_complete();
        assert!(root.is_completed_normally());
    }

    #[test]
    fn test_hooks_run_up_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let root = Completer::new(|_| {}).on_completion(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let child = Completer::child(&root, |_| {});
        child.try_complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(root.is_done());
        // Only the root is marked complete.
        assert!(!child.is_done());
    }

    #[test]
    fn test_propagate_skips_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let root = Completer::new(|_| {}).on_completion(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        Completer::child(&root, |_| {}).propagate_completion();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(root.is_done());
    }

    #[test]
    fn test_failure_propagates_to_ancestors() {
        let root = Completer::new(|_| {});
        let mid = Completer::child(&root, |_| {});
        let leaf = Completer::child(&mid, |_| {});
        leaf.complete_exceptionally(LeafFailed);
        assert!(leaf.is_completed_abnormally());
        assert!(mid.is_completed_abnormally());
        assert!(matches!(root.failure(), Some(TaskError::Failed(_))));
    }

    #[test]
    fn test_decrement_unless_zero() {
        let c = Completer::new(|_| {});
        c.set_pending_count(1);
        assert_eq!(c.decrement_pending_count_unless_zero(), 1);
        assert_eq!(c.decrement_pending_count_unless_zero(), 0);
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn test_invoke_inline_tree() {
        let sum = Arc::new(AtomicUsize::new(0));
        let total = sum.clone();
        let root = Completer::new(move |me| {
            me.set_pending_count(3);
            for i in 1..=3 {
                let total = total.clone();
                let leaf = Completer::child(me, move |leaf| {
                    total.fetch_add(i, Ordering::SeqCst);
                    leaf.try_complete();
                });
                // Leaves never complete themselves, so run rather than invoke.
                crate::task::do_exec(&leaf.job());
                assert!(!leaf.is_done());
            }
            me.try_complete();
        });
        root.invoke().unwrap();
        assert_eq!(sum.load(Ordering::SeqCst), 6);
        assert!(root.is_completed_normally());
        assert_eq!(root.root().pending_count(), 0);
    }
}
