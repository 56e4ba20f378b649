//! The lock-free stack of dependents waiting on a stage, and the drain that
//! fires them once the stage completes.
//!
//! Each stage keeps a Treiber stack of completions. Nodes are reclaimed
//! through `crossbeam::epoch`, which also rules out ABA on the head. A
//! completion may sit on two stacks at once (a two-input dependent is pushed
//! on both sources); each stack holds its own node pointing at the shared
//! completion.

use crate::error::StageError;
use crossbeam::epoch::{self, Atomic, Owned, Shared};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// How a completion is being fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// From the thread that registered it or completed a source.
    Sync,
    /// On an executor, after a claim handed it over.
    Async,
    /// From inside a drain. Further draining is left to the caller.
    Nested,
}

/// A dependent action, relay or waiter registered on a stage.
pub(crate) trait Completion: Send + Sync {
    /// Try to run. Returns a completed dependent whose own stack still needs
    /// draining, when `mode` is [`Mode::Nested`].
    fn try_fire(self: Arc<Self>, mode: Mode) -> Option<Arc<dyn StageCore>>;

    /// Whether this completion may still do anything.
    fn is_live(&self) -> bool;
}

/// The type-erased part of a stage that the drain works on.
pub(crate) trait StageCore: Send + Sync {
    fn stack(&self) -> &CompletionStack;

    fn is_done(&self) -> bool;

    /// The stored failure, if the stage completed exceptionally.
    fn failure(&self) -> Option<StageError>;
}

struct Node {
    completion: Arc<dyn Completion>,
    next: Atomic<Node>,
}

/// Treiber stack of completions.
pub(crate) struct CompletionStack {
    head: Atomic<Node>,
}

impl CompletionStack {
    pub(crate) const fn new() -> Self {
        Self { head: Atomic::null() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }

    /// Push `completion` as long as `proceed` holds. Returns whether it was
    /// pushed.
    pub(crate) fn push_while(
        &self,
        completion: Arc<dyn Completion>,
        proceed: impl Fn() -> bool,
    ) -> bool {
        let guard = epoch::pin();
        let mut node = Owned::new(Node {
            completion,
            next: Atomic::null(),
        });
        loop {
            if !proceed() {
                return false;
            }
            let head = self.head.load(Ordering::Acquire, &guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, &guard)
            {
                Ok(_) => return true,
                Err(err) => node = err.new,
            }
        }
    }

    /// Push unconditionally.
    pub(crate) fn push(&self, completion: Arc<dyn Completion>) {
        self.push_while(completion, || true);
    }

    /// Pop the head. The flag reports whether more nodes followed it.
    pub(crate) fn pop(&self) -> Option<(Arc<dyn Completion>, bool)> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: nodes are only freed through the guard after unlinking.
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Ordering::Acquire, &guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                let completion = Arc::clone(&node.completion);
                // SAFETY: unlinked by the successful CAS above, exactly once.
                unsafe { guard.defer_destroy(head) };
                return Some((completion, !next.is_null()));
            }
        }
    }

    /// Detach every node at once.
    fn take_all(&self) -> Vec<Arc<dyn Completion>> {
        let guard = epoch::pin();
        let mut cur = self.head.swap(Shared::null(), Ordering::AcqRel, &guard);
        let mut taken = Vec::new();
        // SAFETY: the swap made this chain unreachable from the head, so only
        // this thread frees it; readers that loaded it earlier are pinned.
        while let Some(node) = unsafe { cur.as_ref() } {
            taken.push(Arc::clone(&node.completion));
            let next = node.next.load(Ordering::Acquire, &guard);
            unsafe { guard.defer_destroy(cur) };
            cur = next;
        }
        taken
    }

    /// Detach and drop every node.
    pub(crate) fn clear(&self) {
        drop(self.take_all());
    }

    /// Number of live completions.
    pub(crate) fn live_count(&self) -> usize {
        let guard = epoch::pin();
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire, &guard);
        // SAFETY: pinned; nodes reachable from the head are not yet freed.
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.completion.is_live() {
                count += 1;
            }
            cur = node.next.load(Ordering::Acquire, &guard);
        }
        count
    }
}

impl Drop for CompletionStack {
    fn drop(&mut self) {
        // SAFETY: exclusive access, no other thread can observe the nodes.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

fn same_stage(a: &Arc<dyn StageCore>, b: &Arc<dyn StageCore>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Fire every dependent of a completed stage.
///
/// Iterative: a fired dependent that completed and has dependents of its own
/// is returned rather than drained recursively, and its nodes are moved onto
/// `this` one at a time, so long chains never grow the call stack.
pub(crate) fn post_complete(this: &Arc<dyn StageCore>) {
    let mut f = Arc::clone(this);
    loop {
        let (h, more) = match f.stack().pop() {
            Some(popped) => popped,
            None => {
                if same_stage(&f, this) {
                    return;
                }
                f = Arc::clone(this);
                match f.stack().pop() {
                    Some(popped) => popped,
                    None => return,
                }
            }
        };
        if more && !same_stage(&f, this) {
            this.stack().push(h);
            continue;
        }
        f = h.try_fire(Mode::Nested).unwrap_or_else(|| Arc::clone(this));
    }
}

/// Drop dead completions from an incomplete stage.
///
/// The whole stack is detached and the live nodes pushed back. A stage that
/// completed meanwhile is drained afterwards so nothing is stranded.
pub(crate) fn clean_stack(stage: &Arc<dyn StageCore>) {
    if stage.is_done() {
        return;
    }
    for completion in stage.stack().take_all() {
        if completion.is_live() {
            stage.stack().push(completion);
        }
    }
    if stage.is_done() {
        post_complete(stage);
    }
}

/// Follow-up after a completion fired: tidy the sources and hand the
/// dependent back for draining, or drain it here outside of a drain.
pub(crate) fn post_fire(
    dep: Arc<dyn StageCore>,
    sources: &[Arc<dyn StageCore>],
    mode: Mode,
) -> Option<Arc<dyn StageCore>> {
    for src in sources.iter().rev() {
        if !src.stack().is_empty() {
            if mode == Mode::Nested || !src.is_done() {
                clean_stack(src);
            } else {
                post_complete(src);
            }
        }
    }
    if dep.is_done() && !dep.stack().is_empty() {
        if mode == Mode::Nested {
            return Some(dep);
        }
        post_complete(&dep);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Counter {
        live: AtomicBool,
        fired: Arc<AtomicUsize>,
    }

    impl Counter {
        fn new(fired: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                live: AtomicBool::new(true),
                fired: Arc::clone(fired),
            })
        }
    }

    impl Completion for Counter {
        fn try_fire(self: Arc<Self>, _mode: Mode) -> Option<Arc<dyn StageCore>> {
            if self.live.swap(false, Ordering::AcqRel) {
                self.fired.fetch_add(1, Ordering::SeqCst);
            }
            None
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::Acquire)
        }
    }

    struct Core {
        stack: CompletionStack,
        done: AtomicBool,
    }

    impl StageCore for Core {
        fn stack(&self) -> &CompletionStack {
            &self.stack
        }

        fn is_done(&self) -> bool {
            self.done.load(Ordering::Acquire)
        }

        fn failure(&self) -> Option<StageError> {
            None
        }
    }

    #[test]
    fn test_pop_is_lifo() {
        let fired = Arc::new(AtomicUsize::new(0));
        let stack = CompletionStack::new();
        let first: Arc<dyn Completion> = Counter::new(&fired);
        let second: Arc<dyn Completion> = Counter::new(&fired);
        stack.push(Arc::clone(&first));
        stack.push(Arc::clone(&second));
        let (top, more) = stack.pop().unwrap();
        assert!(Arc::ptr_eq(&top, &second));
        assert!(more);
        let (bottom, more) = stack.pop().unwrap();
        assert!(Arc::ptr_eq(&bottom, &first));
        assert!(!more);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_push_while_respects_condition() {
        let fired = Arc::new(AtomicUsize::new(0));
        let stack = CompletionStack::new();
        assert!(!stack.push_while(Counter::new(&fired), || false));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_post_complete_fires_everything() {
        let fired = Arc::new(AtomicUsize::new(0));
        let core: Arc<dyn StageCore> = Arc::new(Core {
            stack: CompletionStack::new(),
            done: AtomicBool::new(true),
        });
        for _ in 0..100 {
            core.stack().push(Counter::new(&fired));
        }
        post_complete(&core);
        assert_eq!(fired.load(Ordering::SeqCst), 100);
        assert!(core.stack().is_empty());
    }

    #[test]
    fn test_clean_stack_keeps_live_nodes() {
        let fired = Arc::new(AtomicUsize::new(0));
        let core: Arc<dyn StageCore> = Arc::new(Core {
            stack: CompletionStack::new(),
            done: AtomicBool::new(false),
        });
        let dead = Counter::new(&fired);
        dead.live.store(false, Ordering::Release);
        core.stack().push(Counter::new(&fired));
        core.stack().push(dead);
        core.stack().push(Counter::new(&fired));
        assert_eq!(core.stack().live_count(), 2);
        clean_stack(&core);
        assert_eq!(core.stack().live_count(), 2);
        let mut remaining = 0;
        while core.stack().pop().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 2);
    }
}
