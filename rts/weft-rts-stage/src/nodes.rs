//! Dependent completions: actions and relays that fire once their inputs
//! complete.
//!
//! A [`Dependent`] owns the stage it completes and a [`Trigger`] describing
//! its inputs. Running user code is guarded by a one-shot claim, so an action
//! fires at most once however many threads race to complete its inputs. With
//! an executor attached, the claim hands the action to the executor instead
//! of running it on the claiming thread.
//!
//! Triggers hold their inputs' cells, not [`Stage`] handles. A dependent sits
//! on its inputs' stacks, so a handle here would keep an input completable
//! forever and its graph alive with it.

use crate::error::StageError;
use crate::outcome::Outcome;
use crate::stack::{post_fire, Completion, Mode, StageCore};
use crate::stage::{Stage, StageCell};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use weft_rts_scheduler::{Executor, RejectedError, Runnable};

// ============================================================================
// Triggers
// ============================================================================

/// Settles a dependent without user code, if possible. Returns `true` when
/// nothing is left to run.
pub(crate) type Pre<S, V> = fn(&Outcome<S>, &Stage<V>) -> bool;

/// Two-input version of [`Pre`].
pub(crate) type BiPre<A, B, V> = fn(&Outcome<A>, &Outcome<B>, &Stage<V>) -> bool;

/// User code run against one input outcome.
pub(crate) type UniAction<S, V> = Box<dyn FnOnce(&Outcome<S>, &Stage<V>) + Send>;

/// User code run against two input outcomes.
pub(crate) type BiAction<A, B, V> = Box<dyn FnOnce(&Outcome<A>, &Outcome<B>, &Stage<V>) + Send>;

/// The input side of a dependent.
pub(crate) trait Trigger<V>: Send + Sync {
    /// `None` while the inputs are not ready. Otherwise whether `dep` was
    /// settled without running the action.
    fn check(&self, dep: &Stage<V>) -> Option<bool>;

    /// Run the action. Called at most once, by the claim holder.
    fn run(&self, dep: &Stage<V>);

    /// Drop captured state once the dependent is finished.
    fn clear(&self);

    /// The stages this dependent listens to.
    fn sources(&self) -> Vec<Arc<dyn StageCore>>;
}

/// Fires when `src` completes.
pub(crate) struct Uni<S, V> {
    pub(crate) src: Arc<StageCell<S>>,
    pub(crate) pre: Pre<S, V>,
    pub(crate) action: Mutex<Option<UniAction<S, V>>>,
}

impl<S, V> Trigger<V> for Uni<S, V>
where
    S: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn check(&self, dep: &Stage<V>) -> Option<bool> {
        let r = self.src.outcome()?;
        Some((self.pre)(r, dep))
    }

    fn run(&self, dep: &Stage<V>) {
        let action = self.action.lock().take();
        if let (Some(r), Some(action)) = (self.src.outcome(), action) {
            guarded(dep, || action(r, dep));
        }
    }

    fn clear(&self) {
        drop(self.action.lock().take());
    }

    fn sources(&self) -> Vec<Arc<dyn StageCore>> {
        vec![Arc::clone(&self.src) as Arc<dyn StageCore>]
    }
}

/// Fires when both `a` and `b` complete.
pub(crate) struct Both<A, B, V> {
    pub(crate) a: Arc<StageCell<A>>,
    pub(crate) b: Arc<StageCell<B>>,
    pub(crate) pre: BiPre<A, B, V>,
    pub(crate) action: Mutex<Option<BiAction<A, B, V>>>,
}

impl<A, B, V> Trigger<V> for Both<A, B, V>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn check(&self, dep: &Stage<V>) -> Option<bool> {
        let r = self.a.outcome()?;
        let s = self.b.outcome()?;
        Some((self.pre)(r, s, dep))
    }

    fn run(&self, dep: &Stage<V>) {
        let action = self.action.lock().take();
        if let (Some(r), Some(s), Some(action)) = (self.a.outcome(), self.b.outcome(), action) {
            guarded(dep, || action(r, s, dep));
        }
    }

    fn clear(&self) {
        drop(self.action.lock().take());
    }

    fn sources(&self) -> Vec<Arc<dyn StageCore>> {
        vec![
            Arc::clone(&self.a) as Arc<dyn StageCore>,
            Arc::clone(&self.b) as Arc<dyn StageCore>,
        ]
    }
}

/// Fires when either `a` or `b` completes, preferring `a` when both have.
pub(crate) struct Either<S, V> {
    pub(crate) a: Arc<StageCell<S>>,
    pub(crate) b: Arc<StageCell<S>>,
    pub(crate) pre: Pre<S, V>,
    pub(crate) action: Mutex<Option<UniAction<S, V>>>,
}

impl<S, V> Either<S, V>
where
    S: Clone + Send + Sync + 'static,
{
    fn first(&self) -> Option<&Outcome<S>> {
        self.a.outcome().or_else(|| self.b.outcome())
    }
}

impl<S, V> Trigger<V> for Either<S, V>
where
    S: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn check(&self, dep: &Stage<V>) -> Option<bool> {
        let r = self.first()?;
        Some((self.pre)(r, dep))
    }

    fn run(&self, dep: &Stage<V>) {
        let action = self.action.lock().take();
        if let (Some(r), Some(action)) = (self.first(), action) {
            guarded(dep, || action(r, dep));
        }
    }

    fn clear(&self) {
        drop(self.action.lock().take());
    }

    fn sources(&self) -> Vec<Arc<dyn StageCore>> {
        vec![
            Arc::clone(&self.a) as Arc<dyn StageCore>,
            Arc::clone(&self.b) as Arc<dyn StageCore>,
        ]
    }
}

/// Completes with unit once both inputs complete, or with the first failure
/// seen, checking `a` before `b`. Inputs are type-erased so stages of any
/// value type can be joined.
pub(crate) struct AllRelay {
    pub(crate) a: Arc<dyn StageCore>,
    pub(crate) b: Arc<dyn StageCore>,
}

impl Trigger<()> for AllRelay {
    fn check(&self, dep: &Stage<()>) -> Option<bool> {
        if !self.a.is_done() || !self.b.is_done() {
            return None;
        }
        let outcome = match self.a.failure().or_else(|| self.b.failure()) {
            Some(err) => Outcome::Failed(err.wrap()),
            None => Outcome::Value(()),
        };
        dep.complete_outcome(outcome);
        Some(true)
    }

    fn run(&self, _dep: &Stage<()>) {}

    fn clear(&self) {}

    fn sources(&self) -> Vec<Arc<dyn StageCore>> {
        vec![Arc::clone(&self.a), Arc::clone(&self.b)]
    }
}

// ============================================================================
// Settling Helpers
// ============================================================================

/// Relay a failed input, wrapped once. Leaves values to the action.
pub(crate) fn relay_failure<S, V>(r: &Outcome<S>, dep: &Stage<V>) -> bool
where
    V: Clone + Send + Sync + 'static,
{
    match r {
        Outcome::Failed(err) => {
            dep.complete_outcome(Outcome::Failed(err.clone().wrap()));
            true
        }
        Outcome::Value(_) => false,
    }
}

/// Relay the first failed input, checking `r` before `s`.
pub(crate) fn relay_either_failure<A, B, V>(r: &Outcome<A>, s: &Outcome<B>, dep: &Stage<V>) -> bool
where
    V: Clone + Send + Sync + 'static,
{
    match r.failure().or_else(|| s.failure()) {
        Some(err) => {
            dep.complete_outcome(Outcome::Failed(err.clone().wrap()));
            true
        }
        None => false,
    }
}

/// Relay the input's outcome exactly, without wrapping a failure.
pub(crate) fn relay_exact<T>(r: &Outcome<T>, dep: &Stage<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    dep.complete_outcome(r.clone());
    true
}

/// Relay whatever the input produced.
pub(crate) fn relay_all<T>(r: &Outcome<T>, dep: &Stage<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    dep.complete_outcome(r.relayed());
    true
}

/// Pass a value through unchanged. Leaves failures to the action.
pub(crate) fn pass_value<T>(r: &Outcome<T>, dep: &Stage<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    match r {
        Outcome::Value(v) => {
            dep.complete_outcome(Outcome::Value(v.clone()));
            true
        }
        Outcome::Failed(_) => false,
    }
}

/// Always run the action.
pub(crate) fn always_run<S, V>(_r: &Outcome<S>, _dep: &Stage<V>) -> bool {
    false
}

/// Complete `dep` with `f` applied to the input value, or relay the failure.
pub(crate) fn map_value<S, V>(r: &Outcome<S>, dep: &Stage<V>, f: impl FnOnce(S) -> V)
where
    S: Clone,
    V: Clone + Send + Sync + 'static,
{
    let outcome = match r {
        Outcome::Value(v) => Outcome::Value(f(v.clone())),
        Outcome::Failed(err) => Outcome::Failed(err.clone().wrap()),
    };
    dep.complete_outcome(outcome);
}

/// Run `f`, failing `dep` with the panic if it unwinds.
pub(crate) fn guarded<V>(dep: &Stage<V>, f: impl FnOnce())
where
    V: Clone + Send + Sync + 'static,
{
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let err = StageError::from_panic(payload);
        tracing::debug!(%err, "stage action panicked");
        dep.complete_outcome(Outcome::Failed(err.wrap()));
    }
}

// ============================================================================
// Claims
// ============================================================================

/// One-shot permission to run a dependent's action.
struct Claim {
    claimed: AtomicBool,
    executor: Option<Arc<dyn Executor>>,
}

impl Claim {
    /// `Ok(true)` if the caller should run the action now. `Ok(false)` if
    /// someone else claimed it or it was handed to the executor.
    fn claim(&self, handoff: impl FnOnce() -> Runnable) -> Result<bool, RejectedError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        match &self.executor {
            None => Ok(true),
            Some(executor) => executor.execute(handoff()).map(|()| false),
        }
    }
}

// ============================================================================
// Dependents
// ============================================================================

/// A registered dependent: the stage it completes plus its trigger.
pub(crate) struct Dependent<V> {
    claim: Claim,
    live: AtomicBool,
    dep: Stage<V>,
    trigger: Box<dyn Trigger<V>>,
}

impl<V> Dependent<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        executor: Option<Arc<dyn Executor>>,
        dep: Stage<V>,
        trigger: Box<dyn Trigger<V>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            claim: Claim {
                claimed: AtomicBool::new(false),
                executor,
            },
            live: AtomicBool::new(true),
            dep,
            trigger,
        })
    }

    fn handoff(self: &Arc<Self>) -> Runnable {
        let me = Arc::clone(self);
        Box::new(move || {
            me.fire(Mode::Async);
        })
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
        self.trigger.clear();
    }

    pub(crate) fn fire(self: &Arc<Self>, mode: Mode) -> Option<Arc<dyn StageCore>> {
        if !self.is_live() {
            return None;
        }
        let settled = self.trigger.check(&self.dep)?;
        if !settled && !self.dep.is_done() {
            if mode == Mode::Async {
                self.trigger.run(&self.dep);
            } else {
                match self.claim.claim(|| self.handoff()) {
                    Ok(true) => self.trigger.run(&self.dep),
                    Ok(false) => return None,
                    Err(err) => {
                        tracing::debug!(%err, "stage executor rejected action");
                        self.dep
                            .complete_outcome(Outcome::Failed(StageError::Rejected(err).wrap()));
                    }
                }
            }
            if !self.dep.is_done() {
                // The action handed completion to a relay.
                self.retire();
                return None;
            }
        }
        self.retire();
        post_fire(self.dep.core(), &self.trigger.sources(), mode)
    }
}

impl<V> Completion for Dependent<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn try_fire(self: Arc<Self>, mode: Mode) -> Option<Arc<dyn StageCore>> {
        self.fire(mode)
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

// ============================================================================
// Registration
// ============================================================================

fn same(a: &dyn StageCore, b: &dyn StageCore) -> bool {
    std::ptr::addr_eq(a as *const dyn StageCore, b as *const dyn StageCore)
}

/// Push onto `src` unless it already completed.
pub(crate) fn push_on(src: &dyn StageCore, completion: Arc<dyn Completion>) {
    src.stack().push_while(completion, || !src.is_done());
}

/// Push onto both inputs, skipping any that already completed.
pub(crate) fn push_on_both(a: &dyn StageCore, b: &dyn StageCore, completion: Arc<dyn Completion>) {
    push_on(a, Arc::clone(&completion));
    if !same(a, b) {
        push_on(b, completion);
    }
}

/// Push onto both inputs while neither has completed.
pub(crate) fn push_on_either(a: &dyn StageCore, b: &dyn StageCore, completion: Arc<dyn Completion>) {
    let pending = || !a.is_done() && !b.is_done();
    if a.stack().push_while(Arc::clone(&completion), pending) && !same(a, b) {
        b.stack().push_while(completion, pending);
    }
}
