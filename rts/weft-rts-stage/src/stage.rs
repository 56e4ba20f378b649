//! The [`Stage`] type: a one-shot result with composable continuations.

use crate::error::StageError;
use crate::executor::default_executor;
use crate::nodes::{
    always_run, guarded, map_value, pass_value, push_on, push_on_both, push_on_either, relay_all,
    relay_either_failure, relay_exact, relay_failure, BiAction, BiPre, Both, Dependent, Either,
    Pre, Uni, UniAction,
};
use crate::outcome::{Outcome, OutcomeCell};
use crate::signaller::wait;
use crate::stack::{post_complete, Completion, CompletionStack, Mode, StageCore};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_rts_scheduler::Executor;

/// The shared state of a stage.
///
/// Dependents read their inputs through the cell directly. Only [`Stage`]
/// handles count in `handles`: once the last one is gone nothing can complete
/// a pending stage, and whatever waits on it is released.
pub(crate) struct StageCell<T> {
    outcome: OutcomeCell<T>,
    stack: CompletionStack,
    handles: AtomicUsize,
}

impl<T> StageCell<T> {
    pub(crate) fn outcome(&self) -> Option<&Outcome<T>> {
        self.outcome.get()
    }
}

impl<T> StageCore for StageCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn stack(&self) -> &CompletionStack {
        &self.stack
    }

    fn is_done(&self) -> bool {
        self.outcome.is_set()
    }

    fn failure(&self) -> Option<StageError> {
        self.outcome.get().and_then(Outcome::failure).cloned()
    }
}

/// A one-shot result that dependents can be chained onto.
///
/// A stage is completed exactly once: with a value, with a failure, or by
/// cancellation. The first completion wins and later attempts are no-ops.
/// Continuations registered with the `then_*` family run when it completes,
/// or at once if it already has. Clones share the same result.
///
/// Continuations come in three flavours:
///
/// - plain (`then_apply`) runs on whichever thread completes the source,
///   or on the registering thread if the source is already complete
/// - `_async` (`then_apply_async`) runs on [`default_executor`]
/// - `_async_on` (`then_apply_async_on`) runs on the given executor
///
/// A failure in a source is relayed to every dependent, wrapped once in
/// [`StageError::Completion`], unless intercepted by [`handle`](Self::handle),
/// [`exceptionally`](Self::exceptionally) or
/// [`when_complete`](Self::when_complete). A panicking action fails its own
/// dependent with [`StageError::Panicked`].
pub struct Stage<T> {
    cell: Arc<StageCell<T>>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        self.cell.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Drop for Stage<T> {
    fn drop(&mut self) {
        if self.cell.handles.fetch_sub(1, Ordering::AcqRel) == 1 && !self.cell.outcome.is_set() {
            // Abandoned: its dependents can never fire through it.
            self.cell.stack.clear();
        }
    }
}

fn explicit(e: impl Executor + 'static) -> Option<Arc<dyn Executor>> {
    Some(Arc::new(e))
}

impl<T> Stage<T>
where
    T: Clone + Send + Sync + 'static,
{
    // ========================================================================
    // Construction
    // ========================================================================

    /// An incomplete stage, completed later by [`complete`](Self::complete)
    /// and friends.
    #[must_use]
    pub fn new() -> Self {
        Self::from_cell(OutcomeCell::new())
    }

    /// A stage already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self::from_cell(OutcomeCell::with(Outcome::Value(value)))
    }

    /// A stage already completed with `err`.
    #[must_use]
    pub fn failed(err: StageError) -> Self {
        Self::from_cell(OutcomeCell::with(Outcome::Failed(err)))
    }

    fn from_cell(outcome: OutcomeCell<T>) -> Self {
        Self {
            cell: Arc::new(StageCell {
                outcome,
                stack: CompletionStack::new(),
                handles: AtomicUsize::new(1),
            }),
        }
    }

    /// A stage completed with the result of `f`, run on [`default_executor`].
    pub fn supply_async<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::supply_with(default_executor(), f)
    }

    /// A stage completed with the result of `f`, run on `executor`.
    ///
    /// If the executor refuses `f`, the returned stage has already failed
    /// with [`StageError::Rejected`].
    pub fn supply_async_on<F, E>(f: F, executor: E) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
        E: Executor + 'static,
    {
        Self::supply_with(Arc::new(executor), f)
    }

    fn supply_with<F>(executor: Arc<dyn Executor>, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let stage = Self::new();
        let dep = stage.clone();
        let submitted = executor.execute(Box::new(move || {
            if !dep.is_done() {
                guarded(&dep, || {
                    dep.complete_outcome(Outcome::Value(f()));
                });
            }
            dep.post_complete();
        }));
        if let Err(err) = submitted {
            tracing::debug!(%err, "async stage rejected");
            stage.complete_exceptionally(StageError::Rejected(err));
        }
        stage
    }

    // ========================================================================
    // Completion
    // ========================================================================

    pub(crate) fn outcome(&self) -> Option<&Outcome<T>> {
        self.cell.outcome()
    }

    /// Set the outcome without firing dependents.
    pub(crate) fn complete_outcome(&self, outcome: Outcome<T>) -> bool {
        self.cell.outcome.set(outcome)
    }

    pub(crate) fn core(&self) -> Arc<dyn StageCore> {
        Arc::clone(&self.cell) as Arc<dyn StageCore>
    }

    /// The cell without a handle, for dependents reading this stage.
    fn reader(&self) -> Arc<StageCell<T>> {
        Arc::clone(&self.cell)
    }

    fn post_complete(&self) {
        post_complete(&self.core());
    }

    /// Complete with `value` if not already complete. Returns whether this
    /// call completed the stage.
    pub fn complete(&self, value: T) -> bool {
        let won = self.complete_outcome(Outcome::Value(value));
        self.post_complete();
        won
    }

    /// Fail with `err` if not already complete. Returns whether this call
    /// completed the stage.
    pub fn complete_exceptionally(&self, err: StageError) -> bool {
        let won = self.complete_outcome(Outcome::Failed(err));
        self.post_complete();
        won
    }

    /// Cancel if not already complete. Returns whether the stage is now
    /// cancelled, by this call or an earlier one.
    pub fn cancel(&self) -> bool {
        let won = !self.is_done() && self.complete_outcome(Outcome::Failed(StageError::Cancelled));
        self.post_complete();
        won || self.is_cancelled()
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Whether the stage completed in any way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.outcome.is_set()
    }

    /// Whether this stage itself was cancelled. A dependent of a cancelled
    /// stage is failed, not cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome(), Some(Outcome::Failed(StageError::Cancelled)))
    }

    /// Whether the stage completed with a failure or by cancellation.
    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(self.outcome(), Some(Outcome::Failed(_)))
    }

    /// Estimated number of continuations and waiters still registered.
    #[must_use]
    pub fn dependents(&self) -> usize {
        self.cell.stack.live_count()
    }

    // ========================================================================
    // Results
    // ========================================================================

    fn report_join(outcome: &Outcome<T>) -> Result<T, StageError> {
        match outcome {
            Outcome::Value(v) => Ok(v.clone()),
            Outcome::Failed(StageError::Cancelled) => Err(StageError::Cancelled),
            Outcome::Failed(err) => Err(err.clone().wrap()),
        }
    }

    fn report_get(outcome: &Outcome<T>) -> Result<T, StageError> {
        match outcome {
            Outcome::Value(v) => Ok(v.clone()),
            Outcome::Failed(err) => Err(err.cause().clone()),
        }
    }

    fn wait_done(&self, deadline: Option<Instant>) -> Option<&Outcome<T>> {
        if self.outcome().is_none() {
            wait(&self.core(), deadline);
        }
        self.outcome()
    }

    /// Block until complete. Failures are reported wrapped once, as a
    /// dependent would see them, except cancellation of this stage which is
    /// reported as [`StageError::Cancelled`].
    pub fn join(&self) -> Result<T, StageError> {
        match self.wait_done(None) {
            Some(outcome) => Self::report_join(outcome),
            None => unreachable!("untimed wait returned early"),
        }
    }

    /// Block until complete. Failures are reported as their underlying
    /// cause, without the relay wrapper.
    pub fn get(&self) -> Result<T, StageError> {
        match self.wait_done(None) {
            Some(outcome) => Self::report_get(outcome),
            None => unreachable!("untimed wait returned early"),
        }
    }

    /// Like [`get`](Self::get), giving up with [`StageError::Timeout`] after
    /// `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, StageError> {
        if let Some(outcome) = self.outcome() {
            return Self::report_get(outcome);
        }
        if timeout.is_zero() {
            return Err(StageError::Timeout);
        }
        let deadline = Instant::now().checked_add(timeout);
        match self.wait_done(deadline) {
            Some(outcome) => Self::report_get(outcome),
            None => Err(StageError::Timeout),
        }
    }

    /// The result if complete, else `default`. Failures are reported as by
    /// [`join`](Self::join).
    pub fn get_now(&self, default: T) -> Result<T, StageError> {
        match self.outcome() {
            Some(outcome) => Self::report_join(outcome),
            None => Ok(default),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn uni<V>(
        &self,
        executor: Option<Arc<dyn Executor>>,
        pre: Pre<T, V>,
        action: UniAction<T, V>,
    ) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let dep = Stage::new();
        let node = Dependent::new(
            executor,
            dep.clone(),
            Box::new(Uni {
                src: self.reader(),
                pre,
                action: Mutex::new(Some(action)),
            }),
        );
        push_on(&*self.cell, Arc::clone(&node) as Arc<dyn Completion>);
        node.fire(Mode::Sync);
        dep
    }

    fn both<U, V>(
        &self,
        other: &Stage<U>,
        executor: Option<Arc<dyn Executor>>,
        pre: BiPre<T, U, V>,
        action: BiAction<T, U, V>,
    ) -> Stage<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let dep = Stage::new();
        let node = Dependent::new(
            executor,
            dep.clone(),
            Box::new(Both {
                a: self.reader(),
                b: other.reader(),
                pre,
                action: Mutex::new(Some(action)),
            }),
        );
        push_on_both(&*self.cell, &*other.cell, Arc::clone(&node) as Arc<dyn Completion>);
        node.fire(Mode::Sync);
        dep
    }

    fn either<V>(
        &self,
        other: &Stage<T>,
        executor: Option<Arc<dyn Executor>>,
        pre: Pre<T, V>,
        action: UniAction<T, V>,
    ) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let dep = Stage::new();
        let node = Dependent::new(
            executor,
            dep.clone(),
            Box::new(Either {
                a: self.reader(),
                b: other.reader(),
                pre,
                action: Mutex::new(Some(action)),
            }),
        );
        push_on_either(&*self.cell, &*other.cell, Arc::clone(&node) as Arc<dyn Completion>);
        node.fire(Mode::Sync);
        dep
    }

    /// A stage relaying the outcome of whichever of this stage and `other`
    /// completes first.
    pub(crate) fn relay_either(&self, other: &Stage<T>) -> Stage<T> {
        self.either(other, None, relay_all, Box::new(|_, _| {}))
    }

    /// Complete `dep` with exactly this stage's outcome once it is known.
    pub(crate) fn relay_to(&self, dep: &Stage<T>) {
        if let Some(outcome) = self.outcome() {
            dep.complete_outcome(outcome.clone());
            return;
        }
        let node = Dependent::new(
            None,
            dep.clone(),
            Box::new(Uni {
                src: self.reader(),
                pre: relay_exact,
                action: Mutex::new(None),
            }),
        );
        push_on(&*self.cell, Arc::clone(&node) as Arc<dyn Completion>);
        node.fire(Mode::Sync);
    }

    // ========================================================================
    // Transforming
    // ========================================================================

    fn apply_with<V, F>(&self, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.uni(executor, relay_failure, Box::new(move |r, d| map_value(r, d, f)))
    }

    /// A stage completed with `f` applied to this stage's value.
    pub fn then_apply<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.apply_with(None, f)
    }

    /// [`then_apply`](Self::then_apply) on the default executor.
    pub fn then_apply_async<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.apply_with(Some(default_executor()), f)
    }

    /// [`then_apply`](Self::then_apply) on `executor`.
    pub fn then_apply_async_on<V, F, E>(&self, f: F, executor: E) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
        E: Executor + 'static,
    {
        self.apply_with(explicit(executor), f)
    }

    /// A stage completed after `f` consumes this stage's value.
    pub fn then_accept<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_with(None, f)
    }

    /// [`then_accept`](Self::then_accept) on the default executor.
    pub fn then_accept_async<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_with(Some(default_executor()), f)
    }

    /// [`then_accept`](Self::then_accept) on `executor`.
    pub fn then_accept_async_on<F, E>(&self, f: F, executor: E) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
        E: Executor + 'static,
    {
        self.apply_with(explicit(executor), f)
    }

    /// A stage completed after `f` runs, once this stage has a value.
    pub fn then_run<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.apply_with(None, move |_| f())
    }

    /// [`then_run`](Self::then_run) on the default executor.
    pub fn then_run_async<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.apply_with(Some(default_executor()), move |_| f())
    }

    /// [`then_run`](Self::then_run) on `executor`.
    pub fn then_run_async_on<F, E>(&self, f: F, executor: E) -> Stage<()>
    where
        F: FnOnce() + Send + 'static,
        E: Executor + 'static,
    {
        self.apply_with(explicit(executor), move |_| f())
    }

    /// A unit stage that completes when this one does, relaying failures.
    #[must_use]
    pub fn to_unit(&self) -> Stage<()> {
        self.apply_with(None, drop)
    }

    // ========================================================================
    // Combining Two Stages
    // ========================================================================

    fn combine_with<U, V, F>(
        &self,
        other: &Stage<U>,
        executor: Option<Arc<dyn Executor>>,
        f: F,
    ) -> Stage<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both(
            other,
            executor,
            relay_either_failure,
            Box::new(move |r, s, d| match (r, s) {
                (Outcome::Value(a), Outcome::Value(b)) => {
                    d.complete_outcome(Outcome::Value(f(a.clone(), b.clone())));
                }
                _ => {
                    relay_either_failure(r, s, d);
                }
            }),
        )
    }

    /// A stage completed with `f` applied to the values of this stage and
    /// `other`. If either fails, the first failure seen is relayed.
    pub fn then_combine<U, V, F>(&self, other: &Stage<U>, f: F) -> Stage<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.combine_with(other, None, f)
    }

    /// [`then_combine`](Self::then_combine) on the default executor.
    pub fn then_combine_async<U, V, F>(&self, other: &Stage<U>, f: F) -> Stage<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.combine_with(other, Some(default_executor()), f)
    }

    /// [`then_combine`](Self::then_combine) on `executor`.
    pub fn then_combine_async_on<U, V, F, E>(&self, other: &Stage<U>, f: F, executor: E) -> Stage<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
        E: Executor + 'static,
    {
        self.combine_with(other, explicit(executor), f)
    }

    /// A stage completed after `f` consumes both values.
    pub fn then_accept_both<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.combine_with(other, None, f)
    }

    /// [`then_accept_both`](Self::then_accept_both) on the default executor.
    pub fn then_accept_both_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.combine_with(other, Some(default_executor()), f)
    }

    /// [`then_accept_both`](Self::then_accept_both) on `executor`.
    pub fn then_accept_both_async_on<U, F, E>(&self, other: &Stage<U>, f: F, executor: E) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
        E: Executor + 'static,
    {
        self.combine_with(other, explicit(executor), f)
    }

    /// A stage completed after `f` runs, once both stages have values.
    pub fn run_after_both<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.combine_with(other, None, move |_, _| f())
    }

    /// [`run_after_both`](Self::run_after_both) on the default executor.
    pub fn run_after_both_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.combine_with(other, Some(default_executor()), move |_, _| f())
    }

    /// [`run_after_both`](Self::run_after_both) on `executor`.
    pub fn run_after_both_async_on<U, F, E>(&self, other: &Stage<U>, f: F, executor: E) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
        E: Executor + 'static,
    {
        self.combine_with(other, explicit(executor), move |_, _| f())
    }

    // ========================================================================
    // Either of Two Stages
    // ========================================================================

    fn either_with<V, F>(&self, other: &Stage<T>, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.either(
            other,
            executor,
            relay_failure,
            Box::new(move |r, d| map_value(r, d, f)),
        )
    }

    /// A stage completed with `f` applied to the value of whichever of this
    /// stage and `other` completes first. If that one failed, the failure is
    /// relayed.
    pub fn apply_to_either<V, F>(&self, other: &Stage<T>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.either_with(other, None, f)
    }

    /// [`apply_to_either`](Self::apply_to_either) on the default executor.
    pub fn apply_to_either_async<V, F>(&self, other: &Stage<T>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
    {
        self.either_with(other, Some(default_executor()), f)
    }

    /// [`apply_to_either`](Self::apply_to_either) on `executor`.
    pub fn apply_to_either_async_on<V, F, E>(&self, other: &Stage<T>, f: F, executor: E) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> V + Send + 'static,
        E: Executor + 'static,
    {
        self.either_with(other, explicit(executor), f)
    }

    /// A stage completed after `f` consumes the first value.
    pub fn accept_either<F>(&self, other: &Stage<T>, f: F) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either_with(other, None, f)
    }

    /// [`accept_either`](Self::accept_either) on the default executor.
    pub fn accept_either_async<F>(&self, other: &Stage<T>, f: F) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either_with(other, Some(default_executor()), f)
    }

    /// [`accept_either`](Self::accept_either) on `executor`.
    pub fn accept_either_async_on<F, E>(&self, other: &Stage<T>, f: F, executor: E) -> Stage<()>
    where
        F: FnOnce(T) + Send + 'static,
        E: Executor + 'static,
    {
        self.either_with(other, explicit(executor), f)
    }

    fn run_either_with<U, F>(&self, other: &Stage<U>, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.to_unit()
            .either_with(&other.to_unit(), executor, move |()| f())
    }

    /// A stage completed after `f` runs, once either stage completes.
    pub fn run_after_either<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.run_either_with(other, None, f)
    }

    /// [`run_after_either`](Self::run_after_either) on the default executor.
    pub fn run_after_either_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.run_either_with(other, Some(default_executor()), f)
    }

    /// [`run_after_either`](Self::run_after_either) on `executor`.
    pub fn run_after_either_async_on<U, F, E>(&self, other: &Stage<U>, f: F, executor: E) -> Stage<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
        E: Executor + 'static,
    {
        self.run_either_with(other, explicit(executor), f)
    }

    // ========================================================================
    // Composing
    // ========================================================================

    fn compose_with<V, F>(&self, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Stage<V> + Send + 'static,
    {
        self.uni(
            executor,
            relay_failure,
            Box::new(move |r, d| match r {
                Outcome::Value(v) => f(v.clone()).relay_to(d),
                Outcome::Failed(_) => {
                    relay_failure(r, d);
                }
            }),
        )
    }

    /// A stage completed with the outcome of the stage `f` returns for this
    /// stage's value.
    ///
    /// A failure of this stage is relayed wrapped once, like any other
    /// dependent. The returned stage's outcome is passed on unchanged, so a
    /// cancelled inner stage leaves the composed stage cancelled too.
    pub fn then_compose<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Stage<V> + Send + 'static,
    {
        self.compose_with(None, f)
    }

    /// [`then_compose`](Self::then_compose) on the default executor.
    pub fn then_compose_async<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Stage<V> + Send + 'static,
    {
        self.compose_with(Some(default_executor()), f)
    }

    /// [`then_compose`](Self::then_compose) on `executor`.
    pub fn then_compose_async_on<V, F, E>(&self, f: F, executor: E) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Stage<V> + Send + 'static,
        E: Executor + 'static,
    {
        self.compose_with(explicit(executor), f)
    }

    // ========================================================================
    // Intercepting Failures
    // ========================================================================

    fn handle_with<V, F>(&self, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, StageError>) -> V + Send + 'static,
    {
        self.uni(
            executor,
            always_run,
            Box::new(move |r, d| {
                d.complete_outcome(Outcome::Value(f(r.to_result())));
            }),
        )
    }

    /// A stage completed with `f` applied to this stage's result, whether a
    /// value or a failure.
    pub fn handle<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, StageError>) -> V + Send + 'static,
    {
        self.handle_with(None, f)
    }

    /// [`handle`](Self::handle) on the default executor.
    pub fn handle_async<V, F>(&self, f: F) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, StageError>) -> V + Send + 'static,
    {
        self.handle_with(Some(default_executor()), f)
    }

    /// [`handle`](Self::handle) on `executor`.
    pub fn handle_async_on<V, F, E>(&self, f: F, executor: E) -> Stage<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Result<T, StageError>) -> V + Send + 'static,
        E: Executor + 'static,
    {
        self.handle_with(explicit(executor), f)
    }

    fn when_complete_with<F>(&self, executor: Option<Arc<dyn Executor>>, f: F) -> Stage<T>
    where
        F: FnOnce(&Result<T, StageError>) + Send + 'static,
    {
        self.uni(
            executor,
            always_run,
            Box::new(move |r, d| {
                let result = r.to_result();
                let panicked =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&result))).err();
                let outcome = match (r, panicked) {
                    (Outcome::Value(_), Some(payload)) => {
                        Outcome::Failed(StageError::from_panic(payload).wrap())
                    }
                    // A failed source wins over a panicking observer.
                    _ => r.relayed(),
                };
                d.complete_outcome(outcome);
            }),
        )
    }

    /// A stage with this stage's outcome, completed after `f` observes it.
    ///
    /// If `f` panics, a successful outcome is replaced by the panic; a
    /// failure is kept.
    pub fn when_complete<F>(&self, f: F) -> Stage<T>
    where
        F: FnOnce(&Result<T, StageError>) + Send + 'static,
    {
        self.when_complete_with(None, f)
    }

    /// [`when_complete`](Self::when_complete) on the default executor.
    pub fn when_complete_async<F>(&self, f: F) -> Stage<T>
    where
        F: FnOnce(&Result<T, StageError>) + Send + 'static,
    {
        self.when_complete_with(Some(default_executor()), f)
    }

    /// [`when_complete`](Self::when_complete) on `executor`.
    pub fn when_complete_async_on<F, E>(&self, f: F, executor: E) -> Stage<T>
    where
        F: FnOnce(&Result<T, StageError>) + Send + 'static,
        E: Executor + 'static,
    {
        self.when_complete_with(explicit(executor), f)
    }

    /// A stage with this stage's value, or with `f` applied to its failure.
    pub fn exceptionally<F>(&self, f: F) -> Stage<T>
    where
        F: FnOnce(StageError) -> T + Send + 'static,
    {
        self.uni(
            None,
            pass_value,
            Box::new(move |r, d| {
                let value = match r {
                    Outcome::Failed(err) => f(err.clone()),
                    Outcome::Value(v) => v.clone(),
                };
                d.complete_outcome(Outcome::Value(value));
            }),
        )
    }
}

impl Stage<()> {
    /// A unit stage completed after `f` runs on [`default_executor`].
    pub fn run_async<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::supply_with(default_executor(), f)
    }

    /// A unit stage completed after `f` runs on `executor`.
    pub fn run_async_on<F, E>(f: F, executor: E) -> Self
    where
        F: FnOnce() + Send + 'static,
        E: Executor + 'static,
    {
        Self::supply_with(Arc::new(executor), f)
    }
}

impl<T> Default for Stage<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Stage<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Some(Outcome::Value(_)) => f.write_str("Stage[Completed normally]"),
            Some(Outcome::Failed(err)) => write!(f, "Stage[Completed exceptionally: {err}]"),
            None => match self.dependents() {
                0 => f.write_str("Stage[Not completed]"),
                n => write!(f, "Stage[Not completed, {n} dependents]"),
            },
        }
    }
}
