//! Completion graphs: chaining, relaying failures, races between completers
//! and registration, and the all/any trees.

use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use weft_rts_scheduler::{RejectedError, Scheduler, ThreadPerTaskExecutor};
use weft_rts_stage::{all_of, any_of, Stage, StageError};

#[derive(Debug, thiserror::Error)]
#[error("upstream broke")]
struct UpstreamBroke;

// ============================================================================
// Chaining
// ============================================================================

#[test]
fn test_completed_then_apply() {
    assert_eq!(Stage::completed(5).then_apply(|x| x * 2).join().unwrap(), 10);
}

#[test]
fn test_long_chain_drains_iteratively() {
    const LINKS: usize = 100_000;
    let head: Stage<usize> = Stage::new();
    let mut tail = head.clone();
    for _ in 0..LINKS {
        tail = tail.then_apply(|x| x + 1);
    }
    head.complete(0);
    assert_eq!(tail.join().unwrap(), LINKS);
}

#[test]
fn test_wide_fan_out_fires_every_dependent() {
    let source: Stage<u32> = Stage::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let dependents: Vec<_> = (0..1_000)
        .map(|_| {
            let fired = Arc::clone(&fired);
            source.then_accept(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    assert_eq!(source.dependents(), 1_000);
    source.complete(1);
    assert!(dependents.iter().all(Stage::is_done));
    assert_eq!(fired.load(Ordering::SeqCst), 1_000);
    assert_eq!(source.dependents(), 0);
}

#[test]
fn test_run_after_either_with_different_types() {
    let numbers: Stage<u64> = Stage::new();
    let words: Stage<String> = Stage::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let after = numbers.run_after_either(&words, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    words.complete("hi".to_string());
    after.join().unwrap();
    numbers.complete(1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_run_after_both_waits_for_both() {
    let a: Stage<u8> = Stage::new();
    let b: Stage<&str> = Stage::new();
    let both = a.run_after_both(&b, || ());
    a.complete(1);
    assert!(!both.is_done());
    b.complete("done");
    assert!(both.join().is_ok());
}

// ============================================================================
// Failure Relay
// ============================================================================

#[test]
fn test_failure_skips_actions_and_reaches_tail() {
    let ran = Arc::new(AtomicUsize::new(0));
    let head: Stage<i32> = Stage::new();
    let counter = Arc::clone(&ran);
    let tail = head
        .then_apply(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        })
        .then_compose(|x| Stage::completed(x + 1));
    head.complete_exceptionally(StageError::failed(UpstreamBroke));
    let err = tail.join().unwrap_err();
    assert!(err.is_wrapped());
    assert_eq!(err.cause().to_string(), "stage failed: upstream broke");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_compose_relays_inner_outcome_unchanged() {
    let composed = Stage::completed(1).then_compose(|_| Stage::<u8>::failed(StageError::Cancelled));
    assert!(composed.is_cancelled());
    assert!(matches!(composed.join(), Err(StageError::Cancelled)));

    let inner: Stage<u8> = Stage::new();
    let pending = inner.clone();
    let composed = Stage::completed(1).then_compose(move |_| pending);
    inner.complete_exceptionally(StageError::failed(UpstreamBroke));
    assert!(matches!(composed.join(), Err(StageError::Completion(_))));
    assert!(!composed.join().unwrap_err().cause().is_wrapped());
    assert!(matches!(composed.get(), Err(StageError::Failed(_))));
}

#[test]
fn test_rejected_async_stage_fails_at_once() {
    let scheduler = Scheduler::new(1);
    scheduler.shutdown();
    let stage = Stage::supply_async_on(|| 1, scheduler.clone());
    assert!(stage.is_done());
    assert!(matches!(
        stage.get(),
        Err(StageError::Rejected(RejectedError::Shutdown))
    ));

    let dependent = Stage::completed(1).then_apply_async_on(|x| x + 1, scheduler);
    assert!(matches!(
        dependent.get(),
        Err(StageError::Rejected(RejectedError::Shutdown))
    ));
}

// ============================================================================
// Races
// ============================================================================

#[test]
fn test_racing_completers_have_one_winner() {
    const THREADS: usize = 8;
    for _ in 0..50 {
        let stage: Stage<usize> = Stage::new();
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let stage = stage.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let won = match i {
                        0 => stage.cancel(),
                        1 => stage.complete_exceptionally(StageError::failed(UpstreamBroke)),
                        _ => stage.complete(i),
                    };
                    (i, won)
                })
            })
            .collect();
        let winners: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(_, won)| *won)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(winners.len(), 1);
        assert!(stage.is_done());
        match winners[0] {
            0 => assert!(stage.is_cancelled()),
            1 => assert!(matches!(stage.get(), Err(StageError::Failed(_)))),
            i => assert_eq!(stage.join().unwrap(), i),
        }
    }
}

#[test]
fn test_registration_racing_completion_always_fires() {
    for _ in 0..500 {
        let source: Stage<u32> = Stage::new();
        let completer = source.clone();
        let handle = thread::spawn(move || completer.complete(7));
        let dependent = source.then_apply(|x| x + 1);
        handle.join().unwrap();
        assert_eq!(dependent.get_timeout(Duration::from_secs(10)).unwrap(), 8);
    }
}

#[test]
fn test_combine_action_runs_once_under_races() {
    for _ in 0..500 {
        let a: Stage<u32> = Stage::new();
        let b: Stage<u32> = Stage::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let sum = a.then_combine(&b, move |x, y| {
            counter.fetch_add(1, Ordering::SeqCst);
            x + y
        });
        let barrier = Arc::new(Barrier::new(2));
        let (a2, b2) = (a.clone(), b.clone());
        let (ba, bb) = (Arc::clone(&barrier), Arc::clone(&barrier));
        let t1 = thread::spawn(move || {
            ba.wait();
            a2.complete(1);
        });
        let t2 = thread::spawn(move || {
            bb.wait();
            b2.complete(2);
        });
        t1.join().unwrap();
        t2.join().unwrap();
        assert_eq!(sum.join().unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}

// ============================================================================
// All and Any
// ============================================================================

#[test]
fn test_all_of_with_one_failure() {
    let f1: Stage<u8> = Stage::new();
    let f2: Stage<u8> = Stage::new();
    let f3: Stage<u8> = Stage::new();
    let all = all_of(&[f1.clone(), f2.clone(), f3.clone()]);
    f1.complete(1);
    f2.complete_exceptionally(StageError::failed(UpstreamBroke));
    f3.complete(3);
    let err = all.join().unwrap_err();
    assert!(err.is_wrapped());
    assert!(matches!(err.cause(), StageError::Failed(_)));
    assert_eq!(f1.join().unwrap(), 1);
    assert_eq!(f3.join().unwrap(), 3);
}

#[test]
fn test_any_of_keeps_first_value() {
    let f1: Stage<&str> = Stage::new();
    let f2: Stage<&str> = Stage::new();
    let any = any_of(&[f1.clone(), f2.clone()]);
    f1.complete("x");
    f2.complete_exceptionally(StageError::failed(UpstreamBroke));
    assert_eq!(any.join().unwrap(), "x");
}

#[test]
fn test_all_of_mixed_types_through_to_unit() {
    let n: Stage<u32> = Stage::completed(1);
    let s: Stage<String> = Stage::new();
    let all = all_of(&[n.to_unit(), s.to_unit()]);
    assert!(!all.is_done());
    s.complete("ok".into());
    assert!(all.join().is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_combined_sum_ignores_completion_order(
        order in Just((0..24usize).collect::<Vec<_>>()).prop_shuffle(),
        values in proptest::collection::vec(0u64..1_000, 24),
    ) {
        let stages: Vec<Stage<u64>> = (0..values.len()).map(|_| Stage::new()).collect();
        let total = stages
            .iter()
            .skip(1)
            .fold(stages[0].clone(), |acc, s| acc.then_combine(s, |a, b| a + b));
        let all = all_of(&stages);
        for i in order {
            prop_assert!(!total.is_done());
            stages[i].complete(values[i]);
        }
        prop_assert!(all.is_done());
        prop_assert_eq!(total.join().unwrap(), values.iter().sum::<u64>());
    }
}

// ============================================================================
// Release
// ============================================================================

/// Raises its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn eventually(flag: &AtomicBool) -> bool {
    for _ in 0..10_000 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        crossbeam::epoch::pin().flush();
        thread::yield_now();
    }
    false
}

#[test]
fn test_abandoned_stage_releases_its_continuations() {
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = DropFlag(Arc::clone(&dropped));
    let source: Stage<u32> = Stage::new();
    let tail = source
        .then_apply(move |x| {
            let _flag = &flag;
            x + 1
        })
        .then_accept(|_| ());
    drop(tail);
    assert!(!dropped.load(Ordering::SeqCst));
    drop(source);
    assert!(eventually(&dropped));
}

#[test]
fn test_completer_handle_keeps_graph_alive() {
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = DropFlag(Arc::clone(&dropped));
    let source: Stage<u32> = Stage::new();
    let completer = source.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    drop(source.then_accept(move |x| {
        let _flag = &flag;
        counter.store(x as usize, Ordering::SeqCst);
    }));
    drop(source);
    completer.complete(5);
    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert!(eventually(&dropped));
}

// ============================================================================
// Executors
// ============================================================================

#[test]
fn test_async_variants_run_on_their_executor() {
    let executor = ThreadPerTaskExecutor::named("stage-test");
    let name = Stage::completed(())
        .then_apply_async_on(|()| thread::current().name().map(str::to_owned), executor);
    assert_eq!(name.join().unwrap().as_deref(), Some("stage-test"));

    let doubled = Stage::supply_async(|| 21).then_apply_async(|x| x * 2);
    assert_eq!(doubled.join().unwrap(), 42);

    let scheduler = Scheduler::new(2);
    let handled = Stage::<i32>::failed(StageError::Cancelled)
        .handle_async_on(|r| r.is_err(), scheduler.clone());
    assert!(handled.join().unwrap());
    let ran = Stage::<()>::run_async_on(|| (), scheduler);
    assert!(ran.join().is_ok());
}
