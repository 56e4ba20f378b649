//! Blocking waits: parking, timeouts and waiting from scheduler workers.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use weft_rts_scheduler::Scheduler;
use weft_rts_stage::{set_wait_spins, Stage, StageError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_timed_get_gives_up_and_unregisters() {
    let never: Stage<u32> = Stage::new();
    let started = Instant::now();
    assert!(matches!(
        never.get_timeout(Duration::from_millis(50)),
        Err(StageError::Timeout)
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(never.dependents(), 0);
    assert!(!never.is_done());
}

#[test]
fn test_timed_get_keeps_other_dependents() {
    let never: Stage<u32> = Stage::new();
    let dependent = never.then_apply(|x| x + 1);
    assert!(never.get_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(never.dependents(), 1);
    never.complete(1);
    assert_eq!(dependent.join().unwrap(), 2);
}

#[test]
fn test_zero_timeout_on_complete_stage() {
    let done = Stage::completed(3);
    assert_eq!(done.get_timeout(Duration::ZERO).unwrap(), 3);
    let pending: Stage<u8> = Stage::new();
    assert!(matches!(pending.get_timeout(Duration::ZERO), Err(StageError::Timeout)));
}

#[test]
fn test_parked_waiters_wake_on_completion() {
    set_wait_spins(0);
    let stage: Stage<String> = Stage::new();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let stage = stage.clone();
            thread::spawn(move || stage.join())
        })
        .collect();
    // Let the waiters park.
    thread::sleep(Duration::from_millis(50));
    stage.complete("awake".to_string());
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap(), "awake");
    }
    assert_eq!(stage.dependents(), 0);
}

#[test]
fn test_get_timeout_returns_value_in_time() {
    let stage: Stage<u8> = Stage::new();
    let completer = stage.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        completer.complete(9)
    });
    assert_eq!(stage.get_timeout(Duration::from_secs(10)).unwrap(), 9);
    assert!(handle.join().unwrap());
}

#[test]
fn test_get_now_does_not_block() {
    let stage: Stage<u8> = Stage::new();
    assert_eq!(stage.get_now(5).unwrap(), 5);
    stage.cancel();
    assert!(matches!(stage.get_now(5), Err(StageError::Cancelled)));
}

#[test]
fn test_join_inside_single_worker_is_compensated() {
    init_tracing();
    let scheduler = Scheduler::new(1);
    let inner = scheduler.clone();
    let (tx, rx) = mpsc::channel();
    scheduler
        .execute(move || {
            // The only worker blocks here; the supplier needs a spare.
            let value = Stage::supply_async_on(|| 6 * 7, inner).join();
            let _ = tx.send(value);
        })
        .unwrap();
    let value = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(value.unwrap(), 42);
}
