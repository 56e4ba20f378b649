//! Trace hook delivery. Kept in its own test binary because the callback is
//! process-wide.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use weft_rts_scheduler::{clear_trace_callback, set_trace_callback, Scheduler, TraceEvent};

#[test]
fn test_lifecycle_events_are_traced() {
    let events: Arc<Mutex<Vec<TraceEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    set_trace_callback(Box::new(move |event| {
        sink.lock().unwrap().push(event);
    }));

    let scheduler = Scheduler::new(2);
    let id = scheduler.id();
    let tasks: Vec<_> = (0..8).map(|i| scheduler.spawn(move || i).unwrap()).collect();
    for task in &tasks {
        task.join().unwrap();
    }
    scheduler.shutdown();
    assert!(scheduler.await_termination(Duration::from_secs(10)));
    // The exit event follows deregistration, which can trail termination.
    std::thread::sleep(Duration::from_millis(100));
    clear_trace_callback();

    let names: Vec<&str> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::WorkerStart { pool, .. } if *pool == id => Some("start"),
            TraceEvent::WorkerExit { pool, .. } if *pool == id => Some("exit"),
            TraceEvent::Shutdown { pool, now, .. } if *pool == id => {
                assert!(!now);
                Some("shutdown")
            }
            TraceEvent::Terminated { pool, .. } if *pool == id => Some("terminated"),
            _ => None,
        })
        .collect();

    assert!(names.contains(&"start"));
    assert!(names.contains(&"exit"));
    assert_eq!(names.iter().filter(|n| **n == "shutdown").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "terminated").count(), 1);
    let shutdown_at = names.iter().position(|n| *n == "shutdown").unwrap();
    let terminated_at = names.iter().position(|n| *n == "terminated").unwrap();
    assert!(shutdown_at < terminated_at);
}
