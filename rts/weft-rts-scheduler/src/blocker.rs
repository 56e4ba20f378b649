//! Blocking inside tasks without starving the scheduler.

use crate::error::RejectedError;
use crate::pool::Pool;
use crate::worker;
use crossbeam::utils::Backoff;
use std::sync::Arc;

/// A wait that may block a worker thread.
///
/// `block` is called repeatedly until it or `is_releasable` returns `true`.
/// Implementations typically wrap a lock or condition variable.
pub trait ManagedBlocker {
    /// Block the calling thread if needed. Returns `true` once no further
    /// blocking is necessary.
    fn block(&mut self) -> bool;

    /// Whether blocking is unnecessary right now.
    fn is_releasable(&mut self) -> bool;
}

/// Restores the active count taken by compensation, even on unwind.
struct Reactivate<'a>(&'a Pool);

impl Drop for Reactivate<'_> {
    fn drop(&mut self) {
        self.0.reactivate();
    }
}

/// Run `blocker` until released.
///
/// On a worker thread a spare worker is woken or started first, so the
/// scheduler keeps its target parallelism while this thread waits. Fails
/// only if no spare can be started because the spare limit is reached.
pub fn managed_block<B: ManagedBlocker + ?Sized>(blocker: &mut B) -> Result<(), RejectedError> {
    let own = worker::with_current(|ctx| ctx.map(|w| (Arc::clone(&w.pool), Arc::clone(&w.queue))));
    let Some((pool, queue)) = own else {
        while !blocker.is_releasable() && !blocker.block() {}
        return Ok(());
    };
    let backoff = Backoff::new();
    while !blocker.is_releasable() {
        if pool.try_compensate(&queue)? {
            let _reactivate = Reactivate(&pool);
            queue.set_parked(true);
            while !blocker.is_releasable() && !blocker.block() {}
            queue.set_parked(false);
            break;
        }
        backoff.snooze();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        remaining: usize,
        blocks: usize,
    }

    impl ManagedBlocker for Countdown {
        fn block(&mut self) -> bool {
            self.blocks += 1;
            self.remaining = self.remaining.saturating_sub(1);
            self.remaining == 0
        }

        fn is_releasable(&mut self) -> bool {
            self.remaining == 0
        }
    }

    #[test]
    fn test_blocks_until_released_outside_worker() {
        let mut blocker = Countdown {
            remaining: 3,
            blocks: 0,
        };
        managed_block(&mut blocker).unwrap();
        assert_eq!(blocker.blocks, 3);
    }

    #[test]
    fn test_releasable_blocker_never_blocks() {
        let mut blocker = Countdown {
            remaining: 0,
            blocks: 0,
        };
        managed_block(&mut blocker).unwrap();
        assert_eq!(blocker.blocks, 0);
    }
}
