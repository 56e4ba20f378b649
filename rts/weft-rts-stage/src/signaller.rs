//! Blocking waits on a stage.
//!
//! A waiter spins briefly, then pushes a [`Signaller`] onto the stage's stack
//! and parks. Completing the stage fires the signaller, which unparks the
//! waiter. Parking goes through [`managed_block`], so a waiter on a
//! scheduler worker gets a spare started in its place.

use crate::stack::{clean_stack, post_complete, Completion, Mode, StageCore};
use crossbeam::sync::{Parker, Unparker};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use weft_rts_scheduler::{env_override, managed_block, ManagedBlocker};

/// Environment variable overriding the spin count before parking.
pub const ENV_WAIT_SPINS: &str = "WEFT_STAGE_SPINS";

/// Default spins before parking on a multiprocessor.
pub const DEFAULT_WAIT_SPINS: u32 = 256;

const UNSET: u32 = u32::MAX;

static WAIT_SPINS: AtomicU32 = AtomicU32::new(UNSET);

fn default_wait_spins() -> u32 {
    match env_override::<u32>(ENV_WAIT_SPINS) {
        Ok(Some(spins)) => return spins.min(UNSET - 1),
        Ok(None) => {}
        Err(err) => tracing::warn!(%err, "ignoring stage override"),
    }
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cpus > 1 {
        DEFAULT_WAIT_SPINS
    } else {
        0
    }
}

/// Spins a waiter makes before it parks.
#[must_use]
pub fn wait_spins() -> u32 {
    let spins = WAIT_SPINS.load(Ordering::Relaxed);
    if spins != UNSET {
        return spins;
    }
    let spins = default_wait_spins();
    match WAIT_SPINS.compare_exchange(UNSET, spins, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => spins,
        Err(current) => current,
    }
}

/// Set the spins a waiter makes before it parks. Zero parks at once.
pub fn set_wait_spins(spins: u32) {
    WAIT_SPINS.store(spins.min(UNSET - 1), Ordering::Relaxed);
}

/// A parked waiter, registered on a stage's stack.
pub(crate) struct Signaller {
    unparker: Unparker,
    live: AtomicBool,
    deadline: Option<Instant>,
}

impl Signaller {
    fn release(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn is_releasable(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.release();
            return true;
        }
        false
    }
}

impl Completion for Signaller {
    fn try_fire(self: Arc<Self>, _mode: Mode) -> Option<Arc<dyn StageCore>> {
        if self.live.swap(false, Ordering::AcqRel) {
            self.unparker.unpark();
        }
        None
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

struct Wait<'a> {
    signaller: &'a Signaller,
    parker: &'a Parker,
}

impl ManagedBlocker for Wait<'_> {
    fn block(&mut self) -> bool {
        if self.signaller.is_releasable() {
            return true;
        }
        match self.signaller.deadline {
            None => self.parker.park(),
            Some(deadline) => self.parker.park_deadline(deadline),
        }
        self.signaller.is_releasable()
    }

    fn is_releasable(&mut self) -> bool {
        self.signaller.is_releasable()
    }
}

/// Block until `stage` completes or `deadline` passes. Returns whether the
/// stage completed.
///
/// A timed-out waiter is removed from the stack before returning.
pub(crate) fn wait(stage: &Arc<dyn StageCore>, deadline: Option<Instant>) -> bool {
    let mut spins = if deadline.is_none() { wait_spins() } else { 0 };
    while spins > 0 && !stage.is_done() {
        spins -= 1;
        std::hint::spin_loop();
    }
    if stage.is_done() {
        post_complete(stage);
        return true;
    }

    let parker = Parker::new();
    let signaller = Arc::new(Signaller {
        unparker: parker.unparker().clone(),
        live: AtomicBool::new(true),
        deadline,
    });
    stage.stack().push(Arc::clone(&signaller) as Arc<dyn Completion>);

    while !stage.is_done() {
        if !signaller.is_live() {
            // Timed out: take the waiter off the stack.
            clean_stack(stage);
            return stage.is_done();
        }
        let mut waiter = Wait {
            signaller: &signaller,
            parker: &parker,
        };
        if let Err(err) = managed_block(&mut waiter) {
            tracing::warn!(%err, "waiting on stage without a spare worker");
            while !waiter.is_releasable() && !waiter.block() {}
        }
    }
    signaller.release();
    post_complete(stage);
    true
}
