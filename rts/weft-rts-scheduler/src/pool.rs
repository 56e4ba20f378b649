//! The work-stealing pool: worker lifecycle, signalling, stealing, helping,
//! compensation and termination.
//!
//! Queues live in a table indexed by the low bits of their config. Workers
//! own odd slots; submission queues from non-worker threads take even slots
//! chosen by the caller's queue hint. The table itself is copy-on-write and only
//! replaced under `lock`; everything else goes through atomics.
//!
//! Idle workers form a Treiber stack threaded through `stack_pred`, with the
//! top kept in the low half of `ctl` (see [`crate::ctl`]).

use crate::config::SchedulerConfig;
use crate::ctl::{
    active_delta, initial_ctl, stack_index, stack_top, total_delta, AC_MASK, AC_UNIT,
    ADD_WORKER, EVENMASK, INACTIVE, MAX_CAP, SCANNING, SHUTDOWN, SMASK, SP_MASK, SQMASK,
    SS_SEQ, STARTED, STOP, TC_MASK, TC_UNIT, TERMINATED, UC_MASK,
};
use crate::deque::{Steal, WorkQueue};
use crate::error::RejectedError;
use crate::task::{do_exec, JobRef};
use crate::{trace, worker, PoolId, TraceEvent};
use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Increment for seeds of worker queue indices.
const SEED_INCREMENT: i32 = 0x9e37_79b9_u32 as i32;

/// Tolerance for an idle timeout that fired slightly early.
const TIMEOUT_SLOP: Duration = Duration::from_millis(20);

pub(crate) type QueueTable = Arc<[Option<Arc<WorkQueue>>]>;

fn queue_at(ws: &[Option<Arc<WorkQueue>>], index: usize) -> Option<&WorkQueue> {
    ws.get(index).and_then(|q| q.as_deref())
}

pub(crate) struct Pool {
    id: PoolId,
    ctl: CachePadded<AtomicI64>,
    run_state: AtomicI32,
    /// Guards table replacement and run-state transitions.
    lock: Mutex<()>,
    termination: Condvar,
    queues: Atomic<QueueTable>,
    index_seed: AtomicI32,
    /// Steals of retired workers.
    steal_count: AtomicU64,
    parallelism: i32,
    config: SchedulerConfig,
    common: bool,
}

impl Pool {
    pub(crate) fn new(config: SchedulerConfig, common: bool) -> Arc<Self> {
        let p = config.parallelism as i32;
        let n = if p > 1 { (p - 1) as usize } else { 1 };
        let size = (n + 1).next_power_of_two() << 1;
        let table: QueueTable = vec![None; size].into();
        let pool = Arc::new(Self {
            id: PoolId::new(),
            ctl: CachePadded::new(AtomicI64::new(initial_ctl(p))),
            run_state: AtomicI32::new(STARTED),
            lock: Mutex::new(()),
            termination: Condvar::new(),
            queues: Atomic::new(table),
            index_seed: AtomicI32::new(0),
            steal_count: AtomicU64::new(0),
            parallelism: p,
            config,
            common,
        });
        tracing::debug!(pool = %pool.id, parallelism = p, common, "created scheduler");
        pool
    }

    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn is_common(&self) -> bool {
        self.common
    }

    pub(crate) fn parallelism(&self) -> usize {
        self.parallelism as usize
    }

    #[inline]
    fn ctl(&self) -> i64 {
        self.ctl.load(Ordering::SeqCst)
    }

    #[inline]
    fn cas_ctl(&self, c: i64, nc: i64) -> bool {
        self.ctl
            .compare_exchange(c, nc, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    fn run_state(&self) -> i32 {
        self.run_state.load(Ordering::SeqCst)
    }

    /// Current queue table.
    pub(crate) fn queues(&self) -> QueueTable {
        let guard = epoch::pin();
        // SAFETY: the table pointer is never null and old tables are retired
        // through the epoch collector.
        unsafe { self.queues.load(Ordering::Acquire, &guard).deref() }.clone()
    }

    fn publish(&self, _lock: &MutexGuard<'_, ()>, table: Vec<Option<Arc<WorkQueue>>>) {
        let guard = epoch::pin();
        let old = self
            .queues
            .swap(Owned::new(QueueTable::from(table)), Ordering::AcqRel, &guard);
        // SAFETY: replaced under the lock, so nobody else retires `old`.
        unsafe { guard.defer_destroy(old) };
    }

    // ========================================================================
    // Worker Lifecycle
    // ========================================================================

    /// Wake an idle worker or add one if too few are active.
    pub(crate) fn signal_work(self: &Arc<Self>, ws: &[Option<Arc<WorkQueue>>], q: Option<&WorkQueue>) {
        loop {
            let c = self.ctl();
            if c >= 0 {
                break;
            }
            let sp = stack_top(c);
            if sp == 0 {
                if c & ADD_WORKER != 0 {
                    self.try_add_worker(c);
                }
                break;
            }
            let Some(v) = queue_at(ws, stack_index(sp, SMASK as usize)) else {
                break;
            };
            let vs = sp.wrapping_add(SS_SEQ) & !INACTIVE;
            let d = sp.wrapping_sub(v.scan_state());
            let nc = (UC_MASK & c.wrapping_add(AC_UNIT)) | (SP_MASK & i64::from(v.stack_pred()));
            if d == 0 && self.cas_ctl(c, nc) {
                v.scan_state.store(vs, Ordering::SeqCst);
                v.unpark();
                break;
            }
            if q.is_some_and(|q| q.base() == q.top()) {
                break;
            }
        }
    }

    fn try_add_worker(self: &Arc<Self>, mut c: i64) {
        loop {
            let nc = (AC_MASK & c.wrapping_add(AC_UNIT)) | (TC_MASK & c.wrapping_add(TC_UNIT));
            if self.ctl() == c {
                let (stopping, added) = {
                    let _lock = self.lock.lock();
                    let stopping = self.run_state() & STOP != 0;
                    (stopping, !stopping && self.cas_ctl(c, nc))
                };
                if stopping {
                    break;
                }
                if added {
                    if let Err(err) = self.create_worker() {
                        tracing::warn!(pool = %self.id, %err, "could not add worker");
                    }
                    break;
                }
            }
            c = self.ctl();
            if c & ADD_WORKER == 0 || stack_top(c) != 0 {
                break;
            }
        }
    }

    /// Start a worker thread. Counts must already include it.
    fn create_worker(self: &Arc<Self>) -> Result<(), RejectedError> {
        let parker = Parker::new();
        let queue = self.register_worker(parker.unparker().clone());
        let name = format!("{}-{}", self.config.thread_name_prefix, queue.index() >> 1);
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let pool = Arc::clone(self);
        let owned = Arc::clone(&queue);
        match builder.spawn(move || worker::run(pool, owned, parker)) {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = RejectedError::Spawn(Arc::new(err));
                tracing::error!(pool = %self.id, %err, "worker thread failed to start");
                self.deregister_worker(&queue, Some(&err));
                Err(err)
            }
        }
    }

    /// Give a new worker a queue at a free odd index, doubling the table if
    /// it is full.
    fn register_worker(&self, unparker: Unparker) -> Arc<WorkQueue> {
        let lock = self.lock.lock();
        let seed = self
            .index_seed
            .fetch_add(SEED_INCREMENT, Ordering::Relaxed)
            .wrapping_add(SEED_INCREMENT);
        let mut table = self.queues().to_vec();
        let mut n = table.len();
        let mut m = n - 1;
        let mut i = ((seed << 1) | 1) as u32 as usize & m;
        if table[i].is_some() {
            let mut visited = 0;
            let step = if n <= 4 {
                2
            } else {
                ((n >> 1) & EVENMASK as usize) + 2
            };
            loop {
                i = (i + step) & m;
                if table[i].is_none() {
                    break;
                }
                visited += 1;
                if visited >= n {
                    n <<= 1;
                    table.resize(n, None);
                    m = n - 1;
                    visited = 0;
                }
            }
        }
        let queue = Arc::new(WorkQueue::new_worker(
            i,
            self.config.async_mode,
            seed,
            unparker,
        ));
        table[i] = Some(Arc::clone(&queue));
        self.publish(&lock, table);
        queue
    }

    /// Remove an exiting worker, then help terminate or replace it.
    pub(crate) fn deregister_worker(self: &Arc<Self>, w: &Arc<WorkQueue>, err: Option<&RejectedError>) {
        {
            let lock = self.lock.lock();
            let current = self.queues();
            let idx = w.index();
            if current
                .get(idx)
                .and_then(Option::as_ref)
                .is_some_and(|q| Arc::ptr_eq(q, w))
            {
                let mut table = current.to_vec();
                table[idx] = None;
                self.publish(&lock, table);
            }
        }
        let mut c = self.ctl();
        loop {
            let nc = (AC_MASK & c.wrapping_sub(AC_UNIT))
                | (TC_MASK & c.wrapping_sub(TC_UNIT))
                | (SP_MASK & c);
            match self
                .ctl
                .compare_exchange(c, nc, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => c = current,
            }
        }
        w.terminate();
        self.steal_count.fetch_add(w.steals(), Ordering::Relaxed);
        w.cancel_all();
        loop {
            if self.try_terminate(false, false) || self.run_state() & STOP != 0 {
                break;
            }
            let ws = self.queues();
            let c = self.ctl();
            let sp = stack_top(c);
            if sp != 0 {
                match queue_at(&ws, stack_index(sp, ws.len() - 1)) {
                    Some(v) if self.try_release(c, Some(v), AC_UNIT) => break,
                    Some(_) => {}
                    None => break,
                }
            } else {
                if err.is_some() && c & ADD_WORKER != 0 {
                    self.try_add_worker(c);
                }
                break;
            }
        }
    }

    /// Top-level loop of a worker thread.
    pub(crate) fn run_worker(self: &Arc<Self>, w: &Arc<WorkQueue>, parker: &Parker) {
        let seed = w.hint.load(Ordering::Relaxed) as u32;
        let mut r = if seed == 0 { 1 } else { seed };
        loop {
            if let Some(job) = self.scan(w, r) {
                w.run_task(job);
            } else if !self.await_work(w, parker, &mut r) {
                break;
            }
            r ^= r << 13;
            r ^= r >> 17;
            r ^= r << 5;
        }
    }

    /// Look for a job to steal, starting at a random queue.
    ///
    /// A worker that sweeps every queue twice with the same checksum of
    /// bases inactivates and pushes itself on the idle stack, then keeps
    /// scanning until it sees a stable sweep while inactive.
    fn scan(self: &Arc<Self>, w: &WorkQueue, mut r: u32) -> Option<JobRef> {
        let ws = self.queues();
        let len = ws.len();
        if len <= 1 {
            return None;
        }
        let m = len - 1;
        let mut ss = w.scan_state();
        let mut origin = r as usize & m;
        let mut k = origin;
        let mut old_sum: i32 = 0;
        let mut check_sum: i32 = 0;
        loop {
            if let Some(q) = &ws[k] {
                let b = q.base();
                let n = b.wrapping_sub(q.top());
                if n < 0 {
                    match q.steal_at(b, ss >= 0) {
                        Steal::Taken(job) => {
                            if n < -1 {
                                self.signal_work(&ws, Some(q));
                            }
                            return Some(job);
                        }
                        Steal::Present => {
                            if old_sum == 0 && w.scan_state() < 0 {
                                let c = self.ctl();
                                self.try_release(c, queue_at(&ws, stack_index(stack_top(c), m)), AC_UNIT);
                            }
                        }
                        Steal::Empty | Steal::Retry => {}
                    }
                    if ss < 0 {
                        ss = w.scan_state();
                    }
                    r ^= r << 1;
                    r ^= r >> 3;
                    r ^= r << 10;
                    origin = r as usize & m;
                    k = origin;
                    old_sum = 0;
                    check_sum = 0;
                    continue;
                }
                check_sum = check_sum.wrapping_add(b);
            }
            k = (k + 1) & m;
            if k == origin {
                let settled = if ss >= 0 {
                    true
                } else {
                    let current = w.scan_state();
                    let same = ss == current;
                    ss = current;
                    same
                };
                if settled {
                    let stable = old_sum == check_sum;
                    old_sum = check_sum;
                    if stable {
                        if ss < 0 || w.qlock() < 0 {
                            return None;
                        }
                        let ns = ss | INACTIVE;
                        let c = self.ctl();
                        let nc = (SP_MASK & i64::from(ns)) | (UC_MASK & c.wrapping_sub(AC_UNIT));
                        w.stack_pred.store(stack_top(c), Ordering::Release);
                        w.scan_state.store(ns, Ordering::SeqCst);
                        if self.cas_ctl(c, nc) {
                            ss = ns;
                        } else {
                            w.scan_state.store(ss, Ordering::SeqCst);
                        }
                    }
                }
                check_sum = 0;
            }
        }
    }

    /// Park an inactive worker until signalled.
    ///
    /// Returns `false` if the worker should exit: the pool is stopping, the
    /// worker is a surplus spare, or it was the last idle worker and its
    /// keep-alive elapsed.
    fn await_work(self: &Arc<Self>, w: &WorkQueue, parker: &Parker, r: &mut u32) -> bool {
        if w.qlock() < 0 {
            return false;
        }
        let pred = w.stack_pred();
        let mut spins = self.config.idle_spins;
        loop {
            let ss = w.scan_state();
            if ss >= 0 {
                return true;
            }
            if spins > 0 {
                *r ^= *r << 6;
                *r ^= *r >> 21;
                *r ^= *r << 7;
                if *r as i32 >= 0 {
                    spins -= 1;
                    if spins == 0 && pred != 0 {
                        let ws = self.queues();
                        if let Some(v) = queue_at(&ws, (pred & SMASK) as usize) {
                            if !v.is_parked() || v.scan_state() >= 0 {
                                spins = self.config.idle_spins;
                            }
                        }
                    }
                }
                continue;
            }
            if w.qlock() < 0 {
                return false;
            }
            let c = self.ctl();
            let ac = active_delta(c) + self.parallelism;
            if (ac <= 0 && self.try_terminate(false, false)) || self.run_state() & STOP != 0 {
                return false;
            }
            let mut timed = None;
            if ac <= 0 && ss == stack_top(c) {
                let prevctl = (UC_MASK & c.wrapping_add(AC_UNIT)) | (SP_MASK & i64::from(pred));
                let t = total_delta(c);
                if t > 2 && self.cas_ctl(c, prevctl) {
                    tracing::debug!(pool = %self.id, worker = w.index() >> 1, "retiring surplus worker");
                    return false;
                }
                let scale = if t >= 0 { 1 } else { (1 - t) as u32 };
                let park_time = self.config.keep_alive.saturating_mul(scale);
                let deadline = Instant::now() + park_time.saturating_sub(TIMEOUT_SLOP);
                timed = Some((prevctl, park_time, deadline));
            }
            w.set_parked(true);
            if w.scan_state() < 0 && self.ctl() == c {
                trace(TraceEvent::WorkerPark {
                    pool: self.id,
                    worker: w.index() >> 1,
                    timestamp: Instant::now(),
                });
                match timed {
                    Some((_, park_time, _)) => parker.park_timeout(park_time),
                    None => parker.park(),
                }
            }
            w.set_parked(false);
            if w.scan_state() >= 0 {
                return true;
            }
            if let Some((prevctl, _, deadline)) = timed {
                if self.ctl() == c && Instant::now() >= deadline && self.cas_ctl(c, prevctl) {
                    tracing::debug!(pool = %self.id, worker = w.index() >> 1, "idle worker timed out");
                    return false;
                }
            }
        }
    }

    /// Pop the idle stack if its top is `v`, adding `inc` to the active
    /// count, and wake it.
    fn try_release(&self, c: i64, v: Option<&WorkQueue>, inc: i64) -> bool {
        let sp = stack_top(c);
        let Some(v) = v else {
            return false;
        };
        if v.scan_state() != sp {
            return false;
        }
        let vs = sp.wrapping_add(SS_SEQ) & !INACTIVE;
        let nc = (UC_MASK & c.wrapping_add(inc)) | (SP_MASK & i64::from(v.stack_pred()));
        if self.cas_ctl(c, nc) {
            v.scan_state.store(vs, Ordering::SeqCst);
            v.unpark();
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Joining
    // ========================================================================

    /// Push on a worker's own queue and signal if it was nearly empty.
    pub(crate) fn push_local(self: &Arc<Self>, w: &WorkQueue, job: JobRef) -> Result<(), RejectedError> {
        if w.push(job)? {
            let ws = self.queues();
            self.signal_work(&ws, Some(w));
        }
        Ok(())
    }

    /// Help or block until `task` is done or `deadline` passes.
    pub(crate) fn await_join(
        self: &Arc<Self>,
        w: &Arc<WorkQueue>,
        task: &JobRef,
        deadline: Option<Instant>,
    ) -> Result<i32, RejectedError> {
        let prev = w.replace_current_join(Some(task.clone()));
        let completer = task.is_completer();
        let backoff = Backoff::new();
        let result = loop {
            let s = task.header().status();
            if s < 0 {
                break Ok(s);
            }
            if completer {
                self.help_complete(w, task, 0);
            } else if w.base() == w.top() || w.try_remove_and_exec(task) {
                self.help_stealer(w, task);
            }
            let s = task.header().status();
            if s < 0 {
                break Ok(s);
            }
            let wait = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break Ok(s);
                    }
                    Some((d - now).max(Duration::from_millis(1)))
                }
            };
            match self.try_compensate(w) {
                Ok(true) => {
                    w.set_parked(true);
                    task.header().internal_wait(wait);
                    w.set_parked(false);
                    self.ctl.fetch_add(AC_UNIT, Ordering::SeqCst);
                    backoff.reset();
                }
                Ok(false) => backoff.snooze(),
                Err(err) => break Err(err),
            }
        };
        w.replace_current_join(prev);
        result
    }

    /// Find the worker that stole `task` (or whatever it in turn is joining)
    /// and run jobs from its queue until `task` completes or no progress is
    /// possible.
    fn help_stealer(&self, w: &Arc<WorkQueue>, task: &JobRef) {
        let ws = self.queues();
        if ws.len() <= 1 {
            return;
        }
        let m = ws.len() - 1;
        let mut old_sum: i32 = 0;
        loop {
            let mut check_sum: i32 = 0;
            let mut subtask = task.clone();
            let mut j: Arc<WorkQueue> = Arc::clone(w);
            'descent: while subtask.header().status() >= 0 {
                let h = (j.hint.load(Ordering::Relaxed) | 1) as u32 as usize;
                let mut k = 0;
                let stealer = loop {
                    if k > m {
                        break None;
                    }
                    let i = h.wrapping_add(k) & m;
                    if let Some(v) = &ws[i] {
                        if v.current_steal_is(&subtask) {
                            j.hint.store(i as i32, Ordering::Relaxed);
                            break Some(Arc::clone(v));
                        }
                        check_sum = check_sum.wrapping_add(v.base());
                    }
                    k += 2;
                };
                let Some(v) = stealer else {
                    break 'descent;
                };
                loop {
                    let b = v.base();
                    check_sum = check_sum.wrapping_add(b);
                    let next = v.current_join();
                    if subtask.header().status() < 0
                        || !j.current_join_is(&subtask)
                        || !v.current_steal_is(&subtask)
                    {
                        break 'descent;
                    }
                    if b.wrapping_sub(v.top()) >= 0 {
                        match next {
                            Some(next) => {
                                subtask = next;
                                j = v;
                                continue 'descent;
                            }
                            None => break 'descent,
                        }
                    }
                    match v.steal_at(b, true) {
                        Steal::Taken(mut t) => {
                            let ps = w.current_steal();
                            let top = w.top();
                            loop {
                                w.replace_current_steal(Some(t.clone()));
                                do_exec(&t);
                                if task.header().status() < 0 || w.top() == top {
                                    break;
                                }
                                match w.pop() {
                                    Some(next) => t = next,
                                    None => break,
                                }
                            }
                            w.replace_current_steal(ps);
                            if w.base() != w.top() {
                                return;
                            }
                        }
                        Steal::Empty => break 'descent,
                        Steal::Present | Steal::Retry => {}
                    }
                }
            }
            if task.header().status() < 0 || old_sum == check_sum {
                break;
            }
            old_sum = check_sum;
        }
    }

    /// Run jobs from the completion tree of `task` found on top of `w` or
    /// at the base of other queues.
    ///
    /// Stops after `max_tasks` jobs if nonzero. Returns the task status.
    pub(crate) fn help_complete(&self, w: &WorkQueue, task: &JobRef, mut max_tasks: i32) -> i32 {
        let ws = self.queues();
        if ws.is_empty() {
            return 0;
        }
        let m = ws.len() - 1;
        let mut r = (w.hint.load(Ordering::Relaxed) ^ w.top()) as u32;
        let mut origin = r as usize & m;
        let mut k = origin;
        let mut h = 1;
        let mut old_sum: i32 = 0;
        let mut check_sum: i32 = 0;
        loop {
            let s = task.header().status();
            if s < 0 {
                return s;
            }
            let popped = if h == 1 { w.pop_cc(task) } else { None };
            if let Some(p) = popped {
                do_exec(&p);
                if max_tasks != 0 {
                    max_tasks -= 1;
                    if max_tasks == 0 {
                        return task.header().status();
                    }
                }
                origin = k;
                old_sum = 0;
                check_sum = 0;
                continue;
            }
            h = match &ws[k] {
                None => 0,
                Some(q) => q.poll_and_exec_cc(task),
            };
            if h < 0 {
                check_sum = check_sum.wrapping_add(h);
            }
            if h > 0 {
                if h == 1 && max_tasks != 0 {
                    max_tasks -= 1;
                    if max_tasks == 0 {
                        return task.header().status();
                    }
                }
                r ^= r << 13;
                r ^= r >> 17;
                r ^= r << 5;
                origin = r as usize & m;
                k = origin;
                old_sum = 0;
                check_sum = 0;
            } else {
                k = (k + 1) & m;
                if k == origin {
                    if old_sum == check_sum {
                        return task.header().status();
                    }
                    old_sum = check_sum;
                    check_sum = 0;
                }
            }
        }
    }

    /// `help_complete` on behalf of a non-worker thread, using its
    /// submission queue.
    pub(crate) fn external_help_complete(&self, task: &JobRef, max_tasks: i32) -> i32 {
        let ws = self.queues();
        let k = (ws.len() - 1) & worker::queue_hint() as usize & SQMASK as usize;
        match queue_at(&ws, k) {
            Some(q) => self.help_complete(q, task, max_tasks),
            None => 0,
        }
    }

    /// Arrange for a spare to run while `w` blocks.
    ///
    /// Returns `Ok(true)` if an idle worker was released, the active count
    /// was decremented because enough workers are busy, or a new spare was
    /// started. The caller must add back an active count after blocking.
    pub(crate) fn try_compensate(self: &Arc<Self>, w: &WorkQueue) -> Result<bool, RejectedError> {
        let ws = self.queues();
        let p = self.parallelism;
        if w.qlock() < 0 || ws.len() <= 1 || p == 0 {
            return Ok(false);
        }
        let m = ws.len() - 1;
        let c = self.ctl();
        let sp = stack_top(c);
        if sp != 0 {
            return Ok(self.try_release(c, queue_at(&ws, stack_index(sp, m)), 0));
        }
        let ac = active_delta(c) + p;
        let tc = total_delta(c) + p;
        let mut nbusy = 0;
        for i in 0..=m {
            if let Some(v) = &ws[((i << 1) | 1) & m] {
                if v.scan_state() & SCANNING != 0 {
                    break;
                }
                nbusy += 1;
            }
        }
        if nbusy != (tc << 1) || self.ctl() != c {
            return Ok(false);
        }
        if tc >= p && ac > 1 && w.is_empty() {
            let nc = (AC_MASK & c.wrapping_sub(AC_UNIT)) | (!AC_MASK & c);
            return Ok(self.cas_ctl(c, nc));
        }
        let limit = MAX_CAP.min(p.saturating_add(self.config.max_spares.min(MAX_CAP as usize) as i32));
        if tc >= limit {
            tracing::warn!(pool = %self.id, limit, "too many blocked workers");
            return Err(RejectedError::PoolExhausted {
                limit: limit as usize,
            });
        }
        let nc = (AC_MASK & c) | (TC_MASK & c.wrapping_add(TC_UNIT));
        let added = {
            let _lock = self.lock.lock();
            self.run_state() & STOP == 0 && self.cas_ctl(c, nc)
        };
        if !added {
            return Ok(false);
        }
        self.create_worker()?;
        tracing::debug!(pool = %self.id, pool_size = tc + 1, "added compensating worker");
        trace(TraceEvent::Compensate {
            pool: self.id,
            pool_size: (tc + 1) as usize,
            timestamp: Instant::now(),
        });
        Ok(true)
    }

    /// Undo the active-count decrement of a successful `try_compensate`.
    pub(crate) fn reactivate(&self) {
        self.ctl.fetch_add(AC_UNIT, Ordering::SeqCst);
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Push a job from outside the pool's workers onto a submission queue
    /// picked by the caller's queue hint.
    pub(crate) fn external_push(self: &Arc<Self>, job: JobRef) -> Result<(), RejectedError> {
        job.header().set_home(self);
        let mut r = worker::queue_hint();
        loop {
            if self.run_state() & SHUTDOWN != 0 {
                self.try_terminate(false, false);
                return Err(RejectedError::Shutdown);
            }
            let ws = self.queues();
            let k = r as usize & (ws.len() - 1) & SQMASK as usize;
            match queue_at(&ws, k) {
                Some(q) => {
                    if q.try_lock() {
                        // Termination waits for the lock, so a shutdown not
                        // seen here will see the pushed job.
                        if self.run_state() & SHUTDOWN != 0 {
                            q.unlock();
                            continue;
                        }
                        let pushed = q.push(job.clone());
                        q.unlock();
                        pushed?;
                        self.signal_work(&ws, Some(q));
                        return Ok(());
                    }
                }
                None => {
                    let lock = self.lock.lock();
                    let current = self.queues();
                    if self.run_state() > 0 && k < current.len() && current[k].is_none() {
                        let mut table = current.to_vec();
                        table[k] = Some(Arc::new(WorkQueue::new_shared(k, r as i32)));
                        self.publish(&lock, table);
                    }
                    continue;
                }
            }
            r = worker::advance_queue_hint(r);
        }
    }

    /// Take back `job` if it is on top of the caller's submission queue.
    pub(crate) fn try_external_unpush(&self, job: &JobRef) -> bool {
        let ws = self.queues();
        let k = (ws.len() - 1) & worker::queue_hint() as usize & SQMASK as usize;
        queue_at(&ws, k).is_some_and(|q| q.try_external_unpush(job))
    }

    // ========================================================================
    // Quiescence
    // ========================================================================

    /// Any queue that appears to hold work, after stable sweeps.
    fn find_non_empty_steal_queue(&self) -> Option<Arc<WorkQueue>> {
        let mut r = worker::queue_hint();
        let mut old_sum = None;
        loop {
            let ws = self.queues();
            let m = ws.len() - 1;
            let mut check_sum: i32 = 0;
            for j in (0..=((m + 1) << 2)).rev() {
                if let Some(q) = &ws[(r as usize).wrapping_sub(j) & m] {
                    let b = q.base();
                    if b.wrapping_sub(q.top()) < 0 {
                        return Some(Arc::clone(q));
                    }
                    check_sum = check_sum.wrapping_add(b);
                }
            }
            if old_sum == Some(check_sum) {
                return None;
            }
            old_sum = Some(check_sum);
            r = worker::advance_queue_hint(r);
        }
    }

    /// Local job or a stolen one for a worker.
    pub(crate) fn next_task_for(&self, w: &WorkQueue) -> Option<JobRef> {
        loop {
            if let Some(job) = w.next_local_task() {
                return Some(job);
            }
            let q = self.find_non_empty_steal_queue()?;
            let b = q.base();
            if b.wrapping_sub(q.top()) < 0 {
                if let Some(job) = q.poll_at(b) {
                    return Some(job);
                }
            }
        }
    }

    /// Run tasks from any queue until the pool looks quiescent.
    pub(crate) fn help_quiesce_pool(&self, w: &WorkQueue) {
        let ps = w.current_steal();
        let mut active = true;
        loop {
            w.exec_local_tasks();
            if let Some(q) = self.find_non_empty_steal_queue() {
                if !active {
                    active = true;
                    self.ctl.fetch_add(AC_UNIT, Ordering::SeqCst);
                }
                let b = q.base();
                if b.wrapping_sub(q.top()) < 0 {
                    if let Some(t) = q.poll_at(b) {
                        w.replace_current_steal(Some(t.clone()));
                        do_exec(&t);
                        w.add_steal();
                    }
                }
            } else if active {
                let c = self.ctl();
                let nc = (AC_MASK & c.wrapping_sub(AC_UNIT)) | (!AC_MASK & c);
                if active_delta(nc) + self.parallelism <= 0 {
                    break;
                }
                if self.cas_ctl(c, nc) {
                    active = false;
                }
            } else {
                let c = self.ctl();
                if active_delta(c) + self.parallelism <= 0 && self.cas_ctl(c, c.wrapping_add(AC_UNIT)) {
                    break;
                }
            }
        }
        w.replace_current_steal(ps);
    }

    /// Wait until quiescent, running queued jobs on the calling thread.
    pub(crate) fn await_quiescence(self: &Arc<Self>, timeout: Duration) -> bool {
        let own = worker::with_current(|ctx| {
            ctx.filter(|w| Arc::ptr_eq(&w.pool, self))
                .map(|w| Arc::clone(&w.queue))
        });
        if let Some(w) = own {
            self.help_quiesce_pool(&w);
            return true;
        }
        let deadline = Instant::now().checked_add(timeout);
        let mut found = true;
        let mut r = worker::queue_hint();
        while !self.is_quiescent() {
            if !found {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return false;
                }
                thread::yield_now();
            }
            found = false;
            let ws = self.queues();
            let m = ws.len() - 1;
            for j in (0..=((m + 1) << 2)).rev() {
                if let Some(q) = &ws[(r as usize).wrapping_sub(j) & m] {
                    let b = q.base();
                    if b.wrapping_sub(q.top()) < 0 {
                        found = true;
                        if let Some(t) = q.poll_at(b) {
                            do_exec(&t);
                        }
                        break;
                    }
                }
            }
            r = worker::advance_queue_hint(r);
        }
        true
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Possibly start or finish termination.
    ///
    /// With `now`, stop unconditionally; otherwise wait for quiescence.
    /// With `enable`, mark the pool shut down first. Returns `true` once
    /// stopping or terminated.
    pub(crate) fn try_terminate(&self, now: bool, enable: bool) -> bool {
        if self.common {
            return false;
        }
        if self.run_state() >= 0 {
            if !enable {
                return false;
            }
            let _lock = self.lock.lock();
            if self.run_state.fetch_or(SHUTDOWN, Ordering::SeqCst) >= 0 {
                tracing::debug!(pool = %self.id, now, "shutting down");
                trace(TraceEvent::Shutdown {
                    pool: self.id,
                    now,
                    timestamp: Instant::now(),
                });
            }
        }
        if self.run_state() & STOP == 0 {
            if !now && !self.is_drained() {
                return false;
            }
            let _lock = self.lock.lock();
            if self.run_state.fetch_or(STOP, Ordering::SeqCst) & STOP == 0 {
                tracing::debug!(pool = %self.id, "stopping");
            }
        }
        let mut pass = 0;
        let mut old_sum: i64 = 0;
        loop {
            let mut check_sum = self.ctl();
            let ws = self.queues();
            if total_delta(check_sum) + self.parallelism <= 0 || ws.len() <= 1 {
                self.mark_terminated();
                break;
            }
            let m = ws.len() - 1;
            for q in ws.iter().flatten() {
                check_sum = check_sum
                    .wrapping_add(i64::from(q.base()))
                    .wrapping_add(i64::from(q.top()) << 32);
                q.terminate();
                if pass > 0 {
                    q.cancel_all();
                    if pass > 1 {
                        q.interrupt();
                    }
                }
            }
            if check_sum != old_sum {
                old_sum = check_sum;
                pass = 0;
            } else if pass > 3 && pass > m {
                break;
            } else {
                pass += 1;
                if pass > 1 {
                    for _ in 0..=m {
                        let c = self.ctl();
                        let sp = stack_top(c);
                        if sp == 0 {
                            break;
                        }
                        self.try_release(c, queue_at(&ws, stack_index(sp, m)), AC_UNIT);
                    }
                }
            }
        }
        true
    }

    /// Whether no worker is active and every queue is empty, after two
    /// identical sweeps. Disables submission queues as it goes.
    fn is_drained(&self) -> bool {
        let mut old_sum: Option<i64> = None;
        loop {
            let mut check_sum = self.ctl();
            if active_delta(check_sum) + self.parallelism > 0 {
                return false;
            }
            let ws = self.queues();
            if ws.len() <= 1 {
                return true;
            }
            let m = ws.len() - 1;
            for (i, slot) in ws.iter().enumerate() {
                let Some(q) = slot else { continue };
                let b = q.base();
                if b != q.top() || q.scan_state() >= 0 || q.has_current_steal() {
                    let c = self.ctl();
                    self.try_release(c, queue_at(&ws, stack_index(stack_top(c), m)), AC_UNIT);
                    return false;
                }
                check_sum = check_sum
                    .wrapping_add(i64::from(b))
                    .wrapping_add(i64::from(q.top()) << 32);
                if i & 1 == 0 {
                    q.terminate();
                }
            }
            if old_sum == Some(check_sum) {
                return true;
            }
            old_sum = Some(check_sum);
        }
    }

    fn mark_terminated(&self) {
        let _lock = self.lock.lock();
        if self.run_state.fetch_or(TERMINATED, Ordering::SeqCst) & TERMINATED == 0 {
            tracing::debug!(pool = %self.id, "terminated");
            trace(TraceEvent::Terminated {
                pool: self.id,
                timestamp: Instant::now(),
            });
        }
        self.termination.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.try_terminate(false, true);
    }

    pub(crate) fn shutdown_now(&self) {
        self.try_terminate(true, true);
    }

    pub(crate) fn await_termination(self: &Arc<Self>, timeout: Duration) -> bool {
        if self.common {
            self.await_quiescence(timeout);
            return false;
        }
        let deadline = Instant::now().checked_add(timeout);
        let mut lock = self.lock.lock();
        while self.run_state() & TERMINATED == 0 {
            match deadline {
                Some(deadline) => {
                    if self.termination.wait_until(&mut lock, deadline).timed_out() {
                        return self.run_state() & TERMINATED != 0;
                    }
                }
                None => self.termination.wait(&mut lock),
            }
        }
        true
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub(crate) fn is_shutdown(&self) -> bool {
        self.run_state() & SHUTDOWN != 0
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.run_state() & TERMINATED != 0
    }

    pub(crate) fn is_terminating(&self) -> bool {
        let rs = self.run_state();
        rs & STOP != 0 && rs & TERMINATED == 0
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        active_delta(self.ctl()) + self.parallelism <= 0
    }

    pub(crate) fn pool_size(&self) -> usize {
        (total_delta(self.ctl()) + self.parallelism).max(0) as usize
    }

    pub(crate) fn active_thread_count(&self) -> usize {
        (active_delta(self.ctl()) + self.parallelism).max(0) as usize
    }

    pub(crate) fn running_thread_count(&self) -> usize {
        self.worker_queues()
            .filter(|q| q.is_apparently_unblocked())
            .count()
    }

    pub(crate) fn steal_count(&self) -> u64 {
        self.steal_count.load(Ordering::Relaxed)
            + self.worker_queues().map(|q| q.steals()).sum::<u64>()
    }

    pub(crate) fn queued_task_count(&self) -> usize {
        self.worker_queues().map(|q| q.queue_size()).sum()
    }

    pub(crate) fn queued_submission_count(&self) -> usize {
        self.submission_queues().map(|q| q.queue_size()).sum()
    }

    pub(crate) fn has_queued_submissions(&self) -> bool {
        self.submission_queues().any(|q| !q.is_empty())
    }

    fn worker_queues(&self) -> impl Iterator<Item = Arc<WorkQueue>> {
        let ws = self.queues();
        (0..ws.len())
            .filter(|i| i & 1 == 1)
            .filter_map(move |i| ws[i].clone())
    }

    fn submission_queues(&self) -> impl Iterator<Item = Arc<WorkQueue>> {
        let ws = self.queues();
        (0..ws.len())
            .filter(|i| i & 1 == 0)
            .filter_map(move |i| ws[i].clone())
    }

    /// Queue of the calling thread: its own if it is a worker here, else
    /// its submission queue.
    pub(crate) fn submitter_queue(self: &Arc<Self>) -> Option<Arc<WorkQueue>> {
        let own = worker::with_current(|ctx| {
            ctx.filter(|w| Arc::ptr_eq(&w.pool, self))
                .map(|w| Arc::clone(&w.queue))
        });
        own.or_else(|| {
            let ws = self.queues();
            let k = (ws.len() - 1) & worker::queue_hint() as usize & SQMASK as usize;
            ws[k].clone()
        })
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can hold the table pointer.
        unsafe {
            let table = self.queues.load(Ordering::Relaxed, epoch::unprotected());
            drop(table.into_owned());
        }
    }
}
