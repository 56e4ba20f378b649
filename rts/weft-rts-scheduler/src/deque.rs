//! Work queues.
//!
//! Each worker owns a queue supporting owner push/pop at `top` and steals
//! at `base`. Slots are epoch-managed pointers, so a thief that loses a race
//! never sees a freed job. Submission queues are the same structure guarded
//! by `qlock` for the pushing side.
//!
//! A slot is delivered at most once: whoever swaps it from the job to null
//! owns the job. `base` only moves after such a swap; `top` is only written
//! by the owner (or the lock holder of a submission queue).

use crate::ctl::{FIFO_QUEUE, INACTIVE, LIFO_QUEUE, SCANNING, SHARED_QUEUE, SMASK};
use crate::error::RejectedError;
use crate::task::{do_exec, rooted_at, same_job, Job, JobRef, TaskHeader, NORMAL};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::sync::Unparker;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Initial slot count of a queue. Must be a power of two.
pub(crate) const INITIAL_QUEUE_CAPACITY: usize = 1 << 13;

/// Largest slot count of a queue.
pub(crate) const MAXIMUM_QUEUE_CAPACITY: usize = 1 << 26;

struct Buffer {
    slots: Box<[Atomic<JobRef>]>,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: i32) -> &Atomic<JobRef> {
        &self.slots[(index as u32 as usize) & (self.slots.len() - 1)]
    }
}

/// Swap `current` out of `slot`, taking ownership of its job.
fn claim(slot: &Atomic<JobRef>, current: Shared<'_, JobRef>, guard: &Guard) -> Option<JobRef> {
    slot.compare_exchange(
        current,
        Shared::null(),
        Ordering::AcqRel,
        Ordering::Acquire,
        guard,
    )
    .ok()
    .map(|_| {
        // SAFETY: `current` was loaded under `guard` and is now unlinked, so
        // only readers pinned before the swap can still see it.
        let job = unsafe { current.deref() }.clone();
        unsafe { guard.defer_destroy(current) };
        job
    })
}

/// Result of probing a queue slot at a known `base`.
pub(crate) enum Steal {
    /// The job was claimed.
    Taken(JobRef),
    /// A job is present but was not claimed.
    Present,
    /// The slot is empty and `base` did not move.
    Empty,
    /// `base` moved or the claim lost a race.
    Retry,
}

/// Placeholder left in a slot when a joiner removes a job from the middle.
struct EmptyJob {
    header: TaskHeader,
}

impl EmptyJob {
    fn job() -> JobRef {
        let header = TaskHeader::new();
        header.set_completion(NORMAL);
        Arc::new(Self { header })
    }
}

impl Job for EmptyJob {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn exec(self: Arc<Self>) -> bool {
        true
    }
}

pub(crate) struct WorkQueue {
    base: CachePadded<AtomicI32>,
    top: AtomicI32,
    buffer: Atomic<Buffer>,
    /// Versioned table index; negative when inactive, odd bit clear when busy.
    pub(crate) scan_state: AtomicI32,
    /// Control-word snapshot linking to the next idle worker.
    pub(crate) stack_pred: AtomicI32,
    /// Steal hint, or the random seed of a submission queue.
    pub(crate) hint: AtomicI32,
    /// 1 while locked, -1 once terminated.
    qlock: AtomicI32,
    /// Table index and mode bits.
    config: i32,
    steals: AtomicU64,
    current_steal: Mutex<Option<JobRef>>,
    current_join: Mutex<Option<JobRef>>,
    unparker: Option<Unparker>,
    parked: AtomicBool,
    interrupted: AtomicBool,
}

impl WorkQueue {
    fn with_config(config: i32, scan_state: i32, hint: i32, unparker: Option<Unparker>) -> Self {
        let start = (INITIAL_QUEUE_CAPACITY >> 1) as i32;
        Self {
            base: CachePadded::new(AtomicI32::new(start)),
            top: AtomicI32::new(start),
            buffer: Atomic::new(Buffer::new(INITIAL_QUEUE_CAPACITY)),
            scan_state: AtomicI32::new(scan_state),
            stack_pred: AtomicI32::new(0),
            hint: AtomicI32::new(hint),
            qlock: AtomicI32::new(0),
            config,
            steals: AtomicU64::new(0),
            current_steal: Mutex::new(None),
            current_join: Mutex::new(None),
            unparker,
            parked: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Queue owned by a worker at table index `index` (odd).
    pub(crate) fn new_worker(index: usize, fifo: bool, seed: i32, unparker: Unparker) -> Self {
        let mode = if fifo { FIFO_QUEUE } else { LIFO_QUEUE };
        let index = index as i32;
        Self::with_config(index | mode, index, seed, Some(unparker))
    }

    /// Submission queue at table index `index` (even).
    pub(crate) fn new_shared(index: usize, seed: i32) -> Self {
        Self::with_config(index as i32 | SHARED_QUEUE, INACTIVE, seed, None)
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        (self.config & SMASK) as usize
    }

    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        self.config < 0
    }

    #[inline]
    pub(crate) fn is_fifo(&self) -> bool {
        self.config & FIFO_QUEUE != 0
    }

    #[inline]
    pub(crate) fn base(&self) -> i32 {
        self.base.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn top(&self) -> i32 {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn scan_state(&self) -> i32 {
        self.scan_state.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn stack_pred(&self) -> i32 {
        self.stack_pred.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn qlock(&self) -> i32 {
        self.qlock.load(Ordering::Acquire)
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.qlock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release `qlock`. A no-op unless it is held.
    pub(crate) fn unlock(&self) {
        let _ = self
            .qlock
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed);
    }

    /// Refuse further submissions and make the owner exit.
    ///
    /// Waits out a current `qlock` holder, so a push made under the lock is
    /// visible once this returns.
    pub(crate) fn terminate(&self) {
        let backoff = Backoff::new();
        loop {
            match self
                .qlock
                .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) | Err(-1) => return,
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Number of queued jobs, possibly stale.
    pub(crate) fn queue_size(&self) -> usize {
        let n = self.base().wrapping_sub(self.top());
        if n >= 0 {
            0
        } else {
            n.unsigned_abs() as usize
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let s = self.top();
        let n = self.base().wrapping_sub(s);
        if n >= 0 {
            return true;
        }
        if n != -1 {
            return false;
        }
        let guard = epoch::pin();
        self.buffer(&guard)
            .slot(s.wrapping_sub(1))
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    fn buffer<'g>(&self, guard: &'g Guard) -> &'g Buffer {
        // SAFETY: the buffer is never null and is retired only through the
        // epoch collector after being replaced.
        unsafe { self.buffer.load(Ordering::Acquire, guard).deref() }
    }

    /// Push a job. Only the owner (or the holder of `qlock`) may push.
    ///
    /// Returns `true` if the queue held at most one job before, in which
    /// case the pool should signal an idle worker.
    pub(crate) fn push(&self, job: JobRef) -> Result<bool, RejectedError> {
        let guard = epoch::pin();
        let b = self.base();
        let s = self.top.load(Ordering::Relaxed);
        let n = s.wrapping_sub(b);
        let mut buffer = self.buffer(&guard);
        if n >= buffer.len() as i32 - 1 {
            buffer = self.grow(&guard)?;
        }
        buffer.slot(s).store(Owned::new(job), Ordering::Release);
        self.top.store(s.wrapping_add(1), Ordering::SeqCst);
        Ok(n <= 1)
    }

    /// Double the buffer, moving live slots into it.
    ///
    /// The new buffer is published first; each slot is then moved with a
    /// CAS so that a concurrent steal from the old buffer wins or loses
    /// cleanly.
    fn grow<'g>(&self, guard: &'g Guard) -> Result<&'g Buffer, RejectedError> {
        let old_shared = self.buffer.load(Ordering::Acquire, guard);
        // SAFETY: see `buffer`.
        let old = unsafe { old_shared.deref() };
        let size = old.len() << 1;
        if size > MAXIMUM_QUEUE_CAPACITY {
            return Err(RejectedError::QueueCapacity {
                capacity: MAXIMUM_QUEUE_CAPACITY,
            });
        }
        let new_shared = Owned::new(Buffer::new(size)).into_shared(guard);
        self.buffer.store(new_shared, Ordering::Release);
        // SAFETY: just allocated and published.
        let new = unsafe { new_shared.deref() };
        let top = self.top.load(Ordering::Relaxed);
        let mut b = self.base();
        while b != top {
            let slot = old.slot(b);
            let x = slot.load(Ordering::Acquire, guard);
            if !x.is_null()
                && slot
                    .compare_exchange(x, Shared::null(), Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_ok()
            {
                new.slot(b).store(x, Ordering::Release);
            }
            b = b.wrapping_add(1);
        }
        // SAFETY: no longer reachable from `self.buffer`.
        unsafe { guard.defer_destroy(old_shared) };
        tracing::trace!(queue = self.index(), size, "grew work queue");
        Ok(new)
    }

    /// Take the most recently pushed job. Owner only.
    pub(crate) fn pop(&self) -> Option<JobRef> {
        let guard = epoch::pin();
        let buffer = self.buffer(&guard);
        loop {
            let s = self.top.load(Ordering::Relaxed).wrapping_sub(1);
            if s.wrapping_sub(self.base()) < 0 {
                return None;
            }
            let slot = buffer.slot(s);
            let t = slot.load(Ordering::Acquire, &guard);
            if t.is_null() {
                return None;
            }
            if let Some(job) = claim(slot, t, &guard) {
                self.top.store(s, Ordering::Release);
                return Some(job);
            }
        }
    }

    /// Take the oldest job. Any thread.
    pub(crate) fn poll(&self) -> Option<JobRef> {
        loop {
            let b = self.base();
            if b.wrapping_sub(self.top()) >= 0 {
                return None;
            }
            match self.steal_at(b, true) {
                Steal::Taken(job) => return Some(job),
                Steal::Empty if b.wrapping_add(1) == self.top() => return None,
                _ => {}
            }
        }
    }

    /// Inspect the slot at `b`, claiming it if `claim_it` is set.
    pub(crate) fn steal_at(&self, b: i32, claim_it: bool) -> Steal {
        let guard = epoch::pin();
        let slot = self.buffer(&guard).slot(b);
        let t = slot.load(Ordering::Acquire, &guard);
        if self.base() != b {
            return Steal::Retry;
        }
        if t.is_null() {
            return Steal::Empty;
        }
        if !claim_it {
            return Steal::Present;
        }
        match claim(slot, t, &guard) {
            Some(job) => {
                self.base.store(b.wrapping_add(1), Ordering::Release);
                Steal::Taken(job)
            }
            None => Steal::Retry,
        }
    }

    /// Take the job at `b` if it is still the oldest.
    pub(crate) fn poll_at(&self, b: i32) -> Option<JobRef> {
        match self.steal_at(b, true) {
            Steal::Taken(job) => Some(job),
            _ => None,
        }
    }

    /// Next job for the owner in queue mode order.
    pub(crate) fn next_local_task(&self) -> Option<JobRef> {
        if self.is_fifo() {
            self.poll()
        } else {
            self.pop()
        }
    }

    /// Take `job` back if it is the most recently pushed one. Owner only.
    pub(crate) fn try_unpush(&self, job: &JobRef) -> bool {
        let s = self.top.load(Ordering::Relaxed);
        if s == self.base() {
            return false;
        }
        let s = s.wrapping_sub(1);
        let guard = epoch::pin();
        let slot = self.buffer(&guard).slot(s);
        let t = slot.load(Ordering::Acquire, &guard);
        // SAFETY: loaded under `guard`.
        let matches = unsafe { t.as_ref() }.is_some_and(|x| same_job(x, job));
        if matches && claim(slot, t, &guard).is_some() {
            self.top.store(s, Ordering::Release);
            return true;
        }
        false
    }

    /// `try_unpush` for a submission queue, under `qlock`.
    pub(crate) fn try_external_unpush(&self, job: &JobRef) -> bool {
        if self.top() == self.base() || !self.try_lock() {
            return false;
        }
        let unpushed = self.try_unpush(job);
        self.unlock();
        unpushed
    }

    /// Remove and run `task` if it is queued here. Owner only.
    ///
    /// A task found below the top is replaced by a completed placeholder.
    /// Completed tasks found on top are discarded along the way. Returns
    /// `true` if the queue ran out or shrank while searching, meaning the
    /// task was likely stolen.
    pub(crate) fn try_remove_and_exec(&self, task: &JobRef) -> bool {
        loop {
            let b = self.base();
            let mut s = self.top.load(Ordering::Relaxed);
            let mut n = s.wrapping_sub(b);
            if n <= 0 {
                return true;
            }
            let removed = {
                let guard = epoch::pin();
                let buffer = self.buffer(&guard);
                let mut removed = false;
                loop {
                    s = s.wrapping_sub(1);
                    let slot = buffer.slot(s);
                    let t = slot.load(Ordering::Acquire, &guard);
                    // SAFETY: loaded under `guard`.
                    let Some(job) = (unsafe { t.as_ref() }) else {
                        return s.wrapping_add(1) == self.top.load(Ordering::Relaxed);
                    };
                    let on_top = s.wrapping_add(1) == self.top.load(Ordering::Relaxed);
                    if same_job(job, task) {
                        if on_top {
                            if claim(slot, t, &guard).is_some() {
                                self.top.store(s, Ordering::Release);
                                removed = true;
                            }
                        } else if self.base() == b
                            && slot
                                .compare_exchange(
                                    t,
                                    Owned::new(EmptyJob::job()),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                    &guard,
                                )
                                .is_ok()
                        {
                            // SAFETY: replaced, so unreachable for new readers.
                            unsafe { guard.defer_destroy(t) };
                            removed = true;
                        }
                        break;
                    } else if job.header().is_done() && on_top {
                        if claim(slot, t, &guard).is_some() {
                            self.top.store(s, Ordering::Release);
                        }
                        break;
                    }
                    n -= 1;
                    if n == 0 {
                        return false;
                    }
                }
                removed
            };
            if removed {
                do_exec(task);
            }
            if task.header().is_done() {
                return false;
            }
        }
    }

    /// Pop the top job if it belongs to the completion tree of `root`.
    pub(crate) fn pop_cc(&self, root: &JobRef) -> Option<JobRef> {
        let s = self.top();
        if self.base().wrapping_sub(s) >= 0 {
            return None;
        }
        let s = s.wrapping_sub(1);
        let guard = epoch::pin();
        let buffer_ptr = self.buffer.load(Ordering::Acquire, &guard);
        // SAFETY: see `buffer`.
        let slot = unsafe { buffer_ptr.deref() }.slot(s);
        let t = slot.load(Ordering::Acquire, &guard);
        // SAFETY: loaded under `guard`.
        let job = unsafe { t.as_ref() }?;
        if !rooted_at(job, root) {
            return None;
        }
        if self.is_shared() {
            if !self.try_lock() {
                return None;
            }
            let mut taken = None;
            if self.top() == s.wrapping_add(1)
                && self.buffer.load(Ordering::Acquire, &guard) == buffer_ptr
            {
                taken = claim(slot, t, &guard);
                if taken.is_some() {
                    self.top.store(s, Ordering::Release);
                }
            }
            self.unlock();
            return taken;
        }
        let taken = claim(slot, t, &guard)?;
        self.top.store(s, Ordering::Release);
        Some(taken)
    }

    /// Steal and run the oldest job if it belongs to the completion tree of
    /// `root`.
    ///
    /// Returns 1 on success, 2 if retryable, -1 if the oldest job does not
    /// match, or `base | i32::MIN` if the queue is empty.
    pub(crate) fn poll_and_exec_cc(&self, root: &JobRef) -> i32 {
        let b = self.base();
        if b.wrapping_sub(self.top()) >= 0 {
            return b | i32::MIN;
        }
        let taken = {
            let guard = epoch::pin();
            let slot = self.buffer(&guard).slot(b);
            let t = slot.load(Ordering::Acquire, &guard);
            // SAFETY: loaded under `guard`.
            match unsafe { t.as_ref() } {
                None => return 2,
                Some(job) if !rooted_at(job, root) => return -1,
                Some(_) if self.base() == b => claim(slot, t, &guard),
                Some(_) => None,
            }
        };
        match taken {
            Some(job) => {
                self.base.store(b.wrapping_add(1), Ordering::Release);
                do_exec(&job);
                1
            }
            None => 2,
        }
    }

    /// Run local jobs until the queue is empty.
    pub(crate) fn exec_local_tasks(&self) {
        while let Some(job) = self.next_local_task() {
            do_exec(&job);
        }
    }

    /// Run a stolen top-level job, then drain local work.
    pub(crate) fn run_task(&self, job: JobRef) {
        self.scan_state.fetch_and(!SCANNING, Ordering::SeqCst);
        *self.current_steal.lock() = Some(job.clone());
        do_exec(&job);
        *self.current_steal.lock() = None;
        self.exec_local_tasks();
        self.steals.fetch_add(1, Ordering::Relaxed);
        self.scan_state.fetch_or(SCANNING, Ordering::SeqCst);
    }

    /// Cancel every queued job and the jobs being stolen or joined.
    pub(crate) fn cancel_all(&self) {
        if let Some(job) = self.current_join.lock().as_ref() {
            crate::task::cancel_ignoring(job);
        }
        if let Some(job) = self.current_steal.lock().as_ref() {
            crate::task::cancel_ignoring(job);
        }
        while let Some(job) = self.poll() {
            crate::task::cancel_ignoring(&job);
        }
    }

    pub(crate) fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    pub(crate) fn add_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn current_steal(&self) -> Option<JobRef> {
        self.current_steal.lock().clone()
    }

    pub(crate) fn replace_current_steal(&self, job: Option<JobRef>) -> Option<JobRef> {
        std::mem::replace(&mut *self.current_steal.lock(), job)
    }

    pub(crate) fn has_current_steal(&self) -> bool {
        self.current_steal.lock().is_some()
    }

    pub(crate) fn current_steal_is(&self, job: &JobRef) -> bool {
        self.current_steal
            .lock()
            .as_ref()
            .is_some_and(|x| same_job(x, job))
    }

    pub(crate) fn replace_current_join(&self, job: Option<JobRef>) -> Option<JobRef> {
        std::mem::replace(&mut *self.current_join.lock(), job)
    }

    pub(crate) fn current_join(&self) -> Option<JobRef> {
        self.current_join.lock().clone()
    }

    pub(crate) fn current_join_is(&self, job: &JobRef) -> bool {
        self.current_join
            .lock()
            .as_ref()
            .is_some_and(|x| same_job(x, job))
    }

    pub(crate) fn unpark(&self) {
        if let Some(unparker) = &self.unparker {
            unparker.unpark();
        }
    }

    pub(crate) fn set_parked(&self, parked: bool) {
        self.parked.store(parked, Ordering::Release);
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    /// Active and not blocked in a join or managed block.
    pub(crate) fn is_apparently_unblocked(&self) -> bool {
        self.unparker.is_some() && self.scan_state() >= 0 && !self.is_parked()
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.unpark();
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can access the buffer.
        unsafe {
            let guard = epoch::unprotected();
            let buffer = self.buffer.load(Ordering::Relaxed, guard);
            for slot in buffer.deref().slots.iter() {
                let job = slot.load(Ordering::Relaxed, guard);
                if !job.is_null() {
                    drop(job.into_owned());
                }
            }
            drop(buffer.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    fn queue() -> WorkQueue {
        WorkQueue::new_shared(0, 0)
    }

    fn numbered(i: usize) -> (Task<usize>, JobRef) {
        let task = Task::new(move || i);
        let job = task.job();
        (task, job)
    }

    #[test]
    fn test_pop_is_lifo_and_poll_is_fifo() {
        let q = queue();
        let tasks: Vec<_> = (0..4).map(numbered).collect();
        for (_, job) in &tasks {
            q.push(job.clone()).unwrap();
        }
        assert_eq!(q.queue_size(), 4);
        assert!(same_job(&q.pop().unwrap(), &tasks[3].1));
        assert!(same_job(&q.poll().unwrap(), &tasks[0].1));
        assert!(same_job(&q.pop().unwrap(), &tasks[2].1));
        assert!(same_job(&q.poll().unwrap(), &tasks[1].1));
        assert!(q.pop().is_none());
        assert!(q.poll().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_worker_queue_mode() {
        let parker = crossbeam::sync::Parker::new();
        let lifo = WorkQueue::new_worker(1, false, 0, parker.unparker().clone());
        let fifo = WorkQueue::new_worker(3, true, 0, parker.unparker().clone());
        assert!(!lifo.is_fifo());
        assert!(fifo.is_fifo());
        assert!(!lifo.is_shared());
        assert_eq!((lifo.index(), fifo.index()), (1, 3));
        assert!(queue().is_shared());
    }

    #[test]
    fn test_push_reports_when_signal_needed() {
        let q = queue();
        assert!(q.push(numbered(0).1).unwrap());
        assert!(q.push(numbered(1).1).unwrap());
        assert!(!q.push(numbered(2).1).unwrap());
    }

    #[test]
    fn test_grow_keeps_every_job() {
        let q = queue();
        let count = INITIAL_QUEUE_CAPACITY * 2 + 17;
        for i in 0..count {
            q.push(numbered(i).1).unwrap();
        }
        assert_eq!(q.queue_size(), count);
        let mut seen = 0;
        while let Some(job) = q.poll() {
            assert!(do_exec(&job) < 0);
            seen += 1;
        }
        assert_eq!(seen, count);
    }

    #[test]
    fn test_try_unpush_only_takes_top() {
        let q = queue();
        let (_, a) = numbered(1);
        let (_, b) = numbered(2);
        q.push(a.clone()).unwrap();
        q.push(b.clone()).unwrap();
        assert!(!q.try_unpush(&a));
        assert!(q.try_unpush(&b));
        assert!(q.try_external_unpush(&a));
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_and_exec_from_middle_leaves_placeholder() {
        let q = queue();
        let (below, below_job) = numbered(1);
        let (target, target_job) = numbered(2);
        let (above, above_job) = numbered(3);
        q.push(below_job).unwrap();
        q.push(target_job.clone()).unwrap();
        q.push(above_job).unwrap();
        assert!(!q.try_remove_and_exec(&target_job));
        assert_eq!(target.raw_result(), Some(2));
        // The remaining jobs and the placeholder still drain in order.
        q.exec_local_tasks();
        assert_eq!(above.raw_result(), Some(3));
        assert_eq!(below.raw_result(), Some(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_and_exec_reports_missing_task() {
        let q = queue();
        let (_, job) = numbered(1);
        assert!(q.try_remove_and_exec(&job));
    }

    #[test]
    fn test_cancel_all_cancels_queued_jobs() {
        let q = queue();
        let tasks: Vec<_> = (0..8).map(numbered).collect();
        for (_, job) in &tasks {
            q.push(job.clone()).unwrap();
        }
        q.cancel_all();
        assert!(q.is_empty());
        assert!(tasks.iter().all(|(t, _)| t.is_cancelled()));
    }

    #[test]
    fn test_lock_and_terminate() {
        let q = queue();
        assert!(q.try_lock());
        assert!(!q.try_lock());
        q.unlock();
        q.terminate();
        assert!(!q.try_lock());
        q.unlock();
        assert_eq!(q.qlock(), -1);
    }

    #[test]
    fn test_terminate_waits_for_lock_holder() {
        let q = Arc::new(queue());
        assert!(q.try_lock());
        let terminated = Arc::new(AtomicBool::new(false));
        let handle = {
            let q = Arc::clone(&q);
            let terminated = Arc::clone(&terminated);
            std::thread::spawn(move || {
                q.terminate();
                terminated.store(true, Ordering::SeqCst);
                q.queue_size()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!terminated.load(Ordering::SeqCst));
        let (_task, job) = numbered(7);
        q.push(job).unwrap();
        q.unlock();
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(q.qlock(), -1);
        assert!(!q.try_lock());
    }

    #[test]
    fn test_concurrent_steal_delivers_each_job_once() {
        const JOBS: usize = 20_000;
        const THIEVES: usize = 4;

        let q = Arc::new(queue());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THIEVES + 1));
        let done = Arc::new(AtomicBool::new(false));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let q = q.clone();
                let barrier = barrier.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    barrier.wait();
                    loop {
                        match q.poll() {
                            Some(job) => mine.push(job),
                            None if done.load(Ordering::Acquire) && q.is_empty() => break,
                            None => thread::yield_now(),
                        }
                    }
                    mine
                })
            })
            .collect();

        barrier.wait();
        let mut owned = Vec::new();
        let mut tasks = Vec::with_capacity(JOBS);
        for i in 0..JOBS {
            let counter = runs.clone();
            let task = Task::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                i
            });
            q.push(task.job()).unwrap();
            tasks.push(task);
            if i % 3 == 0 {
                if let Some(job) = q.pop() {
                    owned.push(job);
                }
            }
        }
        while let Some(job) = q.pop() {
            owned.push(job);
        }
        done.store(true, Ordering::Release);

        let mut all = owned;
        for handle in thieves {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), JOBS);
        let distinct: HashSet<_> = all.iter().map(|j| Arc::as_ptr(j) as *const () as usize).collect();
        assert_eq!(distinct.len(), JOBS);
        for job in &all {
            do_exec(job);
        }
        assert_eq!(runs.load(Ordering::SeqCst), JOBS);
        assert!(tasks.iter().all(Task::is_completed_normally));
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Push,
        Pop,
        Poll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Push), 1 => Just(Op::Pop), 1 => Just(Op::Poll)]
    }

    proptest! {
        #[test]
        fn prop_owner_and_thief_ends_match_model(ops in proptest::collection::vec(op(), 0..600)) {
            let q = queue();
            let mut model: VecDeque<JobRef> = VecDeque::new();
            let mut delivered = 0usize;
            let mut pushed = 0usize;
            for op in ops {
                match op {
                    Op::Push => {
                        let (_, job) = numbered(pushed);
                        pushed += 1;
                        q.push(job.clone()).unwrap();
                        model.push_back(job);
                    }
                    Op::Pop => match (q.pop(), model.pop_back()) {
                        (Some(got), Some(want)) => {
                            prop_assert!(same_job(&got, &want));
                            delivered += 1;
                        }
                        (None, None) => {}
                        (got, want) => prop_assert!(false, "pop {:?} vs model {:?}", got.is_some(), want.is_some()),
                    },
                    Op::Poll => match (q.poll(), model.pop_front()) {
                        (Some(got), Some(want)) => {
                            prop_assert!(same_job(&got, &want));
                            delivered += 1;
                        }
                        (None, None) => {}
                        (got, want) => prop_assert!(false, "poll {:?} vs model {:?}", got.is_some(), want.is_some()),
                    },
                }
                prop_assert_eq!(q.queue_size(), model.len());
            }
            prop_assert_eq!(delivered + model.len(), pushed);
        }
    }
}
