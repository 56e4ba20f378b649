//! Bit layouts of the packed scheduler words.
//!
//! The control word is a single `i64` holding four 16-bit fields:
//!
//! ```text
//!  63         48 47         32 31                      0
//! +-------------+-------------+------------------------+
//! |  AC (i16)   |  TC (i16)   |  SP: idle stack top     |
//! +-------------+-------------+------------------------+
//! ```
//!
//! * AC: number of active workers minus parallelism.
//! * TC: number of total workers minus parallelism.
//! * SP: `scan_state` of the most recently inactivated worker. Its low 16
//!   bits index the queue table and the upper bits carry a version stamp
//!   that changes on every inactivation, which defeats ABA on the idle
//!   stack. The inactive bit is the sign of the lower half, so a negative
//!   `c as i32` means idle workers exist.
//!
//! Both counts are offset by `-parallelism`, so a negative field means too
//! few workers and the sign of the whole word tells if AC is short.

/// Mask of a 16-bit field.
pub(crate) const SMASK: i32 = 0xffff;
/// Largest worker count.
pub(crate) const MAX_CAP: i32 = 0x7fff;
/// Even short bits.
pub(crate) const EVENMASK: i32 = 0xfffe;
/// Max 64 even slots for submission queues.
pub(crate) const SQMASK: i32 = 0x007e;

/// Worker is scanning or running a top-level task when clear.
pub(crate) const SCANNING: i32 = 1;
/// Worker is on the idle stack.
pub(crate) const INACTIVE: i32 = i32::MIN;
/// Version increment applied on reactivation.
pub(crate) const SS_SEQ: i32 = 1 << 16;

/// Queue mode bits, stored above the table index in a queue's config.
pub(crate) const LIFO_QUEUE: i32 = 0;
pub(crate) const FIFO_QUEUE: i32 = 1 << 16;
pub(crate) const SHARED_QUEUE: i32 = i32::MIN;

pub(crate) const SP_MASK: i64 = 0xffff_ffff;
pub(crate) const UC_MASK: i64 = !SP_MASK;

pub(crate) const AC_SHIFT: u32 = 48;
pub(crate) const AC_UNIT: i64 = 1 << AC_SHIFT;
pub(crate) const AC_MASK: i64 = (0xffff_u64 << AC_SHIFT) as i64;

pub(crate) const TC_SHIFT: u32 = 32;
pub(crate) const TC_UNIT: i64 = 1 << TC_SHIFT;
pub(crate) const TC_MASK: i64 = (0xffff_u64 << TC_SHIFT) as i64;
/// Sign bit of TC: set while total workers are below parallelism.
pub(crate) const ADD_WORKER: i64 = 1 << (TC_SHIFT + 15);

/// Run-state bits.
pub(crate) const STARTED: i32 = 1 << 2;
pub(crate) const STOP: i32 = 1 << 29;
pub(crate) const TERMINATED: i32 = 1 << 30;
pub(crate) const SHUTDOWN: i32 = i32::MIN;

/// Initial control word for a pool with the given parallelism.
pub(crate) const fn initial_ctl(parallelism: i32) -> i64 {
    let np = -(parallelism as i64);
    ((np << AC_SHIFT) & AC_MASK) | ((np << TC_SHIFT) & TC_MASK)
}

/// Active workers minus parallelism.
#[inline]
pub(crate) const fn active_delta(c: i64) -> i32 {
    (c >> AC_SHIFT) as i32
}

/// Total workers minus parallelism.
#[inline]
pub(crate) const fn total_delta(c: i64) -> i32 {
    (c >> TC_SHIFT) as i16 as i32
}

/// Idle stack top (`scan_state` of the top idle worker), or 0 if none.
#[inline]
pub(crate) const fn stack_top(c: i64) -> i32 {
    c as i32
}

/// Table index named by an idle stack top.
#[inline]
pub(crate) const fn stack_index(sp: i32, mask: usize) -> usize {
    (sp as u32 as usize) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_ctl_fields() {
        let c = initial_ctl(4);
        assert_eq!(active_delta(c), -4);
        assert_eq!(total_delta(c), -4);
        assert_eq!(stack_top(c), 0);
        assert!(c < 0, "too few active workers");
        assert_ne!(c & ADD_WORKER, 0, "too few total workers");
    }

    #[test]
    fn test_counts_reach_zero_at_parallelism() {
        let mut c = initial_ctl(2);
        for _ in 0..2 {
            c = (AC_MASK & (c + AC_UNIT)) | (TC_MASK & (c + TC_UNIT));
        }
        assert_eq!(active_delta(c), 0);
        assert_eq!(total_delta(c), 0);
        assert_eq!(c & ADD_WORKER, 0);
        assert!(c >= 0);
    }

    #[test]
    fn test_idle_stack_packing() {
        let c = initial_ctl(8);
        let ss = (3 | SS_SEQ) | INACTIVE;
        let nc = (SP_MASK & ss as i64) | (UC_MASK & (c - AC_UNIT));
        assert_eq!(stack_top(nc), ss);
        assert_eq!(stack_index(stack_top(nc), 0xf), 3);
        assert_eq!(active_delta(nc), -9);
        assert_eq!(total_delta(nc), -8);
        // Reactivation bumps the version and clears the inactive bit.
        let vs = (ss + SS_SEQ) & !INACTIVE;
        assert!(vs > 0);
        assert_eq!(vs & SMASK, 3);
        assert_ne!(vs, ss & !INACTIVE);
    }
}
