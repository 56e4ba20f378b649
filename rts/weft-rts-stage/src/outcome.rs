//! The set-once result slot of a stage.

use crate::error::StageError;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// How a stage finished.
#[derive(Debug, Clone)]
pub(crate) enum Outcome<T> {
    Value(T),
    Failed(StageError),
}

impl<T: Clone> Outcome<T> {
    /// The outcome a dependent receives when this one is relayed to it.
    /// Failures are wrapped once.
    pub(crate) fn relayed(&self) -> Outcome<T> {
        match self {
            Self::Value(v) => Self::Value(v.clone()),
            Self::Failed(err) => Self::Failed(err.clone().wrap()),
        }
    }

    pub(crate) fn to_result(&self) -> Result<T, StageError> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Failed(err) => Err(err.clone()),
        }
    }
}

impl<T> Outcome<T> {
    pub(crate) fn failure(&self) -> Option<&StageError> {
        match self {
            Self::Value(_) => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// A slot written at most once by a compare-and-swap from empty.
///
/// Once set, the outcome is never replaced or freed until the cell drops,
/// so readers may hold plain references to it.
pub(crate) struct OutcomeCell<T> {
    slot: AtomicPtr<Outcome<T>>,
    _owns: PhantomData<Box<Outcome<T>>>,
}

impl<T> OutcomeCell<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    pub(crate) fn with(outcome: Outcome<T>) -> Self {
        Self {
            slot: AtomicPtr::new(Box::into_raw(Box::new(outcome))),
            _owns: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> Option<&Outcome<T>> {
        let p = self.slot.load(Ordering::Acquire);
        // SAFETY: a non-null slot points to a boxed outcome that lives until
        // `self` drops and is never mutated.
        unsafe { p.as_ref() }
    }

    pub(crate) fn is_set(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }

    /// Install `outcome` if the cell is empty. Returns whether it won.
    pub(crate) fn set(&self, outcome: Outcome<T>) -> bool {
        if self.is_set() {
            return false;
        }
        let fresh = Box::into_raw(Box::new(outcome));
        match self
            .slot
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                false
            }
        }
    }
}

impl<T> Drop for OutcomeCell<T> {
    fn drop(&mut self) {
        let p = *self.slot.get_mut();
        if !p.is_null() {
            // SAFETY: exclusive access; the box came from `Box::into_raw`.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_set_wins() {
        let cell = OutcomeCell::new();
        assert!(cell.get().is_none());
        assert!(cell.set(Outcome::Value(1)));
        assert!(!cell.set(Outcome::Value(2)));
        assert!(matches!(cell.get(), Some(Outcome::Value(1))));
    }

    #[test]
    fn test_racing_setters_agree() {
        let cell = Arc::new(OutcomeCell::new());
        let winners: usize = (0..8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || usize::from(cell.set(Outcome::Value(i))))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
        assert!(cell.is_set());
    }

    #[test]
    fn test_relayed_wraps_failures_once() {
        let failed: Outcome<u8> = Outcome::Failed(StageError::Cancelled);
        let once = failed.relayed();
        let twice = once.relayed();
        assert!(matches!(once.failure(), Some(StageError::Completion(_))));
        assert!(matches!(twice.failure().map(StageError::cause), Some(StageError::Cancelled)));
        assert!(Outcome::Value(3).relayed().failure().is_none());
    }
}
