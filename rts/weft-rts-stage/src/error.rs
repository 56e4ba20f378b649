//! Errors carried by stages.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;
use thiserror::Error;
use weft_rts_scheduler::{panic_message, Cause, RejectedError, TaskError};

/// Why a stage did not produce a value.
///
/// A failure relayed from a source stage to its dependent is wrapped once in
/// [`StageError::Completion`], so a dependent can tell its own failure from
/// one that happened upstream. Wrapping an already wrapped error is a no-op.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The stage was cancelled.
    #[error("stage was cancelled")]
    Cancelled,
    /// The stage was completed exceptionally with the given cause.
    #[error("stage failed: {0}")]
    Failed(Cause),
    /// An action panicked.
    #[error("stage action panicked: {0}")]
    Panicked(Arc<str>),
    /// An executor refused to run an action.
    #[error(transparent)]
    Rejected(#[from] RejectedError),
    /// A failure relayed from another stage.
    #[error("dependent stage failed: {0}")]
    Completion(Arc<StageError>),
    /// A timed wait elapsed first. Never stored in a stage.
    #[error("timed out waiting for stage")]
    Timeout,
}

impl StageError {
    /// Wrap an arbitrary error as a stage failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(err))
    }

    /// Build a failure from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()).into())
    }

    /// Mark this failure as relayed, unless it already is.
    #[must_use]
    pub fn wrap(self) -> Self {
        match self {
            Self::Completion(_) => self,
            other => Self::Completion(Arc::new(other)),
        }
    }

    /// Whether this failure was relayed from another stage.
    #[must_use]
    pub const fn is_wrapped(&self) -> bool {
        matches!(self, Self::Completion(_))
    }

    /// The underlying failure, with any relay wrapper removed.
    #[must_use]
    pub fn cause(&self) -> &StageError {
        match self {
            Self::Completion(inner) => inner.as_ref(),
            other => other,
        }
    }

    /// Whether the underlying failure is a cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self.cause(), Self::Cancelled)
    }
}

impl From<TaskError> for StageError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => Self::Cancelled,
            TaskError::Failed(cause) => Self::Failed(cause),
            TaskError::Panicked(msg) => Self::Panicked(msg),
            TaskError::Rejected(err) => Self::Rejected(err),
            TaskError::Timeout => Self::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test]
    fn test_wrap_is_idempotent() {
        let once = StageError::failed(DiskOnFire).wrap();
        assert!(once.is_wrapped());
        let twice = once.clone().wrap();
        match (&once, &twice) {
            (StageError::Completion(a), StageError::Completion(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected wrapped errors"),
        }
    }

    #[test]
    fn test_cause_strips_wrapper() {
        let err = StageError::Cancelled.wrap();
        assert!(!matches!(err, StageError::Cancelled));
        assert!(matches!(err.cause(), StageError::Cancelled));
        assert!(err.is_cancellation());
        assert!(!StageError::Timeout.is_cancellation());
    }

    #[test]
    fn test_messages() {
        assert_eq!(StageError::failed(DiskOnFire).to_string(), "stage failed: disk on fire");
        assert_eq!(
            StageError::Cancelled.wrap().to_string(),
            "dependent stage failed: stage was cancelled"
        );
        let panicked = StageError::from_panic(Box::new("oops"));
        assert_eq!(panicked.to_string(), "stage action panicked: oops");
    }

    #[test]
    fn test_from_task_error() {
        assert!(matches!(StageError::from(TaskError::Cancelled), StageError::Cancelled));
        assert!(matches!(
            StageError::from(TaskError::Rejected(RejectedError::Shutdown)),
            StageError::Rejected(RejectedError::Shutdown)
        ));
    }
}
