//! Error types reported by the scheduler and its tasks.

use std::any::Any;
use std::error::Error;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// A shared, type-erased failure cause.
///
/// Failures are recorded once and handed out to every joiner, so they are
/// reference counted rather than boxed.
pub type Cause = Arc<dyn Error + Send + Sync + 'static>;

/// The scheduler could not accept a unit of work.
///
/// Rejection is always reported to the submitter; work is never dropped
/// silently.
#[derive(Debug, Clone, Error)]
pub enum RejectedError {
    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    Shutdown,
    /// A blocked worker could not be replaced without exceeding the worker cap.
    #[error("worker limit of {limit} exceeded while replacing a blocked worker")]
    PoolExhausted {
        /// Maximum number of workers the scheduler may run.
        limit: usize,
    },
    /// A work queue reached its maximum capacity.
    #[error("work queue capacity of {capacity} exceeded")]
    QueueCapacity {
        /// Maximum number of slots in a work queue.
        capacity: usize,
    },
    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(Arc<io::Error>),
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was cancelled before it completed.
    #[error("task was cancelled")]
    Cancelled,
    /// The task was completed exceptionally with the given cause.
    #[error("task failed: {0}")]
    Failed(Cause),
    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(Arc<str>),
    /// The scheduler refused work needed to make progress.
    #[error(transparent)]
    Rejected(#[from] RejectedError),
    /// A timed wait elapsed before the task completed.
    #[error("timed out waiting for task")]
    Timeout,
}

impl TaskError {
    /// Wrap an arbitrary error as a task failure.
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

    /// Check whether this error reports a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// An environment override or configuration value was invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
        /// Parser message.
        reason: String,
    },
    /// Parallelism outside the supported range.
    #[error("parallelism must be between 1 and {max}, got {got}")]
    Parallelism {
        /// Requested parallelism.
        got: usize,
        /// Largest supported parallelism.
        max: usize,
    },
}

/// Extract a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_rejected_display() {
        let err = RejectedError::PoolExhausted { limit: 260 };
        assert_eq!(
            err.to_string(),
            "worker limit of 260 exceeded while replacing a blocked worker"
        );
        assert_eq!(RejectedError::Shutdown.to_string(), "scheduler is shut down");
    }

    #[test]
    fn test_task_error_failed_keeps_cause() {
        let err = TaskError::failed(DiskError);
        match &err {
            TaskError::Failed(cause) => assert_eq!(cause.to_string(), "disk on fire"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.to_string(), "task failed: disk on fire");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static msg");
        assert_eq!(panic_message(boxed.as_ref()), "static msg");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned msg"));
        assert_eq!(panic_message(boxed.as_ref()), "owned msg");
        let boxed: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(boxed.as_ref()), "Box<dyn Any>");
    }

    #[test]
    fn test_rejected_converts_into_task_error() {
        let err: TaskError = RejectedError::Shutdown.into();
        assert!(matches!(err, TaskError::Rejected(RejectedError::Shutdown)));
        assert_eq!(err.to_string(), "scheduler is shut down");
    }
}
