//! Where `*_async` actions run when no executor is given.

use std::sync::{Arc, OnceLock};
use weft_rts_scheduler::{Executor, Scheduler, ThreadPerTaskExecutor};

/// Name of threads started by the fallback executor.
const ASYNC_THREAD_NAME: &str = "weft-stage-async";

/// The executor behind every `*_async` combinator.
///
/// The common scheduler, unless its parallelism is one. A single worker
/// could be tied up by a blocking action, so each action then gets its own
/// thread instead.
#[must_use]
pub fn default_executor() -> Arc<dyn Executor> {
    static DEFAULT: OnceLock<Arc<dyn Executor>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| {
        let common = Scheduler::common();
        if common.parallelism() > 1 {
            tracing::debug!(parallelism = common.parallelism(), "async stages use the common scheduler");
            Arc::new(common.clone())
        } else {
            tracing::debug!("async stages use a thread per action");
            Arc::new(ThreadPerTaskExecutor::named(ASYNC_THREAD_NAME))
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_default_executor_runs_actions() {
        let (tx, rx) = mpsc::channel();
        default_executor()
            .execute(Box::new(move || {
                tx.send(3).unwrap();
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 3);
    }

    #[test]
    fn test_default_executor_is_shared() {
        assert!(Arc::ptr_eq(&default_executor(), &default_executor()));
    }
}
