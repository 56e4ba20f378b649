//! Joining many stages through balanced trees of relays.

use crate::nodes::{push_on_both, AllRelay, Dependent};
use crate::stack::{Completion, Mode, StageCore};
use crate::stage::Stage;
use std::sync::Arc;

/// A unit stage completed once every stage in `stages` has completed.
///
/// If any of them failed, the result fails with one of their failures,
/// wrapped once. An empty slice gives an already completed stage.
/// Relays are arranged as a balanced binary tree, so completing a single
/// input does work logarithmic in the number of inputs.
pub fn all_of<T>(stages: &[Stage<T>]) -> Stage<()>
where
    T: Clone + Send + Sync + 'static,
{
    if stages.is_empty() {
        return Stage::completed(());
    }
    let cores: Vec<Arc<dyn StageCore>> = stages.iter().map(Stage::core).collect();
    and_tree(&cores)
}

fn and_tree(cores: &[Arc<dyn StageCore>]) -> Stage<()> {
    let hi = cores.len() - 1;
    let mid = hi / 2;
    let a = if mid == 0 {
        Arc::clone(&cores[0])
    } else {
        and_tree(&cores[..=mid]).core()
    };
    let b = if hi == 0 {
        Arc::clone(&a)
    } else if hi == mid + 1 {
        Arc::clone(&cores[hi])
    } else {
        and_tree(&cores[mid + 1..]).core()
    };

    let dep = Stage::new();
    let node = Dependent::new(
        None,
        dep.clone(),
        Box::new(AllRelay {
            a: Arc::clone(&a),
            b: Arc::clone(&b),
        }),
    );
    push_on_both(&*a, &*b, Arc::clone(&node) as Arc<dyn Completion>);
    node.fire(Mode::Sync);
    dep
}

/// A stage completed with the outcome of whichever stage in `stages`
/// completes first. Failures are relayed wrapped once. An empty slice gives
/// a stage that never completes on its own.
pub fn any_of<T>(stages: &[Stage<T>]) -> Stage<T>
where
    T: Clone + Send + Sync + 'static,
{
    match stages {
        [] => Stage::new(),
        [only] => only.relay_either(only),
        _ => or_tree(stages),
    }
}

fn or_tree<T>(stages: &[Stage<T>]) -> Stage<T>
where
    T: Clone + Send + Sync + 'static,
{
    let hi = stages.len() - 1;
    let mid = hi / 2;
    let a = if mid == 0 {
        stages[0].clone()
    } else {
        or_tree(&stages[..=mid])
    };
    let b = if hi == 0 {
        a.clone()
    } else if hi == mid + 1 {
        stages[hi].clone()
    } else {
        or_tree(&stages[mid + 1..])
    };
    a.relay_either(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;

    #[test]
    fn test_all_of_empty_is_complete() {
        let none: [Stage<u8>; 0] = [];
        assert!(all_of(&none).is_done());
    }

    #[test]
    fn test_all_of_waits_for_every_input() {
        let stages: Vec<Stage<usize>> = (0..9).map(|_| Stage::new()).collect();
        let all = all_of(&stages);
        for (i, stage) in stages.iter().enumerate() {
            assert!(!all.is_done());
            stage.complete(i);
        }
        assert!(all.join().is_ok());
    }

    #[test]
    fn test_any_of_single_input() {
        let only: Stage<&str> = Stage::new();
        let any = any_of(std::slice::from_ref(&only));
        only.complete("x");
        assert_eq!(any.join().unwrap(), "x");
    }

    #[test]
    fn test_any_of_empty_never_completes() {
        let none: [Stage<u8>; 0] = [];
        assert!(!any_of(&none).is_done());
    }

    #[test]
    fn test_all_of_fails_with_input_failure() {
        let stages: Vec<Stage<u8>> = (0..5).map(|_| Stage::new()).collect();
        let all = all_of(&stages);
        stages[3].cancel();
        for stage in &stages {
            stage.complete(1);
        }
        let err = all.join().unwrap_err();
        assert!(err.is_cancellation());
        assert!(matches!(err, StageError::Completion(_)));
    }
}
