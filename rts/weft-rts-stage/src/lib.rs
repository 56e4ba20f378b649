//! Lock-free completion stages for the weft runtime.
//!
//! A [`Stage`] is a one-shot result that other computations can be chained
//! onto. Chained actions run when the result arrives, either on the thread
//! that completes it or on an executor, and build new stages in turn.
//!
//! Key features:
//!
//! - **Lock-free registration** - Dependents are pushed onto a Treiber stack
//!   and fired by whichever thread completes the stage
//! - **Bounded recursion** - Completing a long chain drains it iteratively
//! - **Failure relay** - Failures flow to every dependent, wrapped once,
//!   until intercepted
//! - **Cooperative blocking** - `join` and `get` park through the
//!   scheduler's managed blocking, so waiting workers are compensated
//!
//! # Chaining
//!
//! ```ignore
//! use weft_rts_stage::{all_of, Stage};
//!
//! let price = Stage::supply_async(|| 40);
//! let tax = Stage::supply_async(|| 2);
//! let total = price.then_combine(&tax, |p, t| p + t);
//! assert_eq!(total.join()?, 42);
//!
//! let all = all_of(&[price, tax]);
//! all.join()?;
//! ```
//!
//! # Completion
//!
//! ```text
//!   complete(v) / fail / cancel
//!              |
//!              v  CAS from empty, first wins
//!        +-----------+
//!        |  outcome  |
//!        +-----------+
//!              |
//!              v  pop and fire each dependent
//!        +-----------+   completes   +-----------+
//!        | dependent | ------------> |  its own  |
//!        +-----------+               | dependents|
//!                                    +-----------+
//!                                      drained by the same loop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod error;
mod executor;
mod nodes;
mod outcome;
mod signaller;
mod stack;
mod stage;
mod tree;

pub use error::StageError;
pub use executor::default_executor;
pub use signaller::{set_wait_spins, wait_spins, DEFAULT_WAIT_SPINS, ENV_WAIT_SPINS};
pub use stage::Stage;
pub use tree::{all_of, any_of};
