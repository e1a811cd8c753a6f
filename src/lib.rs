//! A single-threaded deferred value (a promise) with an explicit scheduler.
//!
//! A [`Deferred`] settles exactly once, to a value or to an error. Reactions
//! attached with [`Deferred::then`], [`Deferred::and_then`] or
//! [`Deferred::catch`] never run inside the call that settles it: they are
//! queued as microtasks on the [`Scheduler`] that owns the deferred and run on
//! the next drain.
//!
//! # Examples
//!
//! ```
//! use deferred::{Deferred, Scheduler, State};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new();
//! let d: Deferred<bool, String> = Deferred::new(&scheduler, |settle| {
//!     scheduler.set_timeout(Duration::from_millis(1000), move || settle.resolve(true));
//!     Ok(())
//! });
//! let after = d.and_then(|v| Ok(!v));
//! assert_eq!(after.state(), State::Pending);
//!
//! scheduler.run_until_idle().unwrap();
//! assert_eq!(after.value(), Some(false));
//! ```
pub mod config;
pub mod deferred;
pub mod scheduler;
pub mod settle;
pub mod uncaught;

pub use config::{RejectionPolicy, SchedulerConfig};
pub use deferred::{Deferred, IntoResolution, Resolution, State};
pub use scheduler::{Scheduler, TaskOutcome, TimerId};
pub use settle::Settle;
pub use uncaught::{Origin, UncaughtFailure};

/// Errors reported by the crate itself. Payload errors of a [`Deferred`]
/// travel through its own `Result<T, E>` and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("every settle handle was dropped before the deferred settled")]
    Abandoned,
    #[error("the deferred has not settled yet")]
    Pending,
    #[error("the scheduler is already running a task")]
    Reentrant,
    #[error("microtask budget of {budget} exhausted within a single drain")]
    BudgetExhausted { budget: usize },
    #[error("a process-wide uncaught-failure hook is already installed")]
    HookInstalled,
}
