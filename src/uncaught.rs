//! The channel for failures that no deferred can catch.
//!
//! A timer callback that fails runs outside the extent of any producer or
//! handler, so there is no deferred to reject. The failure ends up here, as
//! does (when configured) a rejection that reaches the end of a chain.
//!
//! Delivery goes to the first of:
//!
//! 1. the handler set on the scheduler with
//!    [`Scheduler::set_uncaught_handler`](crate::Scheduler::set_uncaught_handler),
//! 2. the process-wide hook registered once with [`install`],
//! 3. a `tracing` error event.
use crate::{Error, TimerId};
use std::any::Any;
use std::fmt;
use std::sync::OnceLock;

type Hook = Box<dyn Fn(&UncaughtFailure) + Send + Sync>;

static HOOK: OnceLock<Hook> = OnceLock::new();

/// Where an uncaught failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A timer callback returned an error.
    Timer(TimerId),
    /// A deferred was rejected and nothing handled it.
    UnhandledRejection,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Timer(id) => write!(f, "timer {id}"),
            Origin::UnhandledRejection => f.write_str("unhandled rejection"),
        }
    }
}

pub struct UncaughtFailure {
    origin: Origin,
    payload: Box<dyn Any>,
    summary: String,
}

impl UncaughtFailure {
    pub(crate) fn new<P: Any + fmt::Debug>(origin: Origin, payload: P) -> Self {
        let summary = format!("{payload:?}");
        Self {
            origin,
            payload: Box::new(payload),
            summary,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn payload(&self) -> &dyn Any {
        self.payload.as_ref()
    }

    /// The failure payload, if it has type `P`.
    pub fn downcast_ref<P: Any>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    /// `Debug` rendering of the payload, taken when the failure was raised.
    pub fn summary(&self) -> &str {
        &self.summary
    }
}

impl fmt::Debug for UncaughtFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncaughtFailure")
            .field("origin", &self.origin)
            .field("payload", &self.summary)
            .finish()
    }
}

impl fmt::Display for UncaughtFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.summary)
    }
}

/// Register the process-wide hook. Meant to be called once at startup;
/// a second call leaves the first hook in place and fails.
pub fn install<F>(hook: F) -> Result<(), Error>
where
    F: Fn(&UncaughtFailure) + Send + Sync + 'static,
{
    HOOK.set(Box::new(hook)).map_err(|_| Error::HookInstalled)
}

pub fn is_installed() -> bool {
    HOOK.get().is_some()
}

/// Hand `failure` to the process-wide hook. Returns `false` when none is
/// installed.
pub(crate) fn dispatch(failure: &UncaughtFailure) -> bool {
    match HOOK.get() {
        Some(hook) => {
            hook(failure);
            true
        }
        None => false,
    }
}
