//! The deferred value itself.
//!
//! A [`Deferred`] is a shared handle: clones observe the same settlement.
//! It starts [`State::Pending`] and moves exactly once to
//! [`State::Fulfilled`] or [`State::Rejected`]. Reactions registered before
//! or after that move each run once, in registration order, as separate
//! microtasks on the owning [`Scheduler`].
//!
//! Returning `Err(e)` from a producer or a handler is how a computation
//! fails synchronously; the error becomes the rejection. Anything that fails
//! later, from a timer the producer set up, cannot reach the deferred at all
//! and is sent to the [uncaught channel](crate::uncaught) instead.
use crate::scheduler::{Scheduler, WatchedRejection, WeakScheduler};
use crate::settle::Settle;
use crate::uncaught::{Origin, UncaughtFailure};
use crate::Error;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

type Continuation<T, E> = Box<dyn FnOnce(Result<T, E>)>;

pub(crate) struct Inner<T, E> {
    pub(crate) id: u64,
    pub(crate) outcome: Option<Result<T, E>>,
    /// Set by the first resolve, reject or follow. Later calls are ignored
    /// even while a followed deferred keeps this one pending.
    pub(crate) locked: bool,
    /// Live [`Settle`] handles.
    pub(crate) settlers: usize,
    /// Something reacts to a rejection: a continuation or an awaiting future.
    pub(crate) handled: bool,
    pub(crate) continuations: Vec<Continuation<T, E>>,
    pub(crate) wakers: Vec<Waker>,
    /// Weak, so a settle handle parked in a timer does not keep the
    /// scheduler's queues alive.
    pub(crate) scheduler: WeakScheduler,
}

impl<T, E> Inner<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Pending -> Fulfilled/Rejected. No-op once settled.
    pub(crate) fn complete(cell: &Rc<RefCell<Self>>, outcome: Result<T, E>) {
        let (continuations, wakers, scheduler, id, unhandled) = {
            let mut guard = cell.borrow_mut();
            let inner = &mut *guard;
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(outcome.clone());
            (
                mem::take(&mut inner.continuations),
                mem::take(&mut inner.wakers),
                inner.scheduler.clone(),
                inner.id,
                outcome.is_err() && !inner.handled,
            )
        };
        trace!(
            deferred = id,
            fulfilled = outcome.is_ok(),
            continuations = continuations.len(),
            "settled"
        );
        let Some(scheduler) = scheduler.upgrade() else {
            trace!(deferred = id, "scheduler gone, dropping continuations");
            drop(continuations);
            wakers.into_iter().for_each(Waker::wake);
            return;
        };
        for reaction in continuations {
            let outcome = outcome.clone();
            scheduler.queue_microtask(move || reaction(outcome));
        }
        for waker in wakers {
            waker.wake();
        }
        if unhandled {
            scheduler.watch_rejection(cell.clone());
        }
    }
}

impl<T, E> WatchedRejection for RefCell<Inner<T, E>>
where
    T: 'static,
    E: Clone + Debug + 'static,
{
    fn unhandled_failure(&self) -> Option<UncaughtFailure> {
        let inner = self.borrow();
        match &inner.outcome {
            Some(Err(error)) if !inner.handled => Some(UncaughtFailure::new(
                Origin::UnhandledRejection,
                error.clone(),
            )),
            _ => None,
        }
    }
}

/// What a handler hands back to the deferred it feeds.
#[derive(Debug)]
pub enum Resolution<T, E> {
    Fulfill(T),
    Reject(E),
    /// Settle the same way `Deferred` eventually does.
    Follow(Deferred<T, E>),
}

impl<T, E> From<Result<T, E>> for Resolution<T, E> {
    fn from(outcome: Result<T, E>) -> Self {
        match outcome {
            Ok(value) => Resolution::Fulfill(value),
            Err(error) => Resolution::Reject(error),
        }
    }
}

/// Handler return types: a plain `Result`, another [`Deferred`] to chain on,
/// or a [`Resolution`] when a handler needs to pick at runtime.
pub trait IntoResolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E>;
}

impl<T, E> IntoResolution<T, E> for Result<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        self.into()
    }
}

impl<T, E> IntoResolution<T, E> for Deferred<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Follow(self)
    }
}

impl<T, E> IntoResolution<T, E> for Resolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        self
    }
}

pub struct Deferred<T, E> {
    pub(crate) inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Run `producer` right away with the settle capability. An `Err` from
    /// the producer rejects the deferred instead of reaching the caller.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Deferred, Scheduler, State};
    ///
    /// let scheduler = Scheduler::new();
    /// let d: Deferred<(), &str> = Deferred::new(&scheduler, |_settle| Err("bad"));
    /// assert_eq!(d.state(), State::Rejected);
    /// assert_eq!(d.error(), Some("bad"));
    /// ```
    pub fn new<F>(scheduler: &Scheduler, producer: F) -> Self
    where
        F: FnOnce(Settle<T, E>) -> Result<(), E>,
    {
        let (settle, deferred) = Self::pair(scheduler);
        if let Err(error) = producer(settle.clone()) {
            trace!(deferred = deferred.id(), "producer failed synchronously");
            settle.reject(error);
        }
        deferred
    }

    /// A pending deferred and the capability that settles it.
    pub fn pair(scheduler: &Scheduler) -> (Settle<T, E>, Self) {
        let inner = Rc::new(RefCell::new(Inner {
            id: scheduler.next_deferred_id(),
            outcome: None,
            locked: false,
            settlers: 0,
            handled: false,
            continuations: Vec::new(),
            wakers: Vec::new(),
            scheduler: scheduler.downgrade(),
        }));
        (Settle::attach(inner.clone()), Self { inner })
    }

    pub fn resolved(scheduler: &Scheduler, value: T) -> Self {
        let (settle, deferred) = Self::pair(scheduler);
        settle.resolve(value);
        deferred
    }

    pub fn rejected(scheduler: &Scheduler, error: E) -> Self {
        let (settle, deferred) = Self::pair(scheduler);
        settle.reject(error);
        deferred
    }

    pub fn state(&self) -> State {
        match &self.inner.borrow().outcome {
            None => State::Pending,
            Some(Ok(_)) => State::Fulfilled,
            Some(Err(_)) => State::Rejected,
        }
    }

    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().outcome {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<E> {
        match &self.inner.borrow().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// The settled outcome, or why there is none yet.
    pub fn try_outcome(&self) -> Result<Result<T, E>, Error> {
        let inner = self.inner.borrow();
        match &inner.outcome {
            Some(outcome) => Ok(outcome.clone()),
            None if inner.settlers == 0 => Err(Error::Abandoned),
            None => Err(Error::Pending),
        }
    }

    /// Pending with no settle handle left: it can never settle.
    pub fn is_abandoned(&self) -> bool {
        matches!(self.try_outcome(), Err(Error::Abandoned))
    }

    /// The scheduler reactions are queued on, while it is still alive.
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.inner.borrow().scheduler.upgrade()
    }

    /// React to either outcome. The returned deferred settles with whatever
    /// the handler that ran returns; a returned [`Deferred`] is followed.
    pub fn then<U, F, G, R1, R2>(&self, on_fulfilled: F, on_rejected: G) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R1 + 'static,
        G: FnOnce(E) -> R2 + 'static,
        R1: IntoResolution<U, E>,
        R2: IntoResolution<U, E>,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).into_resolution(),
            Err(error) => on_rejected(error).into_resolution(),
        })
    }

    /// `then` without a rejection handler: a rejection passes through.
    pub fn and_then<U, F, R>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<U, E>,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).into_resolution(),
            Err(error) => Resolution::Reject(error),
        })
    }

    /// `then` without a fulfilment handler: a value passes through.
    pub fn catch<F, R>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> R + 'static,
        R: IntoResolution<T, E>,
    {
        self.derive(move |outcome| match outcome {
            Ok(value) => Resolution::Fulfill(value),
            Err(error) => on_rejected(error).into_resolution(),
        })
    }

    /// Run `on_settled` on either outcome and pass the outcome on unchanged.
    pub fn finally<F>(&self, on_settled: F) -> Deferred<T, E>
    where
        F: FnOnce() + 'static,
    {
        self.derive(move |outcome| {
            on_settled();
            outcome.into()
        })
    }

    fn derive<U, H>(&self, handler: H) -> Deferred<U, E>
    where
        U: Clone + 'static,
        H: FnOnce(Result<T, E>) -> Resolution<U, E> + 'static,
    {
        // Without a scheduler the reaction is dropped, so the derived
        // deferred ends up abandoned on a detached one.
        let scheduler = self.scheduler().unwrap_or_default();
        let (settle, derived) = Deferred::pair(&scheduler);
        self.subscribe(move |outcome| settle.resolve_with(handler(outcome)));
        derived
    }

    /// Queue `reaction` for the outcome. Already settled: it is queued now,
    /// never run inline.
    pub(crate) fn subscribe<F>(&self, reaction: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.handled = true;
        match inner.outcome.clone() {
            None => inner.continuations.push(Box::new(reaction)),
            Some(outcome) => {
                let scheduler = inner.scheduler.upgrade();
                drop(guard);
                match scheduler {
                    Some(scheduler) => scheduler.queue_microtask(move || reaction(outcome)),
                    None => trace!("scheduler gone, dropping reaction"),
                }
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.borrow().id
    }
}

impl<T, E> Future for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Result<Result<T, E>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.handled = true;
        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(Ok(outcome.clone()));
        }
        if inner.settlers == 0 {
            return Poll::Ready(Err(Error::Abandoned));
        }
        inner.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl<T: Debug, E: Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.borrow().outcome {
            None => f.write_str("Deferred { <pending> }"),
            Some(Ok(value)) => write!(f, "Deferred {{ {value:?} }}"),
            Some(Err(error)) => write!(f, "Deferred {{ <rejected> {error:?} }}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RejectionPolicy, SchedulerConfig};
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::Cell;

    #[test]
    fn test_deferred_resolve() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<String, ()>::pair(&scheduler);
        assert_eq!(d.state(), State::Pending);
        assert_eq!(d.try_outcome(), Err(Error::Pending));

        settle.resolve("🍓".into());
        assert_eq!(d.state(), State::Fulfilled);
        assert_eq!(d.value(), Some("🍓".to_owned()));
        assert_eq!(d.error(), None);
    }

    #[test]
    fn test_deferred_reject() {
        let scheduler = Scheduler::new();
        let d = Deferred::<(), String>::rejected(&scheduler, "reject!!".into());
        assert_eq!(d.state(), State::Rejected);
        assert_eq!(d.try_outcome(), Ok(Err("reject!!".to_owned())));
    }

    #[test]
    fn test_first_settlement_wins() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<i32, &str>::pair(&scheduler);
        let other = settle.clone();
        settle.resolve(1);
        other.reject("late");
        settle.resolve(2);
        assert_eq!(d.try_outcome(), Ok(Ok(1)));
    }

    #[test]
    fn test_continuation_is_not_run_inside_settle() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<i32, ()>::pair(&scheduler);
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let _ = d.and_then(move |v| {
            flag.set(true);
            Ok(v)
        });
        settle.resolve(1);
        assert!(!ran.get());
        assert_eq!(scheduler.pending_microtasks(), 1);
        scheduler.run_microtasks().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn test_late_registration_still_runs_asynchronously() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, ()>::resolved(&scheduler, 5);
        let seen = Rc::new(Cell::new(None));
        let sink = seen.clone();
        let _ = d.and_then(move |v| {
            sink.set(Some(v));
            Ok(())
        });
        assert_eq!(seen.get(), None);
        scheduler.run_microtasks().unwrap();
        assert_eq!(seen.get(), Some(5));
    }

    #[test]
    fn test_handler_error_rejects_derived() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, String>::resolved(&scheduler, 1);
        let derived = d.and_then(|_| Err::<i32, _>("handler failed".to_owned()));
        scheduler.run_microtasks().unwrap();
        assert_eq!(derived.error(), Some("handler failed".to_owned()));
    }

    #[test]
    fn test_follow_returned_deferred() {
        let scheduler = Scheduler::new();
        let (inner_settle, inner) = Deferred::<i32, &str>::pair(&scheduler);
        let d = Deferred::<i32, &str>::resolved(&scheduler, 1);
        let chained = d.and_then(move |_| inner);
        scheduler.run_microtasks().unwrap();
        assert_eq!(chained.state(), State::Pending);

        inner_settle.reject("inner failed");
        scheduler.run_microtasks().unwrap();
        assert_eq!(chained.error(), Some("inner failed"));
    }

    #[test]
    fn test_resolution_picked_at_runtime() {
        let scheduler = Scheduler::new();
        let d = Deferred::<i32, &str>::resolved(&scheduler, 3);
        let other = scheduler.clone();
        let derived = d.and_then(move |v| {
            if v > 2 {
                Resolution::Follow(Deferred::resolved(&other, v * 10))
            } else {
                Resolution::Reject("too small")
            }
        });
        scheduler.run_microtasks().unwrap();
        assert_eq!(derived.value(), Some(30));
    }

    #[test]
    fn test_finally_passes_outcome_through() {
        let scheduler = Scheduler::new();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let d = Deferred::<(), &str>::rejected(&scheduler, "boom");
        let after = d.finally(move || counter.set(counter.get() + 1));
        scheduler.run_microtasks().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(after.error(), Some("boom"));
    }

    #[test]
    fn test_dropping_every_settle_abandons() {
        let scheduler = Scheduler::new();
        let d: Deferred<i32, ()> = Deferred::new(&scheduler, |_settle| Ok(()));
        assert_eq!(d.state(), State::Pending);
        assert!(d.is_abandoned());
        assert_eq!(d.try_outcome(), Err(Error::Abandoned));
    }

    #[test]
    fn test_abandonment_propagates_along_chain() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<i32, ()>::pair(&scheduler);
        let derived = d.and_then(|v| Ok(v + 1));
        assert!(!derived.is_abandoned());
        drop(settle);
        drop(d);
        assert!(derived.is_abandoned());
    }

    #[test]
    fn test_dropping_scheduler_releases_timer_held_settle() {
        let scheduler = Scheduler::new();
        let d: Deferred<bool, String> = Deferred::new(&scheduler, |settle| {
            scheduler.set_timeout(std::time::Duration::from_millis(1000), move || {
                settle.resolve(true)
            });
            Ok(())
        });
        assert!(d.scheduler().is_some());
        assert!(!d.is_abandoned());

        drop(scheduler);
        assert!(d.scheduler().is_none());
        assert_eq!(d.state(), State::Pending);
        assert!(d.is_abandoned());
    }

    #[test]
    fn test_settling_after_scheduler_is_gone() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<i32, ()>::pair(&scheduler);
        let next = d.and_then(|v| Ok(v + 1));
        drop(scheduler);

        settle.resolve(1);
        assert_eq!(d.value(), Some(1));
        assert!(next.is_abandoned());
        assert!(d.and_then(|v| Ok(v * 2)).is_abandoned());
    }

    #[test]
    fn test_handler_returning_its_own_deferred_never_settles() {
        let scheduler = Scheduler::new();
        let slot: Rc<RefCell<Option<Deferred<i32, &str>>>> = Rc::new(RefCell::new(None));
        let own = slot.clone();
        let d = Deferred::<i32, &str>::resolved(&scheduler, 1);
        let derived = d.and_then(move |_| match own.borrow_mut().take() {
            Some(itself) => Resolution::Follow(itself),
            None => Resolution::Reject("slot empty"),
        });
        *slot.borrow_mut() = Some(derived.clone());

        scheduler.run_until_idle().unwrap();
        assert!(slot.borrow().is_none());
        assert_eq!(derived.state(), State::Pending);
        assert_eq!(derived.try_outcome(), Err(Error::Abandoned));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_debug_renders_like_an_inspector() {
        let scheduler = Scheduler::new();
        let (settle, d) = Deferred::<bool, &str>::pair(&scheduler);
        assert_eq!(format!("{d:?}"), "Deferred { <pending> }");
        settle.resolve(true);
        assert_eq!(format!("{d:?}"), "Deferred { true }");
        let r = Deferred::<bool, &str>::rejected(&scheduler, "Some rejected value");
        assert_eq!(format!("{r:?}"), "Deferred { <rejected> \"Some rejected value\" }");
    }

    #[test]
    fn test_await_resolved_value() {
        let scheduler = Scheduler::new();
        let mut pool = LocalPool::new();
        let (settle, d) = Deferred::<String, ()>::pair(&scheduler);
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        pool.spawner()
            .spawn_local(async move {
                *sink.borrow_mut() = Some(d.await);
            })
            .unwrap();
        pool.run_until_stalled();
        assert!(got.borrow().is_none());

        settle.resolve("Hi".into());
        pool.run_until_stalled();
        assert_eq!(*got.borrow(), Some(Ok(Ok("Hi".to_owned()))));
    }

    #[test]
    fn test_await_abandoned() {
        let scheduler = Scheduler::new();
        let mut pool = LocalPool::new();
        let (settle, d) = Deferred::<String, ()>::pair(&scheduler);
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        pool.spawner()
            .spawn_local(async move {
                *sink.borrow_mut() = Some(d.await);
            })
            .unwrap();
        pool.run_until_stalled();
        drop(settle);
        pool.run_until_stalled();
        assert_eq!(*got.borrow(), Some(Err(Error::Abandoned)));
    }

    fn reporting() -> (Scheduler, Rc<RefCell<Vec<String>>>) {
        let scheduler = Scheduler::with_config(
            SchedulerConfig::default().with_unhandled_rejections(RejectionPolicy::Report),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        scheduler.set_uncaught_handler(move |failure| {
            assert_eq!(failure.origin(), Origin::UnhandledRejection);
            sink.borrow_mut().push(failure.summary().to_owned());
        });
        (scheduler, seen)
    }

    #[test]
    fn test_unhandled_rejection_reported_at_end_of_chain() {
        let (scheduler, seen) = reporting();
        let d = Deferred::<i32, &str>::rejected(&scheduler, "lost");
        let _tail = d.and_then(|v| Ok(v + 1));
        scheduler.run_microtasks().unwrap();
        // Only the tail of the chain is unhandled.
        assert_eq!(*seen.borrow(), ["\"lost\""]);
    }

    #[test]
    fn test_caught_rejection_not_reported() {
        let (scheduler, seen) = reporting();
        let d = Deferred::<i32, &str>::rejected(&scheduler, "lost");
        let _ = d.catch(|_| Ok(0));
        scheduler.run_microtasks().unwrap();
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_ignore_policy_stays_quiet() {
        let scheduler = Scheduler::new();
        let reported = Rc::new(Cell::new(false));
        let flag = reported.clone();
        scheduler.set_uncaught_handler(move |_| flag.set(true));
        let d = Deferred::<i32, &str>::rejected(&scheduler, "lost");
        scheduler.run_microtasks().unwrap();
        assert_eq!(d.state(), State::Rejected);
        assert!(!reported.get());
    }
}
