//! The task queue deferreds run their reactions on.
//!
//! Two queues, one thread:
//!
//! - microtasks: FIFO, used for continuations. A drain runs until the queue
//!   is empty, including work queued while draining.
//! - timers: callbacks keyed by a due time on a virtual clock. Firing one is
//!   a macrotask and is always followed by a full microtask drain.
//!
//! Nothing runs until one of [`Scheduler::run_microtasks`],
//! [`Scheduler::advance`] or [`Scheduler::run_until_idle`] is called, which
//! makes ordering deterministic in tests.
use crate::config::{RejectionPolicy, SchedulerConfig};
use crate::uncaught::{self, Origin, UncaughtFailure};
use crate::Error;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace};

type Microtask = Box<dyn FnOnce()>;
type Macrotask = Box<dyn FnOnce() -> Option<UncaughtFailure>>;
type Handler = Rc<dyn Fn(&UncaughtFailure)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a timer callback may return. `Err` is an escape: it is not tied to
/// any deferred and goes to the uncaught channel.
pub trait TaskOutcome {
    fn into_failure(self, origin: Origin) -> Option<UncaughtFailure>;
}

impl TaskOutcome for () {
    fn into_failure(self, _origin: Origin) -> Option<UncaughtFailure> {
        None
    }
}

impl<P: Any + fmt::Debug> TaskOutcome for Result<(), P> {
    fn into_failure(self, origin: Origin) -> Option<UncaughtFailure> {
        self.err().map(|payload| UncaughtFailure::new(origin, payload))
    }
}

/// A rejected deferred waiting to be checked at the end of a drain.
pub(crate) trait WatchedRejection {
    fn unhandled_failure(&self) -> Option<UncaughtFailure>;
}

#[derive(Default)]
struct Queue {
    microtasks: VecDeque<Microtask>,
    timers: BTreeMap<(Duration, u64), Macrotask>,
    now: Duration,
    next_timer: u64,
    watched: Vec<Rc<dyn WatchedRejection>>,
}

struct Shared {
    config: SchedulerConfig,
    queue: RefCell<Queue>,
    running: Cell<bool>,
    next_deferred: Cell<u64>,
    handler: RefCell<Option<Handler>>,
}

/// Cheap to clone; every clone drives the same queues.
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

/// Held by deferreds so a pending timer does not keep its scheduler alive.
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Shared>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|shared| Scheduler { shared })
    }
}

struct RunGuard<'a>(&'a Cell<bool>);

impl<'a> RunGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Result<Self, Error> {
        if flag.replace(true) {
            return Err(Error::Reentrant);
        }
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                queue: RefCell::new(Queue::default()),
                running: Cell::new(false),
                next_deferred: Cell::new(0),
                handler: RefCell::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Rc::downgrade(&self.shared))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Current reading of the virtual clock.
    pub fn now(&self) -> Duration {
        self.shared.queue.borrow().now
    }

    pub fn pending_microtasks(&self) -> usize {
        self.shared.queue.borrow().microtasks.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.queue.borrow().timers.len()
    }

    pub fn is_idle(&self) -> bool {
        let queue = self.shared.queue.borrow();
        queue.microtasks.is_empty() && queue.timers.is_empty()
    }

    /// Run `task` on the next microtask drain, after everything already queued.
    pub fn queue_microtask<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.shared
            .queue
            .borrow_mut()
            .microtasks
            .push_back(Box::new(task));
    }

    /// Run `callback` once the virtual clock has moved `delay` past now.
    /// Timers due at the same instant fire in registration order. A delay
    /// that reaches past the end of the clock is clamped to it, and such a
    /// timer is never due for [`Scheduler::advance`].
    pub fn set_timeout<F, R>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> R + 'static,
        R: TaskOutcome,
    {
        let mut queue = self.shared.queue.borrow_mut();
        let id = TimerId(queue.next_timer);
        queue.next_timer += 1;
        let due = queue.now.saturating_add(delay);
        queue.timers.insert(
            (due, id.0),
            Box::new(move || callback().into_failure(Origin::Timer(id))),
        );
        debug!(timer = %id, ?delay, "timer registered");
        id
    }

    /// Cancel a timer that has not fired yet.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        let mut queue = self.shared.queue.borrow_mut();
        let key = queue.timers.keys().find(|(_, seq)| *seq == id.0).copied();
        let task = key.and_then(|key| queue.timers.remove(&key));
        drop(queue);
        task.is_some()
    }

    /// Install the uncaught-failure handler for this scheduler. It takes
    /// precedence over the process-wide hook.
    pub fn set_uncaught_handler<F>(&self, handler: F)
    where
        F: Fn(&UncaughtFailure) + 'static,
    {
        *self.shared.handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub fn clear_uncaught_handler(&self) {
        self.shared.handler.borrow_mut().take();
    }

    /// Drain the microtask queue. Returns the number of microtasks run.
    pub fn run_microtasks(&self) -> Result<usize, Error> {
        let _guard = RunGuard::enter(&self.shared.running)?;
        self.drain()
    }

    /// Move the clock forward by `by`, firing every timer that falls due on
    /// the way. Returns the number of tasks run, microtasks included.
    pub fn advance(&self, by: Duration) -> Result<usize, Error> {
        let _guard = RunGuard::enter(&self.shared.running)?;
        let mut ran = self.drain()?;
        let target = self.now().saturating_add(by);
        while let Some(task) = self.pop_due(Some(target)) {
            ran += self.fire(task)?;
        }
        self.shared.queue.borrow_mut().now = target;
        Ok(ran)
    }

    /// Run until both queues are empty, jumping the clock to each timer.
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let _guard = RunGuard::enter(&self.shared.running)?;
        let mut ran = self.drain()?;
        while let Some(task) = self.pop_due(None) {
            ran += self.fire(task)?;
        }
        Ok(ran)
    }

    fn drain(&self) -> Result<usize, Error> {
        let budget = self.shared.config.microtask_budget;
        let mut ran = 0;
        loop {
            let next = self.shared.queue.borrow_mut().microtasks.pop_front();
            let Some(task) = next else { break };
            if ran == budget {
                self.shared.queue.borrow_mut().microtasks.push_front(task);
                return Err(Error::BudgetExhausted { budget });
            }
            task();
            ran += 1;
        }
        if ran > 0 {
            trace!(ran, "microtasks drained");
        }
        self.flush_rejections();
        Ok(ran)
    }

    fn pop_due(&self, limit: Option<Duration>) -> Option<Macrotask> {
        let mut queue = self.shared.queue.borrow_mut();
        let (&(due, _), _) = queue.timers.first_key_value()?;
        if limit.is_some_and(|limit| due > limit || due == Duration::MAX) {
            return None;
        }
        let ((_, seq), task) = queue.timers.pop_first()?;
        queue.now = queue.now.max(due);
        debug!(timer = %TimerId(seq), now = ?queue.now, "timer fired");
        Some(task)
    }

    fn fire(&self, task: Macrotask) -> Result<usize, Error> {
        if let Some(failure) = task() {
            self.report(failure);
        }
        Ok(1 + self.drain()?)
    }

    fn flush_rejections(&self) {
        let watched = std::mem::take(&mut self.shared.queue.borrow_mut().watched);
        for rejection in watched {
            if let Some(failure) = rejection.unhandled_failure() {
                self.report(failure);
            }
        }
    }

    pub(crate) fn watch_rejection(&self, rejection: Rc<dyn WatchedRejection>) {
        if self.shared.config.unhandled_rejections == RejectionPolicy::Report {
            self.shared.queue.borrow_mut().watched.push(rejection);
        }
    }

    pub(crate) fn report(&self, failure: UncaughtFailure) {
        debug!(origin = %failure.origin(), "uncaught failure");
        let handler = self.shared.handler.borrow().clone();
        if let Some(handler) = handler {
            handler(&failure);
            return;
        }
        if uncaught::dispatch(&failure) {
            return;
        }
        error!(
            origin = %failure.origin(),
            payload = failure.summary(),
            "uncaught failure with no handler installed"
        );
    }

    pub(crate) fn next_deferred_id(&self) -> u64 {
        let id = self.shared.next_deferred.get();
        self.shared.next_deferred.set(id + 1);
        id
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.borrow();
        f.debug_struct("Scheduler")
            .field("now", &queue.now)
            .field("microtasks", &queue.microtasks.len())
            .field("timers", &queue.timers.len())
            .finish()
    }
}
