//! The producer side of a [`Deferred`].
//!
//! A `Settle` is handed to the producer passed to [`Deferred::new`] (or
//! returned by [`Deferred::pair`]) and may be cloned freely. Only the first
//! call to [`resolve`](Settle::resolve), [`reject`](Settle::reject) or
//! [`follow`](Settle::follow) across all clones has any effect.
//!
//! # Examples
//!
//! ```
//! use deferred::{Deferred, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let (settle, d) = Deferred::<String, String>::pair(&scheduler);
//! let late = settle.clone();
//! settle.reject("💥".into());
//! late.resolve("🍓".into());
//! assert_eq!(d.error(), Some("💥".to_owned()));
//! ```
use crate::deferred::{Deferred, Inner, Resolution};
use std::cell::RefCell;
use std::fmt::Debug;
use std::mem;
use std::rc::Rc;
use tracing::{debug, trace, warn};

pub struct Settle<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Settle<T, E> {
    pub(crate) fn attach(inner: Rc<RefCell<Inner<T, E>>>) -> Self {
        inner.borrow_mut().settlers += 1;
        Self { inner }
    }

    /// Whether a settlement (or a follow) has already been accepted.
    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }

    fn lock(&self) -> bool {
        let mut inner = self.inner.borrow_mut();
        !mem::replace(&mut inner.locked, true)
    }
}

impl<T, E> Settle<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: E) {
        self.settle(Err(error));
    }

    pub fn settle(&self, outcome: Result<T, E>) {
        if !self.lock() {
            trace!(deferred = self.inner.borrow().id, "settlement ignored, already locked");
            return;
        }
        Inner::complete(&self.inner, outcome);
    }

    /// Adopt the eventual outcome of `other`.
    pub fn follow(&self, other: &Deferred<T, E>) {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            warn!(
                deferred = self.inner.borrow().id,
                "deferred asked to follow itself; it will never settle"
            );
            return;
        }
        if !self.lock() {
            return;
        }
        let settle = self.clone();
        other.subscribe(move |outcome| Inner::complete(&settle.inner, outcome));
    }

    pub(crate) fn resolve_with(&self, resolution: Resolution<T, E>) {
        match resolution {
            Resolution::Fulfill(value) => self.resolve(value),
            Resolution::Reject(error) => self.reject(error),
            Resolution::Follow(other) => self.follow(&other),
        }
    }
}

impl<T, E> Clone for Settle<T, E> {
    fn clone(&self) -> Self {
        Self::attach(self.inner.clone())
    }
}

impl<T, E> Drop for Settle<T, E> {
    /// The last handle of a pending deferred going away wakes its waiters so
    /// they can observe the abandonment.
    fn drop(&mut self) {
        let wakers = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            inner.settlers -= 1;
            if inner.settlers == 0 && inner.outcome.is_none() {
                debug!(deferred = inner.id, "abandoned before settling");
                mem::take(&mut inner.wakers)
            } else {
                Vec::new()
            }
        };
        for waker in wakers {
            waker.wake()
        }
    }
}

impl<T, E> std::fmt::Debug for Settle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Settle")
            .field("deferred", &inner.id)
            .field("locked", &inner.locked)
            .finish()
    }
}
