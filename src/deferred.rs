//! Deferred completions: single-threaded promise-like handles.
//!
//! The engine runs cooperatively on one thread, so a not-yet-settled result
//! is represented by an explicit handle pair instead of a future needing an
//! executor: the consumer holds a [`Deferred`] and whoever produces the
//! value holds the matching [`Resolver`]. Settling runs the subscribed
//! callbacks synchronously, in subscription order.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::TreeError;

/// The settled result of a deferred completion.
pub type Outcome<T> = Result<T, TreeError>;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>)>;

enum Inner<T> {
    Pending(Vec<Callback<T>>),
    Settled(Outcome<T>),
}

/// A handle to a value that may not have been produced yet.
///
/// Cloning is cheap and every clone observes the same settlement. Use
/// [`Deferred::peek`] to poll, or [`Deferred::on_settle`] to subscribe a
/// one-shot callback (invoked immediately if already settled).
///
/// A `Deferred` whose [`Resolver`] is dropped without settling stays
/// pending forever; the engine rejects its own outstanding handles on
/// unmount so this only happens to handles the host forgot about.
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// Create a pending deferred and the resolver that settles it.
    pub fn new() -> (Deferred<T>, Resolver<T>) {
        let inner = Rc::new(RefCell::new(Inner::Pending(Vec::new())));
        (
            Deferred {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    /// Create a deferred that is already settled with `outcome`.
    pub fn settled(outcome: Outcome<T>) -> Deferred<T> {
        Deferred {
            inner: Rc::new(RefCell::new(Inner::Settled(outcome))),
        }
    }

    /// Create a deferred that is already resolved with `value`.
    pub fn ready(value: T) -> Deferred<T> {
        Deferred::settled(Ok(value))
    }

    /// Returns `true` once the deferred has settled.
    pub fn is_settled(&self) -> bool {
        matches!(*self.inner.borrow(), Inner::Settled(_))
    }

    /// Returns a clone of the outcome if settled, `None` while pending.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*self.inner.borrow() {
            Inner::Settled(outcome) => Some(outcome.clone()),
            Inner::Pending(_) => None,
        }
    }

    /// Subscribe a one-shot callback, invoked with the outcome when the
    /// deferred settles. If it is already settled the callback runs
    /// immediately.
    pub fn on_settle(&self, f: impl FnOnce(&Outcome<T>) + 'static) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            match &mut *inner {
                Inner::Pending(callbacks) => {
                    callbacks.push(Box::new(f));
                    return;
                }
                Inner::Settled(outcome) => outcome.clone(),
            }
        };
        // Run outside the borrow so the callback may inspect the deferred.
        f(&outcome);
    }
}

/// The producing half of a deferred completion.
///
/// Consuming it with [`Resolver::resolve`] or [`Resolver::reject`] settles
/// the paired [`Deferred`] and runs its subscribers.
pub struct Resolver<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Clone + 'static> Resolver<T> {
    /// Settle the deferred with a value.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Settle the deferred with an error.
    pub fn reject(self, error: TreeError) {
        self.settle(Err(error));
    }

    /// Settle the deferred with an explicit outcome.
    pub fn settle(self, outcome: Outcome<T>) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            match std::mem::replace(&mut *inner, Inner::Settled(outcome.clone())) {
                Inner::Pending(callbacks) => callbacks,
                Inner::Settled(previous) => {
                    // A resolver exists only while pending; restore and bail.
                    *inner = Inner::Settled(previous);
                    Vec::new()
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }
}
