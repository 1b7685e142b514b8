//! The resolution procedure: turning a settlement candidate into a settled
//! deferred value, unwrapping deferred values and foreign thenables on the way.
//!
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::{Deferred, Rejection};

/// Anything a deferred value can be resolved with.
pub enum Resolution<T, E> {
    /// A plain value, fulfilled as-is.
    Value(T),
    /// A deferred value of this crate, whose state is adopted.
    Deferred(Deferred<T, E>),
    /// A foreign value that may expose a `then` capability.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Box::new(thenable))
    }
}

impl<T, E> From<T> for Resolution<T, E> {
    fn from(value: T) -> Self {
        Resolution::Value(value)
    }
}

impl<T, E> From<Deferred<T, E>> for Resolution<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Resolution::Deferred(deferred)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Deferred(deferred) => f.debug_tuple("Deferred").field(deferred).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// The `then` member of a thenable. It receives a [`ThenResolver`] bound to
/// the deferred value being resolved.
pub type ThenFn<T, E> = Box<dyn FnOnce(ThenResolver<T, E>) -> Result<(), Rejection<E>>>;

/// Result of probing a thenable for its `then` member.
pub enum Capability<T, E> {
    Callable(ThenFn<T, E>),
    /// Object-shaped but without a callable `then`; fulfilled with this value.
    NotCallable(T),
}

/// A value that may take part in the resolution procedure like a deferred
/// value, typically one produced by another implementation of the contract.
///
/// Closures of the right shape are thenables.
pub trait Thenable<T, E> {
    /// Looks up the `then` member. Called once per resolution; an `Err`
    /// rejects the deferred value being resolved with that reason.
    fn probe(self: Box<Self>) -> Result<Capability<T, E>, Rejection<E>>;
}

impl<T, E, F> Thenable<T, E> for F
where
    F: FnOnce(ThenResolver<T, E>) -> Result<(), Rejection<E>> + 'static,
{
    fn probe(self: Box<Self>) -> Result<Capability<T, E>, Rejection<E>> {
        Ok(Capability::Callable(self))
    }
}

struct CallGuard<T, E> {
    called: Cell<bool>,
    in_call: Cell<bool>,
    next: RefCell<Option<Resolution<T, E>>>,
}

/// The pair of callbacks handed to a thenable's `then`. Only the first call
/// to `resolve` or `reject`, across all clones, has an effect.
pub struct ThenResolver<T, E> {
    target: Deferred<T, E>,
    guard: Rc<CallGuard<T, E>>,
}

impl<T, E> Clone for ThenResolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            guard: Rc::clone(&self.guard),
        }
    }
}

impl<T, E> ThenResolver<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if self.guard.called.replace(true) {
            trace!("thenable already settled, ignoring resolve");
            return;
        }
        let value = value.into();
        if self.guard.in_call.get() {
            // Picked up by the loop in resolve_with once `then` returns.
            *self.guard.next.borrow_mut() = Some(value);
        } else {
            resolve_with(&self.target, value);
        }
    }

    pub fn reject(&self, reason: impl Into<Rejection<E>>) {
        if self.guard.called.replace(true) {
            trace!("thenable already settled, ignoring reject");
            return;
        }
        self.target.settle_rejected(reason.into());
    }
}

/// Settles `target` from `candidate`.
///
/// Thenables that answer synchronously are followed iteratively, so the stack
/// does not grow with the length of the chain.
pub(crate) fn resolve_with<T, E>(target: &Deferred<T, E>, candidate: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    let mut candidate = candidate;
    let mut depth = 0usize;
    loop {
        let then = match candidate {
            Resolution::Value(value) => {
                target.settle_fulfilled(value);
                return;
            }
            Resolution::Deferred(deferred) => {
                if deferred.leads_to(target) {
                    debug!(depth, "adoption cycle detected");
                    target.settle_rejected(Rejection::Cycle);
                    return;
                }
                target.follow(&deferred);
                let (fulfilled, rejected) = (target.clone(), target.clone());
                deferred.subscribe(
                    move |value| fulfilled.settle_fulfilled(value),
                    move |reason| rejected.settle_rejected(reason),
                );
                return;
            }
            Resolution::Thenable(thenable) => match thenable.probe() {
                Err(reason) => {
                    debug!(depth, "probing thenable failed");
                    target.settle_rejected(reason);
                    return;
                }
                Ok(Capability::NotCallable(value)) => {
                    target.settle_fulfilled(value);
                    return;
                }
                Ok(Capability::Callable(then)) => then,
            },
        };

        let guard = Rc::new(CallGuard {
            called: Cell::new(false),
            in_call: Cell::new(true),
            next: RefCell::new(None),
        });
        let outcome = then(ThenResolver {
            target: target.clone(),
            guard: Rc::clone(&guard),
        });
        guard.in_call.set(false);
        if let Err(reason) = outcome {
            if !guard.called.replace(true) {
                target.settle_rejected(reason);
                return;
            }
            trace!("thenable raised after settling, ignoring");
        }
        // `next` is only filled while `then` runs.
        let next = guard.next.borrow_mut().take();
        match next {
            Some(next) => {
                depth += 1;
                candidate = next;
            }
            None => return,
        }
    }
}
