//! Single-assignment deferred values following the Promise/A+ contract.
//!
//! A [`Deferred`] starts pending and settles exactly once, either fulfilled with
//! a value or rejected with a [`Rejection`]. Continuations attached with
//! [`Deferred::then`] never run synchronously; they are handed to the
//! [`Scheduler`] the deferred value was created with.
//!
//! # Examples
//!
//! ```
//! use deferred_value::{Deferred, MicrotaskQueue, Resolution, State};
//!
//! let queue = MicrotaskQueue::new();
//! let (resolver, deferred) = Deferred::<i32, String>::with_resolvers(&queue);
//! let doubled = deferred.and_then(|value| Ok(Resolution::Value(value * 2)));
//!
//! resolver.fulfill(21);
//! queue.run_until_idle();
//! assert_eq!(doubled.state(), State::Fulfilled(42));
//! ```
mod combinators;
mod deferred;
mod resolution;
mod scheduler;

pub use deferred::{Deferred, Resolver, State};
pub use resolution::{Capability, Resolution, ThenFn, ThenResolver, Thenable};
pub use scheduler::{MicrotaskQueue, Scheduler, Task};

use thiserror::Error;

/// Why a deferred value was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection<E> {
    /// A reason raised by user code: an executor, a continuation or a thenable.
    #[error("{0}")]
    Raised(E),
    /// The deferred value was resolved with itself, directly or through a
    /// chain of adoptions.
    #[error("chaining cycle detected for deferred value")]
    Cycle,
    /// Every input of [`Deferred::any`] was rejected, reasons in input order.
    #[error("all {} inputs were rejected", .0.len())]
    Aggregate(Vec<Rejection<E>>),
}

impl<E> Rejection<E> {
    /// The user-level reason, if this rejection carries one.
    pub fn raised(&self) -> Option<&E> {
        match self {
            Rejection::Raised(reason) => Some(reason),
            _ => None,
        }
    }
}

impl<E> From<E> for Rejection<E> {
    fn from(reason: E) -> Self {
        Rejection::Raised(reason)
    }
}
