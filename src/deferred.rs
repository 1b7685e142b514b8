use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};
use std::{future::Future, pin::Pin, task::{Context, Poll, Waker}};

use tracing::{debug, trace};

use crate::resolution::{resolve_with, Resolution};
use crate::{Rejection, Scheduler};

/// Settlement status of a [`Deferred`]. Payloads only exist in the terminal
/// variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection<E>),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

type FulfillCallback<T> = Box<dyn FnOnce(T)>;
type RejectCallback<E> = Box<dyn FnOnce(Rejection<E>)>;

struct Inner<T, E> {
    state: State<T, E>,
    fulfill_callbacks: Vec<FulfillCallback<T>>,
    reject_callbacks: Vec<RejectCallback<E>>,
    wakers: Vec<Waker>,
    /// The pending deferred value this one adopted, if any.
    following: Option<Weak<RefCell<Inner<T, E>>>>,
}

/// A single-assignment container for the eventual result of an operation.
///
/// `Deferred` is a handle: clones refer to the same value.
///
/// # Examples
///
/// ```
/// use deferred_value::{Deferred, MicrotaskQueue, Rejection, Resolution, State};
///
/// let queue = MicrotaskQueue::new();
/// let deferred = Deferred::<i32, &str>::new(&queue, |resolver| {
///     resolver.fulfill(1);
///     Ok(())
/// });
/// let failed = deferred.and_then(|_| Err::<Resolution<i32, &str>, _>("nope".into()));
/// let recovered = failed.catch(|reason| match reason {
///     Rejection::Raised(_) => Ok(Resolution::Value(-1)),
///     other => Err(other),
/// });
///
/// queue.run_until_idle();
/// assert_eq!(failed.state(), State::Rejected(Rejection::Raised("nope")));
/// assert_eq!(recovered.state(), State::Fulfilled(-1));
/// ```
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: Rc<dyn Scheduler>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            scheduler: Rc::clone(&self.scheduler),
        }
    }
}

impl<T: Debug, E: Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Deferred");
        match self.inner.try_borrow() {
            Ok(inner) => s.field("state", &inner.state),
            Err(_) => s.field("state", &"<settling>"),
        };
        s.finish()
    }
}

/// The settle capabilities of a [`Deferred`], handed to its executor or
/// returned by [`Deferred::with_resolvers`].
///
/// The first call to any of `fulfill`, `reject` or `resolve` wins, later calls
/// on this resolver or its clones are ignored.
pub struct Resolver<T, E> {
    target: Deferred<T, E>,
    locked: Rc<Cell<bool>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            locked: Rc::clone(&self.locked),
        }
    }
}

impl<T, E> Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("locked", &self.locked.get())
            .finish()
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Fulfills with `value` as-is. Unlike [`Resolver::resolve`], nothing is
    /// unwrapped.
    pub fn fulfill(&self, value: T) {
        if self.lock() {
            self.target.settle_fulfilled(value);
        }
    }

    /// Rejects with `reason`.
    pub fn reject(&self, reason: impl Into<Rejection<E>>) {
        if self.lock() {
            self.target.settle_rejected(reason.into());
        }
    }

    /// Settles through the resolution procedure, adopting the state of a
    /// deferred value or thenable.
    pub fn resolve(&self, candidate: impl Into<Resolution<T, E>>) {
        if self.lock() {
            resolve_with(&self.target, candidate.into());
        }
    }

    fn lock(&self) -> bool {
        let first = !self.locked.replace(true);
        if !first {
            trace!("resolver already used, ignoring");
        }
        first
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub(crate) fn pending_in(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                fulfill_callbacks: Vec::new(),
                reject_callbacks: Vec::new(),
                wakers: Vec::new(),
                following: None,
            })),
            scheduler,
        }
    }

    /// Creates a deferred value and runs `executor` synchronously with its
    /// resolver. An `Err` returned by the executor rejects the value unless
    /// the resolver was already used.
    pub fn new<S, F>(scheduler: &S, executor: F) -> Self
    where
        S: Scheduler + Clone + 'static,
        F: FnOnce(Resolver<T, E>) -> Result<(), Rejection<E>>,
    {
        let (resolver, deferred) = Self::with_resolvers(scheduler);
        if let Err(reason) = executor(resolver.clone()) {
            debug!("executor failed synchronously");
            resolver.reject(reason);
        }
        deferred
    }

    /// Creates a pending deferred value together with its resolver.
    pub fn with_resolvers<S>(scheduler: &S) -> (Resolver<T, E>, Self)
    where
        S: Scheduler + Clone + 'static,
    {
        let deferred = Self::pending_in(Rc::new(scheduler.clone()));
        let resolver = Resolver {
            target: deferred.clone(),
            locked: Rc::new(Cell::new(false)),
        };
        (resolver, deferred)
    }

    /// Returns `value` itself when it already is a deferred value, otherwise a
    /// new one settled through the resolution procedure.
    pub fn resolve<S>(scheduler: &S, value: impl Into<Resolution<T, E>>) -> Self
    where
        S: Scheduler + Clone + 'static,
    {
        Self::resolve_in(Rc::new(scheduler.clone()), value.into())
    }

    pub(crate) fn resolve_in(scheduler: Rc<dyn Scheduler>, value: Resolution<T, E>) -> Self {
        match value {
            Resolution::Deferred(deferred) => deferred,
            candidate => {
                let deferred = Self::pending_in(scheduler);
                resolve_with(&deferred, candidate);
                deferred
            }
        }
    }

    /// Returns a deferred value already rejected with `reason`.
    pub fn reject<S>(scheduler: &S, reason: impl Into<Rejection<E>>) -> Self
    where
        S: Scheduler + Clone + 'static,
    {
        let deferred = Self::pending_in(Rc::new(scheduler.clone()));
        deferred.settle_rejected(reason.into());
        deferred
    }

    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    /// Whether both handles refer to the same deferred value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn scheduler(&self) -> Rc<dyn Scheduler> {
        Rc::clone(&self.scheduler)
    }

    /// Whether `self` is `target`, or is pending on a chain of adoptions
    /// that ends at `target`.
    pub(crate) fn leads_to(&self, target: &Self) -> bool {
        let mut current = Rc::clone(&self.inner);
        loop {
            if Rc::ptr_eq(&current, &target.inner) {
                return true;
            }
            let next = current.borrow().following.as_ref().and_then(Weak::upgrade);
            match next {
                Some(next) => current = next,
                None => return false,
            }
        }
    }

    /// Records that `self` now waits on `source`. Links are only kept while
    /// both sides are pending.
    pub(crate) fn follow(&self, source: &Self) {
        if source.is_pending() {
            self.inner.borrow_mut().following = Some(Rc::downgrade(&source.inner));
        }
    }

    pub(crate) fn settle_fulfilled(&self, value: T) {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() {
                trace!("ignoring fulfillment of a settled deferred value");
                return;
            }
            inner.state = State::Fulfilled(value.clone());
            inner.reject_callbacks.clear();
            inner.following = None;
            (
                std::mem::take(&mut inner.fulfill_callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };
        trace!(callbacks = callbacks.len(), "deferred value fulfilled");
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(value.clone());
        }
    }

    pub(crate) fn settle_rejected(&self, reason: Rejection<E>) {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() {
                trace!("ignoring rejection of a settled deferred value");
                return;
            }
            inner.state = State::Rejected(reason.clone());
            inner.fulfill_callbacks.clear();
            inner.following = None;
            (
                std::mem::take(&mut inner.reject_callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };
        trace!(callbacks = callbacks.len(), "deferred value rejected");
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(reason.clone());
        }
    }

    /// Registers a pair of reactions. Whichever fires is always run from a
    /// scheduled task, never from inside this call.
    pub(crate) fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(Rejection<E>) + 'static,
    {
        let state = self.state();
        match state {
            State::Pending => {
                let mut inner = self.inner.borrow_mut();
                let scheduler = Rc::clone(&self.scheduler);
                inner.fulfill_callbacks.push(Box::new(move |value| {
                    scheduler.schedule(Box::new(move || on_fulfilled(value)))
                }));
                let scheduler = Rc::clone(&self.scheduler);
                inner.reject_callbacks.push(Box::new(move |reason| {
                    scheduler.schedule(Box::new(move || on_rejected(reason)))
                }));
            }
            State::Fulfilled(value) => self.scheduler.schedule(Box::new(move || on_fulfilled(value))),
            State::Rejected(reason) => self.scheduler.schedule(Box::new(move || on_rejected(reason))),
        }
    }

    /// Derives a deferred value from this one's outcome. The continuation's
    /// result goes through the resolution procedure; an `Err` rejects.
    pub(crate) fn then_outcome<U, C>(&self, continuation: C) -> Deferred<U, E>
    where
        U: Clone + 'static,
        C: FnOnce(Result<T, Rejection<E>>) -> Result<Resolution<U, E>, Rejection<E>> + 'static,
    {
        let child = Deferred::pending_in(self.scheduler());
        let slot = Rc::new(Cell::new(Some(continuation)));
        let on_fulfilled = {
            let (child, slot) = (child.clone(), Rc::clone(&slot));
            move |value: T| run_continuation(&child, &slot, Ok(value))
        };
        let on_rejected = {
            let child = child.clone();
            move |reason: Rejection<E>| run_continuation(&child, &slot, Err(reason))
        };
        self.subscribe(on_fulfilled, on_rejected);
        child
    }

    /// Attaches a continuation for each outcome and returns the derived value.
    ///
    /// Neither callback runs before the scheduler gets to it, even if this
    /// value is already settled.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, Rejection<E>> + 'static,
        R: FnOnce(Rejection<E>) -> Result<Resolution<U, E>, Rejection<E>> + 'static,
    {
        self.then_outcome(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        })
    }

    /// [`then`](Self::then) with the rejection passed through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, Rejection<E>> + 'static,
    {
        self.then(on_fulfilled, |reason| Err(reason))
    }

    /// [`then`](Self::then) with the value passed through unchanged.
    pub fn catch<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(Rejection<E>) -> Result<Resolution<T, E>, Rejection<E>> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Runs `on_finally` on either outcome without exposing the payload, then
    /// settles like this value. A rejection from `on_finally`, raised directly
    /// or through what it returns, takes precedence.
    pub fn finally<X, F>(&self, on_finally: F) -> Deferred<T, E>
    where
        X: Clone + 'static,
        F: FnOnce() -> Result<Resolution<X, E>, Rejection<E>> + 'static,
    {
        let scheduler = self.scheduler();
        self.then_outcome(move |outcome| {
            let cleanup = Deferred::resolve_in(scheduler, on_finally()?);
            let restored = cleanup.then_outcome(move |done| match done {
                Ok(_) => outcome.map(Resolution::Value),
                Err(reason) => Err(reason),
            });
            Ok(Resolution::Deferred(restored))
        })
    }
}

fn run_continuation<T, U, E, C>(
    child: &Deferred<U, E>,
    slot: &Cell<Option<C>>,
    outcome: Result<T, Rejection<E>>,
) where
    U: Clone + 'static,
    E: Clone + 'static,
    C: FnOnce(Result<T, Rejection<E>>) -> Result<Resolution<U, E>, Rejection<E>>,
{
    // Only one of the two reactions ever fires.
    if let Some(continuation) = slot.take() {
        match continuation(outcome) {
            Ok(candidate) => resolve_with(child, candidate),
            Err(reason) => child.settle_rejected(reason),
        }
    }
}

impl<T: Clone, E: Clone> Future for Deferred<T, E> {
    type Output = Result<T, Rejection<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Deferred, State};
    use crate::{MicrotaskQueue, Rejection, Resolution};
    use futures::executor::block_on;
    use std::{cell::{Cell, RefCell}, rc::Rc};

    type Value = Deferred<i32, &'static str>;

    #[test]
    fn test_first_settlement_wins() {
        let queue = MicrotaskQueue::new();
        let (resolver, deferred) = Value::with_resolvers(&queue);
        resolver.fulfill(1);
        resolver.fulfill(2);
        resolver.reject("late");
        assert_eq!(deferred.state(), State::Fulfilled(1));

        deferred.settle_rejected(Rejection::Raised("direct"));
        deferred.settle_fulfilled(3);
        assert_eq!(deferred.state(), State::Fulfilled(1));
    }

    #[test]
    fn test_executor_error_rejects() {
        let queue = MicrotaskQueue::new();
        let deferred = Value::new(&queue, |_| Err("bad executor".into()));
        assert_eq!(deferred.state(), State::Rejected(Rejection::Raised("bad executor")));
    }

    #[test]
    fn test_executor_error_after_fulfill_is_ignored() {
        let queue = MicrotaskQueue::new();
        let deferred = Value::new(&queue, |resolver| {
            resolver.fulfill(7);
            Err("too late".into())
        });
        assert_eq!(deferred.state(), State::Fulfilled(7));
    }

    #[test]
    fn test_then_is_never_synchronous() {
        let queue = MicrotaskQueue::new();
        let deferred = Value::resolve(&queue, 1);
        let marker = Rc::new(Cell::new(false));
        let seen = Rc::new(Cell::new(None));
        {
            let (marker, seen) = (marker.clone(), seen.clone());
            deferred.and_then(move |value| {
                seen.set(Some(marker.get()));
                Ok(Resolution::Value(value))
            });
        }
        marker.set(true);
        assert_eq!(seen.get(), None);
        queue.run_until_idle();
        assert_eq!(seen.get(), Some(true));
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let queue = MicrotaskQueue::new();
        let (resolver, deferred) = Value::with_resolvers(&queue);
        let log = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3 {
            let log = log.clone();
            deferred.and_then(move |value| {
                log.borrow_mut().push((n, value));
                Ok(Resolution::Value(value))
            });
        }
        queue.run_until_idle();
        assert!(log.borrow().is_empty());
        resolver.fulfill(9);
        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec![(0, 9), (1, 9), (2, 9)]);
    }

    #[test]
    fn test_rejection_passes_through_and_then() {
        let queue = MicrotaskQueue::new();
        let deferred = Value::reject(&queue, "nope");
        let mapped = deferred.and_then(|value| Ok(Resolution::Value(value + 1)));
        let recovered = mapped.catch(|reason| {
            assert_eq!(reason, Rejection::Raised("nope"));
            Ok(Resolution::Value(0))
        });
        queue.run_until_idle();
        assert_eq!(mapped.state(), State::Rejected(Rejection::Raised("nope")));
        assert_eq!(recovered.state(), State::Fulfilled(0));
    }

    #[test]
    fn test_continuation_error_rejects_child() {
        let queue = MicrotaskQueue::new();
        let child: Deferred<String, &str> = Value::resolve(&queue, 1)
            .then(|_| Err("thrown".into()), |reason| Err(reason));
        queue.run_until_idle();
        assert_eq!(child.state(), State::Rejected(Rejection::Raised("thrown")));
    }

    #[test]
    fn test_then_returning_itself_is_a_cycle() {
        let queue = MicrotaskQueue::new();
        let slot: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let child = {
            let slot = slot.clone();
            Value::resolve(&queue, 1).and_then(move |value| match slot.borrow().clone() {
                Some(me) => Ok(Resolution::Deferred(me)),
                None => Ok(Resolution::Value(value)),
            })
        };
        *slot.borrow_mut() = Some(child.clone());
        queue.run_until_idle();
        assert_eq!(child.state(), State::Rejected(Rejection::Cycle));
        slot.borrow_mut().take();
    }

    #[test]
    fn test_finally_passes_value_through() {
        let queue = MicrotaskQueue::new();
        let ran = Rc::new(Cell::new(false));
        let kept = {
            let ran = ran.clone();
            Value::resolve(&queue, 5).finally(move || {
                ran.set(true);
                Ok(Resolution::Value(()))
            })
        };
        queue.run_until_idle();
        assert!(ran.get());
        assert_eq!(kept.state(), State::Fulfilled(5));
    }

    #[test]
    fn test_finally_waits_for_pending_cleanup() {
        let queue = MicrotaskQueue::new();
        let (cleanup, cleanup_done) = Deferred::<&'static str, &'static str>::with_resolvers(&queue);
        let kept = Value::resolve(&queue, 5).finally(move || Ok(Resolution::Deferred(cleanup_done)));
        queue.run_until_idle();
        assert!(kept.is_pending());

        cleanup.fulfill("closed");
        queue.run_until_idle();
        assert_eq!(kept.state(), State::Fulfilled(5));
    }

    #[test]
    fn test_finally_keeps_original_reason() {
        let queue = MicrotaskQueue::new();
        let kept = Value::reject(&queue, "original").finally(|| Ok(Resolution::Value("ignored")));
        queue.run_until_idle();
        assert_eq!(kept.state(), State::Rejected(Rejection::Raised("original")));
    }

    #[test]
    fn test_finally_rejection_overrides() {
        let queue = MicrotaskQueue::new();
        let raised = Value::resolve(&queue, 5).finally(|| Err::<Resolution<(), _>, _>("cleanup".into()));
        let returned = {
            let queue2 = queue.clone();
            Value::reject(&queue, "original")
                .finally(move || Ok(Resolution::Deferred(Value::reject(&queue2, "replaced"))))
        };
        queue.run_until_idle();
        assert_eq!(raised.state(), State::Rejected(Rejection::Raised("cleanup")));
        assert_eq!(returned.state(), State::Rejected(Rejection::Raised("replaced")));
    }

    #[test]
    fn test_future_resolves_after_settlement() {
        let queue = MicrotaskQueue::new();
        let (resolver, deferred) = Value::with_resolvers(&queue);
        let doubled = deferred.and_then(|value| Ok(Resolution::Value(value * 2)));
        resolver.fulfill(4);
        queue.run_until_idle();
        assert_eq!(block_on(doubled), Ok(8));
        assert_eq!(block_on(Value::reject(&queue, "x")), Err(Rejection::Raised("x")));
    }
}
