//! `all` and `any`: one deferred value aggregated from many.
//!
use std::{cell::RefCell, rc::Rc};

use tracing::trace;

use crate::{Deferred, Rejection, Resolution, Scheduler};

/// Per-input outcomes collected at their input index.
struct Gather<V> {
    slots: Vec<Option<V>>,
    settled: usize,
    sealed: bool,
}

impl<V> Gather<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            settled: 0,
            sealed: false,
        }
    }

    fn push_slot(&mut self) -> usize {
        self.slots.push(None);
        self.slots.len() - 1
    }

    fn record(&mut self, index: usize, outcome: V) -> Option<Vec<V>> {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(outcome);
            self.settled += 1;
        }
        self.complete()
    }

    /// Marks enumeration as finished; the input count is final from here on.
    fn seal(&mut self) -> Option<Vec<V>> {
        self.sealed = true;
        self.complete()
    }

    fn complete(&mut self) -> Option<Vec<V>> {
        if self.sealed && self.settled == self.slots.len() {
            // Taking the slots leaves nothing behind to complete twice.
            self.sealed = false;
            return Some(std::mem::take(&mut self.slots).into_iter().flatten().collect());
        }
        None
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Fulfills with every input's value, in input order, once all inputs
    /// have fulfilled. Rejects with the first rejection observed.
    ///
    /// An empty input fulfills with an empty `Vec`. The input is enumerated
    /// once, before this returns, so it must end.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_value::{Deferred, MicrotaskQueue, Resolution, State};
    ///
    /// let queue = MicrotaskQueue::new();
    /// let (resolver, later) = Deferred::<i32, String>::with_resolvers(&queue);
    /// let inputs = vec![Resolution::Value(2), later.into(), Resolution::Value(4)];
    /// let all = Deferred::<i32, String>::all(&queue, inputs);
    /// resolver.fulfill(3);
    /// queue.run_until_idle();
    /// assert_eq!(all.state(), State::Fulfilled(vec![2, 3, 4]));
    /// ```
    pub fn all<S, I>(scheduler: &S, inputs: I) -> Deferred<Vec<T>, E>
    where
        S: Scheduler + Clone + 'static,
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let scheduler: Rc<dyn Scheduler> = Rc::new(scheduler.clone());
        let aggregate = Deferred::pending_in(Rc::clone(&scheduler));
        let gather = Rc::new(RefCell::new(Gather::new()));

        for input in inputs {
            let index = gather.borrow_mut().push_slot();
            let source = Deferred::resolve_in(Rc::clone(&scheduler), input);
            let on_fulfilled = {
                let (aggregate, gather) = (aggregate.clone(), Rc::clone(&gather));
                move |value: T| {
                    let values = gather.borrow_mut().record(index, value);
                    if let Some(values) = values {
                        aggregate.settle_fulfilled(values);
                    }
                }
            };
            let aggregate = aggregate.clone();
            source.subscribe(on_fulfilled, move |reason| {
                trace!(index, "all: input rejected");
                aggregate.settle_rejected(reason);
            });
        }

        let values = gather.borrow_mut().seal();
        if let Some(values) = values {
            aggregate.settle_fulfilled(values);
        }
        aggregate
    }

    /// Fulfills with the first fulfillment observed, in arrival order. Once
    /// every input has rejected, rejects with [`Rejection::Aggregate`] holding
    /// the reasons in input order.
    ///
    /// An empty input rejects with an empty aggregate.
    pub fn any<S, I>(scheduler: &S, inputs: I) -> Deferred<T, E>
    where
        S: Scheduler + Clone + 'static,
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let scheduler: Rc<dyn Scheduler> = Rc::new(scheduler.clone());
        let aggregate = Deferred::pending_in(Rc::clone(&scheduler));
        let gather = Rc::new(RefCell::new(Gather::new()));

        for input in inputs {
            let index = gather.borrow_mut().push_slot();
            let source = Deferred::resolve_in(Rc::clone(&scheduler), input);
            let on_rejected = {
                let (aggregate, gather) = (aggregate.clone(), Rc::clone(&gather));
                move |reason: Rejection<E>| {
                    let reasons = gather.borrow_mut().record(index, reason);
                    if let Some(reasons) = reasons {
                        aggregate.settle_rejected(Rejection::Aggregate(reasons));
                    }
                }
            };
            let aggregate = aggregate.clone();
            source.subscribe(move |value| aggregate.settle_fulfilled(value), on_rejected);
        }

        let reasons = gather.borrow_mut().seal();
        if let Some(reasons) = reasons {
            aggregate.settle_rejected(Rejection::Aggregate(reasons));
        }
        aggregate
    }
}
