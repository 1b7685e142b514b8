//! Deferral of continuation tasks until the current call stack unwinds.
//!
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

use tracing::trace;

/// A zero-argument unit of work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce()>;

/// Runs tasks after the current synchronous execution completes, in the order
/// they were scheduled.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn schedule(&self, task: Task) {
        (**self).schedule(task)
    }
}

/// A FIFO task queue drained explicitly by its owner.
///
/// Clones share the same queue, so a test can hand one clone to every
/// [`Deferred`](crate::Deferred) and keep another to drive execution.
///
/// # Examples
///
/// ```
/// use deferred_value::{MicrotaskQueue, Scheduler};
/// use std::{cell::RefCell, rc::Rc};
///
/// let queue = MicrotaskQueue::new();
/// let log = Rc::new(RefCell::new(Vec::new()));
/// for n in 0..3 {
///     let log = log.clone();
///     queue.schedule(Box::new(move || log.borrow_mut().push(n)));
/// }
/// assert_eq!(queue.run_until_idle(), 3);
/// assert_eq!(*log.borrow(), vec![0, 1, 2]);
/// ```
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Runs the oldest queued task. Returns `false` if the queue was empty.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs, tasks schedule more tasks.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks, including the ones scheduled while draining, until none
    /// are left. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        trace!(ran, "microtask queue drained");
        ran
    }
}

impl Scheduler for MicrotaskQueue {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("queued", &self.len())
            .finish()
    }
}
