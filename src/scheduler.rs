//! The cooperative scheduler continuations run on. Each thread owns one FIFO
//! task queue; a task enqueued now runs on a later turn, never inside the
//! caller's stack frame.
//!
use crate::Error;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::pin,
    task::{Context, Poll},
};

type Task = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static RUNNING: Cell<bool> = const { Cell::new(false) };
    static CONFIG: Cell<Config> = const { Cell::new(Config::new()) };
}

/// Per-thread scheduler settings, installed with [`configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Most tasks a single drive ([`run_until_stalled`] or [`block_on`]) may
    /// run. `None` is unlimited.
    pub task_budget: Option<usize>,
    /// Emit a `warn` event when a rejected deferred nobody subscribed to is
    /// dropped.
    pub warn_unhandled_rejections: bool,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            task_budget: None,
            warn_unhandled_rejections: true,
        }
    }

    #[must_use]
    pub const fn task_budget(mut self, budget: Option<usize>) -> Self {
        self.task_budget = budget;
        self
    }

    #[must_use]
    pub const fn warn_unhandled_rejections(mut self, warn: bool) -> Self {
        self.warn_unhandled_rejections = warn;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// Replaces this thread's scheduler settings.
pub fn configure(config: Config) {
    CONFIG.with(|c| c.set(config));
}

/// This thread's scheduler settings.
pub fn config() -> Config {
    // The default stands in while thread-locals are being torn down.
    CONFIG.try_with(Cell::get).unwrap_or_default()
}

/// Queues `task` to run on a later turn.
pub(crate) fn defer(task: impl FnOnce() + 'static) {
    QUEUE.with(|queue| queue.borrow_mut().push_back(Box::new(task)));
}

/// Number of tasks waiting for a turn.
pub fn pending_tasks() -> usize {
    QUEUE.with(|queue| queue.borrow().len())
}

fn next_task() -> Option<Task> {
    QUEUE.with(|queue| queue.borrow_mut().pop_front())
}

/// Marks the thread as driving the queue for as long as it lives.
struct Running;

impl Running {
    fn enter() -> Result<Self, Error> {
        if RUNNING.with(|running| running.replace(true)) {
            return Err(Error::Reentrant);
        }
        Ok(Running)
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(false));
    }
}

/// Counts tasks against the configured budget.
struct Budget {
    limit: Option<usize>,
    ran: usize,
}

impl Budget {
    fn new() -> Self {
        Budget {
            limit: config().task_budget,
            ran: 0,
        }
    }

    fn charge(&mut self) -> Result<(), Error> {
        match self.limit {
            Some(budget) if self.ran >= budget => Err(Error::BudgetExhausted {
                budget,
                remaining: pending_tasks(),
            }),
            _ => {
                self.ran += 1;
                Ok(())
            }
        }
    }
}

/// Runs queued tasks, including the ones they queue, until none are left.
/// Returns how many ran.
///
/// Unlike `futures::executor::LocalPool::run_until_stalled` this drives a
/// plain FIFO of continuation tasks, which keeps per-deferred dispatch order
/// deterministic, and reports the count, budget and re-entrancy errors.
///
/// # Examples
///
/// ```
/// use deferred::{scheduler, Deferred, Resolution};
///
/// let d = Deferred::<u8, ()>::resolved(1).and_then(|v| Ok(Resolution::Value(v + 1)));
/// assert!(scheduler::pending_tasks() > 0);
/// scheduler::run_until_stalled().unwrap();
/// assert_eq!(scheduler::pending_tasks(), 0);
/// # drop(d);
/// ```
pub fn run_until_stalled() -> Result<usize, Error> {
    let _running = Running::enter()?;
    let mut budget = Budget::new();
    while pending_tasks() > 0 {
        budget.charge()?;
        if let Some(task) = next_task() {
            task();
        }
    }
    tracing::debug!(ran = budget.ran, "task queue drained");
    Ok(budget.ran)
}

/// Drives the task queue until `future` completes.
///
/// Between polls exactly one task runs. When the queue runs dry while the
/// future is still pending nothing on this thread can wake it any more, so
/// this gives up with [`Error::Stalled`].
pub fn block_on<F: Future>(future: F) -> Result<F::Output, Error> {
    let _running = Running::enter()?;
    let mut future = pin!(future);
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    let mut budget = Budget::new();
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            tracing::trace!(ran = budget.ran, "future completed");
            return Ok(output);
        }
        if pending_tasks() == 0 {
            tracing::debug!(ran = budget.ran, "task queue stalled");
            return Err(Error::Stalled);
        }
        budget.charge()?;
        if let Some(task) = next_task() {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            defer(move || order.borrow_mut().push(i));
        }
        assert!(order.borrow().is_empty());
        assert_eq!(run_until_stalled(), Ok(3));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_nested_tasks_run_after_queued_ones() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let inner = order.clone();
        defer(move || {
            inner.borrow_mut().push("outer");
            let nested = inner.clone();
            defer(move || nested.borrow_mut().push("nested"));
        });
        let second = order.clone();
        defer(move || second.borrow_mut().push("second"));
        assert_eq!(run_until_stalled(), Ok(3));
        assert_eq!(*order.borrow(), vec!["outer", "second", "nested"]);
    }

    #[test]
    fn test_reentrant_drive_is_refused() {
        let seen = Rc::new(Cell::new(None));
        let slot = seen.clone();
        defer(move || slot.set(Some(run_until_stalled())));
        assert_eq!(run_until_stalled(), Ok(1));
        assert_eq!(seen.get(), Some(Err(Error::Reentrant)));
    }

    #[test]
    fn test_budget_exhausted() {
        configure(Config::new().task_budget(Some(2)));
        for _ in 0..5 {
            defer(|| {});
        }
        assert_eq!(
            run_until_stalled(),
            Err(Error::BudgetExhausted {
                budget: 2,
                remaining: 3
            })
        );
        configure(Config::default());
        assert_eq!(run_until_stalled(), Ok(3));
    }

    #[test]
    fn test_block_on_stalls_on_never_ready() {
        assert_eq!(block_on(std::future::pending::<()>()), Err(Error::Stalled));
    }

    #[test]
    fn test_block_on_ready() {
        assert_eq!(block_on(async { 7 }), Ok(7));
    }
}
