//! The capabilities that settle a deferred, and the dispatch pass that hands
//! its outcome to queued continuations.
//!
use crate::deferred::{Inner, State};
use crate::{scheduler, Resolution};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

type Shared<T, E> = Rc<RefCell<Inner<T, E>>>;

/// Settles a deferred as fulfilled, or makes it adopt a thenable.
///
/// Shares an "already resolved" flag with its [`Reject`] twin: whichever of
/// the pair is used first wins and the rest are ignored.
pub struct Resolve<T, E> {
    inner: Shared<T, E>,
    resolved: Rc<Cell<bool>>,
}

/// Settles a deferred as rejected. See [`Resolve`].
pub struct Reject<T, E> {
    inner: Shared<T, E>,
    resolved: Rc<Cell<bool>>,
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolve<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolve")
            .field("deferred", &self.inner.borrow().id)
            .field("used", &self.resolved.get())
            .finish()
    }
}

impl<T, E> fmt::Debug for Reject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reject")
            .field("deferred", &self.inner.borrow().id)
            .field("used", &self.resolved.get())
            .finish()
    }
}

/// A fresh pair bound to `inner`.
pub(crate) fn capabilities<T, E>(inner: &Shared<T, E>) -> (Resolve<T, E>, Reject<T, E>) {
    let resolved = Rc::new(Cell::new(false));
    (
        Resolve {
            inner: inner.clone(),
            resolved: resolved.clone(),
        },
        Reject {
            inner: inner.clone(),
            resolved,
        },
    )
}

impl<T: Clone + 'static, E: Clone + 'static> Resolve<T, E> {
    /// Fulfills the deferred with a value, or adopts the outcome of a
    /// thenable.
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if self.resolved.replace(true) {
            tracing::trace!(deferred = %self.inner.borrow().id, "resolve ignored, already resolved");
            return;
        }
        fulfill(&self.inner, value.into());
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Reject<T, E> {
    /// Rejects the deferred with `reason`. Never adopts.
    pub fn reject(&self, reason: E) {
        if self.resolved.replace(true) {
            tracing::trace!(deferred = %self.inner.borrow().id, "reject ignored, already resolved");
            return;
        }
        settle(&self.inner, State::Rejected(reason));
    }
}

fn fulfill<T: Clone + 'static, E: Clone + 'static>(inner: &Shared<T, E>, resolution: Resolution<T, E>) {
    if !inner.borrow().state.is_pending() {
        return;
    }
    match resolution {
        Resolution::Value(value) => settle(inner, State::Fulfilled(value)),
        Resolution::Thenable(thenable) => {
            tracing::trace!(deferred = %inner.borrow().id, "adopting thenable");
            let (resolve, reject) = capabilities(inner);
            if let Err(reason) = thenable.subscribe(resolve, reject.clone()) {
                reject.reject(reason);
            }
        }
    }
}

fn settle<T: Clone + 'static, E: Clone + 'static>(inner: &Shared<T, E>, outcome: State<T, E>) {
    {
        let mut inner = inner.borrow_mut();
        if !inner.state.is_pending() {
            return;
        }
        inner.state = outcome;
        tracing::trace!(deferred = %inner.id, state = inner.state.label(), "settled");
    }
    dispatch(inner);
}

/// Schedules a pass over the queued continuations once settled. Nothing
/// queued means nothing to schedule; the next registration dispatches again.
pub(crate) fn dispatch<T: Clone + 'static, E: Clone + 'static>(inner: &Shared<T, E>) {
    {
        let inner = inner.borrow();
        if inner.state.is_pending() || inner.reactions.is_empty() {
            return;
        }
    }
    let inner = inner.clone();
    scheduler::defer(move || drain(&inner));
}

/// Runs whatever is queued at the time the task gets its turn, in
/// registration order. Continuations queued meanwhile get their own pass.
fn drain<T: Clone, E: Clone>(inner: &Shared<T, E>) {
    let (outcome, reactions) = {
        let mut inner = inner.borrow_mut();
        if inner.reactions.is_empty() {
            return;
        }
        let outcome = match &inner.state {
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(reason) => Err(reason.clone()),
            State::Pending => return,
        };
        tracing::trace!(deferred = %inner.id, reactions = inner.reactions.len(), "dispatching");
        (outcome, std::mem::take(&mut inner.reactions))
    };
    for reaction in reactions {
        match &outcome {
            Ok(value) => (reaction.on_fulfilled)(value.clone()),
            Err(reason) => (reaction.on_rejected)(reason.clone()),
        }
    }
}
