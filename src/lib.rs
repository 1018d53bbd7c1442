//! Promise/A+ style deferred values for a single-threaded cooperative
//! scheduler.
//!
//! A [`Deferred`] is created with an initializer that receives a [`Resolve`]
//! and a [`Reject`] capability. Continuations registered with
//! [`Deferred::then`] never run in the caller's stack frame; they are queued on
//! the thread's [`scheduler`] and run on a later turn.
//!
//! # Examples
//!
//! ```
//! use deferred::{scheduler, Deferred, Resolution};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = seen.clone();
//! Deferred::<i32, String>::resolved(5)
//!     .and_then(|v| Ok(Resolution::Value(v * 2)))
//!     .and_then(move |v| {
//!         log.borrow_mut().push(v);
//!         Ok(Resolution::Value(()))
//!     });
//! // nothing runs until the scheduler gets a turn
//! assert!(seen.borrow().is_empty());
//! scheduler::run_until_stalled().unwrap();
//! assert_eq!(*seen.borrow(), vec![10]);
//! ```
use thiserror::Error;

pub mod deferred;
pub mod scheduler;
pub mod settle;
pub mod settled;

pub use crate::deferred::{Deferred, DeferredId, Handler};
pub use crate::settle::{Reject, Resolve};
pub use crate::settled::Settled;

/// Failures of the machinery that drives deferred values. Rejection reasons
/// never show up here; they travel on the rejected path as the caller's `E`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("the task queue ran dry before the awaited value settled")]
    Stalled,
    #[error("the scheduler is already running on this thread")]
    Reentrant,
    #[error("task budget of {budget} exhausted with {remaining} tasks still queued")]
    BudgetExhausted { budget: usize, remaining: usize },
    #[error("deferred dropped before it settled")]
    Abandoned,
}

/// Anything that can settle a [`Deferred`] later on.
///
/// Resolving a deferred with a thenable adopts its eventual outcome instead of
/// using it as a literal value. [`Deferred`] implements this, but so can any
/// foreign async value.
///
/// # Examples
///
/// ```
/// use deferred::{scheduler, Deferred, Reject, Resolution, Resolve, Thenable};
///
/// struct Ready(i32);
///
/// impl Thenable<i32, String> for Ready {
///     fn subscribe(self: Box<Self>, resolve: Resolve<i32, String>, _: Reject<i32, String>) -> Result<(), String> {
///         resolve.resolve(self.0);
///         Ok(())
///     }
/// }
///
/// let d = Deferred::<i32, String>::resolved(Resolution::adopt(Ready(10)));
/// assert_eq!(d.wait().unwrap(), Ok(10));
/// # scheduler::run_until_stalled().unwrap();
/// ```
pub trait Thenable<T, E> {
    /// Hands over the capabilities that settle the adopting deferred. An `Err`
    /// rejects it unless one of the capabilities was already used.
    fn subscribe(self: Box<Self>, resolve: Resolve<T, E>, reject: Reject<T, E>) -> Result<(), E>;
}

/// What a deferred is resolved with: a literal value, or a thenable whose
/// outcome it adopts.
pub enum Resolution<T, E> {
    Value(T),
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn adopt(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Box::new(thenable))
    }
}

impl<T, E> From<T> for Resolution<T, E> {
    fn from(value: T) -> Self {
        Resolution::Value(value)
    }
}

impl<T: std::fmt::Debug, E> std::fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}
