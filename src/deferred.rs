use crate::settle::{self, Reject, Resolve};
use crate::{Resolution, Thenable};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A continuation. `Err` is how a handler throws.
pub type Handler<A, U, E> = Box<dyn FnOnce(A) -> Result<Resolution<U, E>, E>>;

/// Process-unique identity of a [`Deferred`], used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeferredId(u64);

impl DeferredId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeferredId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        }
    }
}

/// Both halves are always present; omitted handlers are filled in with a
/// pass-through or a rethrow before they get here.
pub(crate) struct Reaction<T, E> {
    pub(crate) on_fulfilled: Box<dyn FnOnce(T)>,
    pub(crate) on_rejected: Box<dyn FnOnce(E)>,
}

pub(crate) struct Inner<T, E> {
    pub(crate) id: DeferredId,
    pub(crate) state: State<T, E>,
    pub(crate) reactions: Vec<Reaction<T, E>>,
    /// Whether anything ever subscribed.
    pub(crate) observed: bool,
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if matches!(self.state, State::Rejected(_))
            && !self.observed
            && crate::scheduler::config().warn_unhandled_rejections
        {
            tracing::warn!(deferred = %self.id, "rejected deferred dropped without a rejection handler");
        }
    }
}

/// A value that is not available yet.
///
/// Cloning yields another handle to the same deferred. Settlement happens
/// once, through the [`Resolve`] and [`Reject`] capabilities handed to the
/// initializer, and is only observable through [`then`](Deferred::then) and
/// the operators built on it.
pub struct Deferred<T, E> {
    pub(crate) inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Deferred")
            .field("id", &inner.id)
            .field("state", &inner.state.label())
            .field("reactions", &inner.reactions.len())
            .finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// Creates a pending deferred and runs `initializer` right away with the
    /// capabilities that settle it. Returning `Err` rejects it.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::Deferred;
    ///
    /// let d = Deferred::<String, String>::new(|resolve, _reject| {
    ///     resolve.resolve(String::from("🍓"));
    ///     Ok(())
    /// });
    /// assert_eq!(d.wait().unwrap(), Ok(String::from("🍓")));
    ///
    /// let failed = Deferred::<String, String>::new(|_, _| Err("💥".into()));
    /// assert_eq!(failed.wait().unwrap(), Err(String::from("💥")));
    /// ```
    pub fn new<F>(initializer: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let deferred = Deferred {
            inner: Rc::new(RefCell::new(Inner {
                id: DeferredId::next(),
                state: State::Pending,
                reactions: Vec::new(),
                observed: false,
            })),
        };
        tracing::trace!(deferred = %deferred.id(), "created");
        let (resolve, reject) = settle::capabilities(&deferred.inner);
        if let Err(reason) = initializer(resolve, reject.clone()) {
            reject.reject(reason);
        }
        deferred
    }

    /// A deferred resolved with `value`, adopting it if it is a thenable.
    pub fn resolved(value: impl Into<Resolution<T, E>>) -> Self {
        let value = value.into();
        Self::new(move |resolve, _| {
            resolve.resolve(value);
            Ok(())
        })
    }

    pub fn rejected(reason: E) -> Self {
        Self::new(move |_, _| Err(reason))
    }

    pub fn id(&self) -> DeferredId {
        self.inner.borrow().id
    }

    /// Queues a continuation pair and tries to dispatch.
    pub(crate) fn subscribe_reaction(&self, reaction: Reaction<T, E>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.observed = true;
            inner.reactions.push(reaction);
        }
        settle::dispatch(&self.inner);
    }

    fn chain<U>(&self, on_fulfilled: Handler<T, U, E>, on_rejected: Handler<E, U, E>) -> Deferred<U, E>
    where
        U: Clone + 'static,
    {
        Deferred::<U, E>::new(|resolve, reject| {
            let (resolve_err, reject_err) = (resolve.clone(), reject.clone());
            self.subscribe_reaction(Reaction {
                on_fulfilled: Box::new(move |value| match on_fulfilled(value) {
                    Ok(resolution) => resolve.resolve(resolution),
                    Err(reason) => reject.reject(reason),
                }),
                on_rejected: Box::new(move |reason| match on_rejected(reason) {
                    Ok(resolution) => resolve_err.resolve(resolution),
                    Err(reason) => reject_err.reject(reason),
                }),
            });
            Ok(())
        })
    }

    /// Registers a continuation pair and returns the deferred that receives
    /// its result.
    ///
    /// A missing `on_fulfilled` passes the value through, a missing
    /// `on_rejected` passes the rejection through. A handler returning `Ok`
    /// fulfills the new deferred (adopting a thenable), returning `Err`
    /// rejects it, so an `on_rejected` that returns `Ok` recovers the chain.
    /// Handlers never run before the scheduler's next turn.
    ///
    /// The value pass-through needs `U: From<T>`; with both handlers at hand
    /// and an unrelated `U`, use [`then_with`](Deferred::then_with).
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Deferred, Resolution};
    ///
    /// let d = Deferred::<&str, &str>::rejected("e")
    ///     .then(None, Some(Box::new(|_| Ok(Resolution::Value("recovered")))));
    /// assert_eq!(d.wait().unwrap(), Ok("recovered"));
    /// ```
    pub fn then<U>(
        &self,
        on_fulfilled: Option<Handler<T, U, E>>,
        on_rejected: Option<Handler<E, U, E>>,
    ) -> Deferred<U, E>
    where
        U: From<T> + Clone + 'static,
    {
        let on_fulfilled: Handler<T, U, E> = match on_fulfilled {
            Some(handler) => handler,
            None => Box::new(|value| Ok(Resolution::Value(U::from(value)))),
        };
        let on_rejected: Handler<E, U, E> = match on_rejected {
            Some(handler) => handler,
            None => Box::new(|reason| Err(reason)),
        };
        self.chain(on_fulfilled, on_rejected)
    }

    /// [`then`](Deferred::then) with both handlers supplied, so the new
    /// deferred may carry any value type. Only the handler matching the
    /// settled state runs, and an `Err` from `on_fulfilled` rejects the
    /// returned deferred rather than reaching `on_rejected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Deferred, Resolution};
    ///
    /// let d = Deferred::<i32, String>::resolved(5).then_with(
    ///     |v| Ok(Resolution::Value(format!("v{}", v))),
    ///     |reason| Ok(Resolution::Value(reason)),
    /// );
    /// assert_eq!(d.wait().unwrap(), Ok(String::from("v5")));
    /// ```
    pub fn then_with<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Box::new(on_fulfilled), Box::new(on_rejected))
    }

    /// [`then`](Deferred::then) with only a fulfillment handler; rejections
    /// pass through untouched.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Box::new(on_fulfilled), Box::new(|reason| Err(reason)))
    }

    /// [`then`](Deferred::then) with only a rejection handler.
    pub fn catch<F>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.then(None, Some(Box::new(on_rejected)))
    }

    /// Runs `on_finally` once the deferred settles either way, then forwards
    /// the original value or rejection. An `Err` from `on_finally` rejects
    /// the chain with that error instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::Deferred;
    ///
    /// let d = Deferred::<i32, &str>::rejected("e").finally(|| Ok(()));
    /// assert_eq!(d.wait().unwrap(), Err("e"));
    /// ```
    pub fn finally<F>(&self, on_finally: F) -> Deferred<T, E>
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        let on_finally = Rc::new(Cell::new(Some(on_finally)));
        let run = move || match on_finally.take() {
            Some(on_finally) => on_finally(),
            None => Ok(()),
        };
        let run_err = run.clone();
        self.then(
            Some(Box::new(move |value| {
                run()?;
                Ok(Resolution::Value(value))
            })),
            Some(Box::new(move |reason| {
                run_err()?;
                Err(reason)
            })),
        )
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Thenable<T, E> for Deferred<T, E> {
    fn subscribe(self: Box<Self>, resolve: Resolve<T, E>, reject: Reject<T, E>) -> Result<(), E> {
        self.subscribe_reaction(Reaction {
            on_fulfilled: Box::new(move |value| resolve.resolve(value)),
            on_rejected: Box::new(move |reason| reject.reject(reason)),
        });
        Ok(())
    }
}
