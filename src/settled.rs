use crate::deferred::{Deferred, Reaction};
use crate::{scheduler, Error};
use std::cell::RefCell;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Awaits the outcome of a [`Deferred`].
///
/// Resolves to `Ok(Ok(value))` or `Ok(Err(reason))` once the deferred settles,
/// or to `Err(Error::Abandoned)` if it was dropped while still pending.
///
/// # Examples
///
/// ```
/// use deferred::{scheduler, Deferred, Resolution};
/// use std::future::IntoFuture;
///
/// let a = Deferred::<i32, ()>::resolved(1);
/// let b = a.and_then(|v| Ok(Resolution::Value(v + 1)));
/// let sum = scheduler::block_on(async move {
///     let (a, b) = futures::future::join(a.into_future(), b.into_future()).await;
///     Ok::<_, deferred::Error>(a?.unwrap() + b?.unwrap())
/// });
/// assert_eq!(sum.unwrap(), Ok(3));
/// ```
#[derive(Debug)]
pub struct Settled<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Taken,
}

#[derive(Debug)]
struct Slot<T, E> {
    outcome: Option<Result<Result<T, E>, Error>>,
    waker: Result<Waker, WakerState>,
}

/// Feeds the slot. Dropped without delivering means the continuation will
/// never run.
struct Sender<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

impl<T, E> Sender<T, E> {
    fn deliver(&self, outcome: Result<Result<T, E>, Error>) {
        let mut slot = self.slot.borrow_mut();
        if matches!(slot.waker, Err(WakerState::Taken)) || slot.outcome.is_some() {
            return;
        }
        slot.outcome = Some(outcome);
        if let Ok(waker) = std::mem::replace(&mut slot.waker, Err(WakerState::Taken)) {
            waker.wake()
        }
    }
}

impl<T, E> Drop for Sender<T, E> {
    fn drop(&mut self) {
        self.deliver(Err(Error::Abandoned));
    }
}

impl<T: Clone + 'static, E: Clone + 'static> IntoFuture for Deferred<T, E> {
    type Output = Result<Result<T, E>, Error>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        let slot = Rc::new(RefCell::new(Slot {
            outcome: None,
            waker: Err(WakerState::Fresh),
        }));
        let sender = Rc::new(Sender { slot: slot.clone() });
        let on_rejected = sender.clone();
        self.subscribe_reaction(Reaction {
            on_fulfilled: Box::new(move |value| sender.deliver(Ok(Ok(value)))),
            on_rejected: Box::new(move |reason| on_rejected.deliver(Ok(Err(reason)))),
        });
        Settled { slot }
    }
}

impl<T, E> Future for Settled<T, E> {
    type Output = Result<Result<T, E>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.outcome.take() {
            Some(outcome) => {
                slot.waker = Err(WakerState::Taken);
                Poll::Ready(outcome)
            }
            None => {
                if matches!(slot.waker, Err(WakerState::Taken)) {
                    // already handed out once
                    return Poll::Ready(Err(Error::Abandoned));
                }
                slot.waker = Ok(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// Drives this thread's scheduler until the deferred settles.
    ///
    /// Fails with [`Error::Stalled`] when the deferred can no longer settle
    /// from work queued on this thread.
    pub fn wait(&self) -> Result<Result<T, E>, Error> {
        scheduler::block_on(self.clone().into_future())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    #[test]
    fn test_wait_fulfilled() {
        let d = Deferred::<String, ()>::resolved(String::from("🍓"));
        assert_eq!(d.wait(), Ok(Ok(String::from("🍓"))));
    }

    #[test]
    fn test_wait_rejected() {
        let d = Deferred::<(), String>::rejected(String::from("reject!!"));
        assert_eq!(d.wait(), Ok(Err(String::from("reject!!"))));
    }

    #[test]
    fn test_wait_stalls_on_pending() {
        let (tx, d) = {
            let mut keep = None;
            let d = Deferred::<i32, ()>::new(|resolve, _| {
                keep = Some(resolve);
                Ok(())
            });
            (keep, d)
        };
        assert_eq!(d.wait(), Err(Error::Stalled));
        // the continuation from the failed wait is still queued and fires now
        if let Some(resolve) = tx {
            resolve.resolve(4);
        }
        assert_eq!(d.wait(), Ok(Ok(4)));
    }

    #[test]
    fn test_abandoned_when_dropped_unsettled() {
        let d = Deferred::<i32, ()>::new(|_, _| Ok(()));
        let settled = d.into_future();
        assert_eq!(scheduler::block_on(settled), Ok(Err(Error::Abandoned)));
    }

    #[test]
    fn test_future_sees_chained_value() {
        let d = Deferred::<i32, ()>::resolved(20).and_then(|v| Ok(Resolution::Value(v + 1)));
        let out = scheduler::block_on(async move { d.await });
        assert_eq!(out, Ok(Ok(Ok(21))));
    }
}
