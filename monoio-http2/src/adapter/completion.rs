//! Single-completion futures over callbacks and events.
//!
//! A [`Completion`] is the writing half of a gate that settles exactly once.
//! Listener tokens handed to the gate are detached synchronously when it
//! settles, before the value becomes visible to the [`Wait`], so a second
//! event racing the first can never complete it again.
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
    time::Duration,
};

use super::event::{Emitter, Event, ListenerToken};
use crate::error::{Error, Result};

struct Gate<T> {
    state: RefCell<GateState<T>>,
}

struct GateState<T> {
    settled: bool,
    value: Option<Result<T>>,
    waker: Option<Waker>,
    tokens: Vec<ListenerToken>,
    on_cancel: Option<Box<dyn FnOnce()>>,
}

impl<T> Gate<T> {
    fn new() -> Self {
        Self {
            state: RefCell::new(GateState {
                settled: false,
                value: None,
                waker: None,
                tokens: Vec::new(),
                on_cancel: None,
            }),
        }
    }

    /// Marks the gate settled and hands back what must be released. `None`
    /// if it was settled before.
    fn close(&self) -> Option<(Vec<ListenerToken>, Option<Box<dyn FnOnce()>>)> {
        let mut state = self.state.borrow_mut();
        if state.settled {
            return None;
        }
        state.settled = true;
        Some((std::mem::take(&mut state.tokens), state.on_cancel.take()))
    }

    fn publish(&self, result: Result<T>) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.value = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn settle(&self, result: Result<T>) -> bool {
        let Some((tokens, on_cancel)) = self.close() else {
            return false;
        };
        for token in tokens {
            token.detach();
        }
        drop(on_cancel);
        self.publish(result);
        true
    }

    fn cancel_with(&self, reason: Error) -> bool {
        let Some((tokens, on_cancel)) = self.close() else {
            return false;
        };
        // Listeners go first: an abort that reports back through an event
        // must find nobody listening.
        for token in tokens {
            token.detach();
        }
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
        self.publish(Err(reason));
        true
    }

    fn hold(&self, token: ListenerToken) {
        let mut state = self.state.borrow_mut();
        if state.settled {
            drop(state);
            token.detach();
        } else {
            state.tokens.push(token);
        }
    }

    fn is_settled(&self) -> bool {
        self.state.borrow().settled
    }
}

trait Cancel {
    fn cancel(&self) -> bool;
}

impl<T> Cancel for Gate<T> {
    fn cancel(&self) -> bool {
        self.cancel_with(Error::Cancelled)
    }
}

/// Creates a connected completion and wait.
pub fn completion<T>() -> (Completion<T>, Wait<T>) {
    let gate = Rc::new(Gate::new());
    (Completion { gate: gate.clone() }, Wait { gate })
}

/// Wraps a one-shot callback API. `f` receives the completion and arranges
/// for it to be called exactly once; cancelling the returned wait only stops
/// listening, the native operation still runs to its end.
pub fn from_callback<T, F>(f: F) -> Wait<T>
where
    F: FnOnce(Completion<T>),
{
    let (done, wait) = completion();
    f(done);
    wait
}

/// A wait that is already settled.
pub fn ready<T>(result: Result<T>) -> Wait<T> {
    let (done, wait) = completion();
    done.complete(result);
    wait
}

/// Writing half of a gate.
pub struct Completion<T> {
    gate: Rc<Gate<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
        }
    }
}

impl<T> Completion<T> {
    /// Settles the gate. Returns `false` if it was already settled or
    /// cancelled, in which case `result` is dropped.
    pub fn complete(&self, result: Result<T>) -> bool {
        self.gate.settle(result)
    }

    /// Keeps `token` until the gate settles, then detaches it. A token handed
    /// over after settling is detached right away.
    pub fn hold(&self, token: ListenerToken) {
        self.gate.hold(token)
    }

    pub fn is_settled(&self) -> bool {
        self.gate.is_settled()
    }
}

impl<T: 'static> Completion<T> {
    /// Settles the gate with `map(event)` on the next event of `kind`.
    pub fn settle_on<E, F>(&self, emitter: &Emitter<E>, kind: E::Kind, map: F)
    where
        E: Event + 'static,
        F: FnOnce(&E) -> Result<T> + 'static,
    {
        if self.is_settled() {
            return;
        }
        let done = self.clone();
        let token = emitter.once(kind, move |event| {
            done.complete(map(event));
        });
        self.hold(token);
    }
}

/// Future side of a gate.
///
/// Dropping an unsettled wait cancels it.
#[must_use = "waits do nothing unless polled"]
pub struct Wait<T> {
    gate: Rc<Gate<T>>,
}

impl<T> Wait<T> {
    /// Cancels the wait: detaches its listeners, then runs the hook set with
    /// [`Wait::on_cancel`]. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        self.gate.cancel_with(Error::Cancelled)
    }

    pub fn is_settled(&self) -> bool {
        self.gate.is_settled()
    }

    /// Runs `f` if the wait gets cancelled (explicitly, by timeout or by
    /// being dropped unsettled).
    pub fn on_cancel<F: FnOnce() + 'static>(self, f: F) -> Self {
        {
            let mut state = self.gate.state.borrow_mut();
            if !state.settled {
                state.on_cancel = Some(Box::new(f));
            }
        }
        self
    }

    /// Waits at most `duration`; on expiry the wait is cancelled and
    /// `Error::Timeout` returned.
    pub async fn timeout(mut self, duration: Duration) -> Result<T> {
        match monoio::time::timeout(duration, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                if self.gate.cancel_with(Error::Timeout) {
                    Err(Error::Timeout)
                } else {
                    // Settled right at the deadline.
                    (&mut self).await
                }
            }
        }
    }
}

impl<T: 'static> Wait<T> {
    /// A handle that can cancel this wait from elsewhere.
    pub fn canceller(&self) -> Canceller {
        let gate: Rc<dyn Cancel> = self.gate.clone();
        Canceller {
            gate: Rc::downgrade(&gate),
        }
    }
}

impl<T> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.gate.state.borrow_mut();
        if let Some(value) = state.value.take() {
            return Poll::Ready(value);
        }
        if state.settled {
            // Value already taken by an earlier poll.
            return Poll::Ready(Err(Error::Cancelled));
        }
        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        self.gate.cancel_with(Error::Cancelled);
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Cancellation action detached from the wait it belongs to.
#[derive(Clone)]
pub struct Canceller {
    gate: Weak<dyn Cancel>,
}

impl Canceller {
    /// Returns `false` if the wait had already settled or is gone.
    pub fn cancel(&self) -> bool {
        match self.gate.upgrade() {
            Some(gate) => gate.cancel(),
            None => false,
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Canceller")
    }
}
