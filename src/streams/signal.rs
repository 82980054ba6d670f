//! One-shot signals settled once and observed many times.
//!
//! Readers and writers expose their `closed` and `ready` state through a
//! [`Signal`]. A signal starts pending, is resolved or rejected exactly once,
//! and any number of clones may await it. Resetting `ready` to pending is done
//! by swapping in a fresh signal, so futures created from the old one keep
//! observing the old outcome.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use futures::future::FusedFuture;
use parking_lot::Mutex;

use super::error::{StreamError, StreamResult};
use crate::platform::SharedPtr;

// ----------- WakerSet -----------
/// A set of wakers without duplicates (based on `will_wake`).
#[derive(Default, Debug)]
pub(crate) struct WakerSet(Vec<Waker>);

impl WakerSet {
    pub fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    pub fn wake_all(&mut self) {
        for waker in self.0.drain(..) {
            waker.wake();
        }
    }
}

#[derive(Debug)]
enum SignalState {
    Pending(WakerSet),
    Resolved,
    Rejected(StreamError),
}

#[derive(Clone, Debug)]
pub struct Signal {
    state: SharedPtr<Mutex<SignalState>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::pending()
    }
}

impl Signal {
    pub fn pending() -> Self {
        Self {
            state: SharedPtr::new(Mutex::new(SignalState::Pending(WakerSet::default()))),
        }
    }

    pub fn resolved() -> Self {
        Self {
            state: SharedPtr::new(Mutex::new(SignalState::Resolved)),
        }
    }

    pub fn rejected(error: StreamError) -> Self {
        Self {
            state: SharedPtr::new(Mutex::new(SignalState::Rejected(error))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), SignalState::Pending(_))
    }

    /// Resolves the signal. Returns `false` if it was already settled.
    pub fn resolve(&self) -> bool {
        self.settle(SignalState::Resolved)
    }

    /// Rejects the signal. Returns `false` if it was already settled.
    pub fn reject(&self, error: StreamError) -> bool {
        self.settle(SignalState::Rejected(error))
    }

    fn settle(&self, outcome: SignalState) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            SignalState::Pending(wakers) => {
                let mut wakers = std::mem::take(wakers);
                *state = outcome;
                drop(state);
                wakers.wake_all();
                true
            }
            _ => false,
        }
    }

    /// Settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<StreamResult<()>> {
        match &*self.state.lock() {
            SignalState::Pending(_) => None,
            SignalState::Resolved => Some(Ok(())),
            SignalState::Rejected(e) => Some(Err(e.clone())),
        }
    }

    pub fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let mut state = self.state.lock();
        match &mut *state {
            SignalState::Pending(wakers) => {
                wakers.register(cx.waker());
                Poll::Pending
            }
            SignalState::Resolved => Poll::Ready(Ok(())),
            SignalState::Rejected(e) => Poll::Ready(Err(e.clone())),
        }
    }

    /// Future completing once the signal settles.
    pub fn wait(&self) -> SignalFuture {
        SignalFuture {
            signal: Some(self.clone()),
        }
    }
}

#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct SignalFuture {
    signal: Option<Signal>,
}

impl Future for SignalFuture {
    type Output = StreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(signal) = self.signal.as_ref() else {
            return Poll::Pending;
        };
        match signal.poll_settled(cx) {
            Poll::Ready(outcome) => {
                self.signal = None;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for SignalFuture {
    fn is_terminated(&self) -> bool {
        self.signal.is_none()
    }
}
