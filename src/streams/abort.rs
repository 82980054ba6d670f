use std::{
    future::Future,
    task::{Context, Poll},
};

use futures::{
    future::{self, Either},
    FutureExt,
};
use parking_lot::Mutex;

use super::{
    error::{StreamError, StreamResult},
    signal::WakerSet,
};
use crate::platform::SharedPtr;

#[derive(Default)]
struct AbortState {
    reason: Option<StreamError>,
    wakers: WakerSet,
}

/// Owner side of an [`AbortSignal`].
#[derive(Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Triggers the signal. Later calls keep the first reason.
    pub fn abort(&self, reason: Option<StreamError>) {
        self.signal.trigger(reason.unwrap_or(StreamError::Aborted(None)));
    }
}

/// Cancellation input observed by sinks and by the pipe algorithm.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: SharedPtr<Mutex<AbortState>>,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl AbortSignal {
    pub(crate) fn trigger(&self, reason: StreamError) {
        let mut state = self.state.lock();
        if state.reason.is_some() {
            return;
        }
        state.reason = Some(reason);
        let mut wakers = std::mem::take(&mut state.wakers);
        drop(state);
        wakers.wake_all();
    }

    /// Returns `true` once the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.state.lock().reason.clone()
    }

    fn poll_aborted(&self, cx: &mut Context<'_>) -> Poll<StreamError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.reason.clone() {
            return Poll::Ready(reason);
        }
        state.wakers.register(cx.waker());
        Poll::Pending
    }

    /// Resolves with the abort reason once the signal fires.
    pub fn aborted(&self) -> impl Future<Output = StreamError> + Unpin {
        let signal = self.clone();
        future::poll_fn(move |cx| signal.poll_aborted(cx))
    }

    /// Races `fut` against the signal, failing with the abort reason if the
    /// signal fires first.
    ///
    /// Sinks use this to stop long writes promptly when the stream is aborted:
    ///
    /// ```no_run
    /// # use conduit_streams::{AbortSignal, StreamError};
    /// # async fn slow_io() {}
    /// # async fn example(signal: AbortSignal) -> Result<(), StreamError> {
    /// signal.with_abort(slow_io()).await
    /// # }
    /// ```
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = StreamResult<T>>
    where
        F: Future<Output = T>,
    {
        let abort = self.aborted();
        future::select(Box::pin(fut), abort).map(|either| match either {
            Either::Left((value, _)) => Ok(value),
            Either::Right((reason, _)) => Err(reason),
        })
    }
}
