use std::{future::Future, marker::PhantomData};

use futures::channel::oneshot;
use parking_lot::Mutex;

use super::{
    byte_controller::ByteView,
    error::{StreamError, StreamResult},
    readable::{settled, ReadableController, ReadableStream, ReadableStreamInner, StreamState},
    signal::SignalFuture,
    ByteStream, DefaultStream, StreamTypeMarker, Unlocked,
};
use crate::platform::{MaybeSend, SharedPtr};

/// Outcome of a BYOB read.
///
/// `value` hands the caller's buffer back. It is `None` only when the stream
/// was canceled while the read was pending. When `done` is set the view may
/// be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadableStreamBYOBReadResult {
    pub value: Option<ByteView>,
    pub done: bool,
}

// ----------- Default reader -----------
/// Exclusive reader returning whole chunks. Dropping it releases the lock.
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static, StreamType = DefaultStream> {
    inner: SharedPtr<Mutex<ReadableStreamInner<T>>>,
    lock_id: u64,
    _type: PhantomData<fn() -> StreamType>,
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> ReadableStreamDefaultReader<T, S> {
    pub(crate) fn acquire(inner: SharedPtr<Mutex<ReadableStreamInner<T>>>) -> StreamResult<Self> {
        let (lock_id, _) = inner.lock().acquire_reader(false)?;
        Ok(Self {
            inner,
            lock_id,
            _type: PhantomData,
        })
    }

    pub(crate) fn start_read(&self) -> oneshot::Receiver<StreamResult<Option<T>>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().read(self.lock_id, tx);
        rx
    }

    pub(crate) fn start_cancel(&self, reason: Option<StreamError>) -> oneshot::Receiver<StreamResult<()>> {
        let mut inner = self.inner.lock();
        if !inner.holds_lock(self.lock_id) {
            return settled(Err(StreamError::Released));
        }
        inner.cancel(reason)
    }

    pub(crate) fn stream_state(&self) -> (StreamState, Option<StreamError>) {
        let inner = self.inner.lock();
        (inner.core.state, inner.core.stored_error.clone())
    }

    /// Reads the next chunk; `Ok(None)` once the stream is closed.
    ///
    /// The read is registered immediately, so several reads issued back to
    /// back are served in call order.
    pub fn read(&self) -> impl Future<Output = StreamResult<Option<T>>> {
        let rx = self.start_read();
        async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> {
        let rx = self.start_cancel(reason);
        async move { rx.await.unwrap_or(Ok(())) }
    }

    /// Resolves when the stream closes, rejects when it errors or the lock
    /// is released.
    pub fn closed(&self) -> SignalFuture {
        self.inner.lock().reader_closed(self.lock_id).wait()
    }

    /// Releases the lock and returns the unlocked stream.
    pub fn release_lock(self) -> ReadableStream<T, S, Unlocked> {
        let inner = self.inner.clone();
        drop(self);
        ReadableStream::from_inner(inner)
    }
}

impl<T: MaybeSend + 'static, S> Drop for ReadableStreamDefaultReader<T, S> {
    fn drop(&mut self) {
        self.inner.lock().release_reader(self.lock_id);
    }
}

// ----------- BYOB reader -----------
/// Reader of a byte stream that fills caller-provided buffers.
pub struct ReadableStreamBYOBReader {
    inner: SharedPtr<Mutex<ReadableStreamInner<Vec<u8>>>>,
    lock_id: u64,
}

impl ReadableStreamBYOBReader {
    pub(crate) fn acquire(inner: SharedPtr<Mutex<ReadableStreamInner<Vec<u8>>>>) -> StreamResult<Self> {
        let (lock_id, _) = inner.lock().acquire_reader(true)?;
        Ok(Self { inner, lock_id })
    }

    pub(crate) fn start_read(
        &self,
        view: ByteView,
        min: usize,
    ) -> oneshot::Receiver<StreamResult<ReadableStreamBYOBReadResult>> {
        if view.is_empty() || view.buffer_len() == 0 {
            return settled(Err(StreamError::InvalidArgument("view must not be empty")));
        }
        if min == 0 {
            return settled(Err(StreamError::InvalidArgument("min must be greater than 0")));
        }
        if min > view.len() {
            return settled(Err(StreamError::OutOfRange("min exceeds the view length")));
        }

        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.holds_lock(self.lock_id) {
            let _ = tx.send(Err(StreamError::Released));
            return rx;
        }
        inner.core.disturbed = true;
        if inner.core.state == StreamState::Errored {
            let _ = tx.send(Err(inner.core.stored_error()));
            return rx;
        }
        if let ReadableController::Byte(controller) = &mut inner.controller {
            controller.pull_into(&mut inner.core, view, min, tx);
        }
        rx
    }

    pub(crate) fn start_cancel(&self, reason: Option<StreamError>) -> oneshot::Receiver<StreamResult<()>> {
        let mut inner = self.inner.lock();
        if !inner.holds_lock(self.lock_id) {
            return settled(Err(StreamError::Released));
        }
        inner.cancel(reason)
    }

    /// Fills `view` with at least one element.
    pub fn read(&self, view: ByteView) -> impl Future<Output = StreamResult<ReadableStreamBYOBReadResult>> {
        self.read_min(view, 1)
    }

    /// Fills `view` with at least `min` elements, fewer only when the stream
    /// closes first.
    pub fn read_min(
        &self,
        view: ByteView,
        min: usize,
    ) -> impl Future<Output = StreamResult<ReadableStreamBYOBReadResult>> {
        let rx = self.start_read(view, min);
        async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    pub fn cancel(&self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> {
        let rx = self.start_cancel(reason);
        async move { rx.await.unwrap_or(Ok(())) }
    }

    pub fn closed(&self) -> SignalFuture {
        self.inner.lock().reader_closed(self.lock_id).wait()
    }

    pub fn release_lock(self) -> ReadableStream<Vec<u8>, ByteStream, Unlocked> {
        let inner = self.inner.clone();
        drop(self);
        ReadableStream::from_inner(inner)
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        self.inner.lock().release_reader(self.lock_id);
    }
}
