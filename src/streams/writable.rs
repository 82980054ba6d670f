use std::{
    collections::VecDeque,
    future::Future,
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    AsyncWrite, StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    abort::{AbortController, AbortSignal},
    chunked_queue::ChunkedQueue,
    error::{StreamError, StreamResult},
    readable::settled,
    signal::{Signal, SignalFuture},
    CountQueuingStrategy, Locked, QueuingStrategy, Unlocked,
};
use crate::platform::{
    self, BoxedStrategy, DynWritableTarget, MaybeSend, PlatformFuture, SharedPtr, WeakPtr,
};

type Completion = oneshot::Sender<StreamResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableStreamState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

/// Commands sent to the task that owns the sink
enum SinkCommand<T> {
    Write(T),
    Close,
    Abort {
        reason: Option<StreamError>,
        done: Signal,
    },
}

enum QueueRecord<T> {
    /// Chunk queued through the writer holding `lock_id`.
    Chunk { chunk: T, lock_id: u64 },
    /// Chunk handed to the sink, still counted until its write settles.
    InFlight,
    Close,
}

struct PendingAbort {
    done: Signal,
    reason: Option<StreamError>,
    was_already_erroring: bool,
}

struct WriterSlot {
    id: u64,
    ready: Signal,
    closed: Signal,
}

pub(crate) struct WritableStreamInner<T> {
    state: WritableStreamState,
    stored_error: Option<StreamError>,
    writer: Option<WriterSlot>,
    backpressure: bool,
    write_requests: VecDeque<Completion>,
    in_flight_write: Option<Completion>,
    close_request: Option<Completion>,
    in_flight_close: Option<Completion>,
    pending_abort: Option<PendingAbort>,

    queue: ChunkedQueue<(QueueRecord<T>, usize)>,
    queue_total_size: usize,
    strategy: BoxedStrategy<T>,
    started: bool,
    sink_tx: Option<UnboundedSender<SinkCommand<T>>>,
    abort_controller: AbortController,
    next_lock_id: u64,
}

impl<T> WritableStreamInner<T> {
    fn new(strategy: BoxedStrategy<T>, sink_tx: UnboundedSender<SinkCommand<T>>) -> Self {
        let mut inner = Self {
            state: WritableStreamState::Writable,
            stored_error: None,
            writer: None,
            backpressure: false,
            write_requests: VecDeque::new(),
            in_flight_write: None,
            close_request: None,
            in_flight_close: None,
            pending_abort: None,
            queue: ChunkedQueue::new(),
            queue_total_size: 0,
            strategy,
            started: false,
            sink_tx: Some(sink_tx),
            abort_controller: AbortController::new(),
            next_lock_id: 0,
        };
        inner.backpressure = inner.get_backpressure();
        inner
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Errored)
    }

    pub(crate) fn state(&self) -> WritableStreamState {
        self.state
    }

    pub(crate) fn stored_error_opt(&self) -> Option<StreamError> {
        self.stored_error.clone()
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    pub(crate) fn desired_size(&self) -> isize {
        super::desired_size(self.strategy.high_water_mark(), self.queue_total_size)
    }

    fn get_backpressure(&self) -> bool {
        self.desired_size() <= 0
    }

    fn send(&self, command: SinkCommand<T>) -> bool {
        self.sink_tx
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(command).is_ok())
    }

    fn clear_algorithms(&mut self) {
        self.sink_tx = None;
    }

    // ----------- Stream-level algorithms -----------
    fn update_backpressure(&mut self, backpressure: bool) {
        debug_assert_eq!(self.state, WritableStreamState::Writable);
        debug_assert!(!self.close_queued_or_in_flight());
        if let Some(writer) = &mut self.writer {
            if backpressure != self.backpressure {
                if backpressure {
                    writer.ready = Signal::pending();
                } else {
                    writer.ready.resolve();
                }
            }
        }
        self.backpressure = backpressure;
    }

    fn start_erroring(&mut self, reason: StreamError) {
        debug_assert!(self.stored_error.is_none());
        debug_assert_eq!(self.state, WritableStreamState::Writable);
        debug!(%reason, "writable stream erroring");
        self.state = WritableStreamState::Erroring;
        self.stored_error = Some(reason.clone());
        if let Some(writer) = &mut self.writer {
            if !writer.ready.reject(reason.clone()) {
                writer.ready = Signal::rejected(reason);
            }
        }
        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        debug_assert_eq!(self.state, WritableStreamState::Erroring);
        debug_assert!(!self.has_operation_marked_in_flight());
        self.state = WritableStreamState::Errored;
        debug!("writable stream errored");
        self.queue.clear();
        self.queue_total_size = 0;

        let stored_error = self.stored_error();
        for request in self.write_requests.drain(..) {
            let _ = request.send(Err(stored_error.clone()));
        }

        let Some(abort) = self.pending_abort.take() else {
            self.clear_algorithms();
            self.reject_close_and_closed_if_needed();
            return;
        };
        if abort.was_already_erroring {
            self.clear_algorithms();
            abort.done.reject(stored_error);
            self.reject_close_and_closed_if_needed();
            return;
        }

        let command = SinkCommand::Abort {
            reason: abort.reason,
            done: abort.done.clone(),
        };
        let dispatched = self.send(command);
        self.clear_algorithms();
        if !dispatched {
            self.on_abort_settled(Ok(()), &abort.done);
        }
    }

    fn on_abort_settled(&mut self, result: StreamResult<()>, done: &Signal) {
        match result {
            Ok(()) => {
                done.resolve();
            }
            Err(error) => {
                done.reject(error);
            }
        }
        self.reject_close_and_closed_if_needed();
    }

    fn reject_close_and_closed_if_needed(&mut self) {
        debug_assert_eq!(self.state, WritableStreamState::Errored);
        let stored_error = self.stored_error();
        if let Some(request) = self.close_request.take() {
            debug_assert!(self.in_flight_close.is_none());
            let _ = request.send(Err(stored_error.clone()));
        }
        if let Some(writer) = &mut self.writer {
            if !writer.closed.reject(stored_error.clone()) {
                writer.closed = Signal::rejected(stored_error);
            }
        }
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableStreamState::Writable {
            self.start_erroring(error);
            return;
        }
        debug_assert_eq!(self.state, WritableStreamState::Erroring);
        self.finish_erroring();
    }

    fn finish_in_flight_write(&mut self, result: StreamResult<()>) {
        if let Some(request) = self.in_flight_write.take() {
            let _ = request.send(result);
        }
    }

    fn finish_in_flight_close(&mut self) {
        if let Some(request) = self.in_flight_close.take() {
            let _ = request.send(Ok(()));
        }
        debug_assert!(matches!(
            self.state,
            WritableStreamState::Writable | WritableStreamState::Erroring
        ));
        if self.state == WritableStreamState::Erroring {
            // The sink closed cleanly, so a pending abort has nothing left to do.
            if let Some(abort) = self.pending_abort.take() {
                abort.done.resolve();
            }
            self.finish_erroring();
            return;
        }
        debug!("writable stream closed");
        self.state = WritableStreamState::Closed;
        if let Some(writer) = &self.writer {
            writer.closed.resolve();
        }
    }

    fn finish_in_flight_close_with_error(&mut self, error: StreamError) {
        if let Some(request) = self.in_flight_close.take() {
            let _ = request.send(Err(error.clone()));
        }
        debug_assert!(matches!(
            self.state,
            WritableStreamState::Writable | WritableStreamState::Erroring
        ));
        if let Some(abort) = self.pending_abort.take() {
            abort.done.reject(error.clone());
        }
        self.deal_with_rejection(error);
    }

    // ----------- Controller algorithms -----------
    fn chunk_size(&mut self, chunk: &T) -> usize {
        match self.strategy.try_size(chunk) {
            Ok(size) => size,
            Err(error) => {
                self.error_if_needed(error);
                1
            }
        }
    }

    pub(crate) fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableStreamState::Writable {
            self.clear_algorithms();
            self.start_erroring(error);
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.in_flight_write.is_some() {
            return;
        }
        if self.state == WritableStreamState::Erroring {
            self.finish_erroring();
            return;
        }
        if self.state != WritableStreamState::Writable {
            return;
        }
        match self.queue.peek_mut() {
            None => {}
            Some((QueueRecord::Close, _)) => self.process_close(),
            Some((record, _)) => {
                let QueueRecord::Chunk { chunk, .. } = std::mem::replace(record, QueueRecord::InFlight) else {
                    return;
                };
                self.process_write(chunk);
            }
        }
    }

    fn process_close(&mut self) {
        debug_assert!(self.in_flight_close.is_none());
        self.in_flight_close = self.close_request.take();
        let _ = self.queue.shift();
        debug_assert!(self.queue.is_empty());
        trace!("dispatching sink close");
        let dispatched = self.send(SinkCommand::Close);
        self.clear_algorithms();
        if !dispatched {
            self.on_close_settled(Ok(()));
        }
    }

    fn process_write(&mut self, chunk: T) {
        debug_assert!(self.in_flight_write.is_none());
        self.in_flight_write = self.write_requests.pop_front();
        trace!("dispatching sink write");
        if !self.send(SinkCommand::Write(chunk)) {
            self.on_write_settled(Err(StreamError::TaskDropped));
        }
    }

    fn on_start_settled(&mut self, result: StreamResult<()>) {
        debug_assert!(matches!(
            self.state,
            WritableStreamState::Writable | WritableStreamState::Erroring
        ));
        self.started = true;
        match result {
            Ok(()) => self.advance_queue_if_needed(),
            Err(error) => self.deal_with_rejection(error),
        }
    }

    fn on_write_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.finish_in_flight_write(Ok(()));
                if let Some((_, size)) = self.queue.shift() {
                    debug_assert!(size <= self.queue_total_size);
                    self.queue_total_size -= size;
                }
                if !self.close_queued_or_in_flight() && self.state == WritableStreamState::Writable {
                    let backpressure = self.get_backpressure();
                    self.update_backpressure(backpressure);
                }
                self.advance_queue_if_needed();
            }
            Err(error) => {
                if self.state == WritableStreamState::Writable {
                    self.clear_algorithms();
                }
                self.finish_in_flight_write(Err(error.clone()));
                self.deal_with_rejection(error);
            }
        }
    }

    fn on_close_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => self.finish_in_flight_close(),
            Err(error) => self.finish_in_flight_close_with_error(error),
        }
    }

    // ----------- Operations -----------
    pub(crate) fn abort(&mut self, reason: Option<StreamError>) -> Signal {
        if matches!(
            self.state,
            WritableStreamState::Closed | WritableStreamState::Errored
        ) {
            return Signal::resolved();
        }
        self.abort_controller.abort(reason.clone());
        if let Some(abort) = &self.pending_abort {
            return abort.done.clone();
        }
        let was_already_erroring = self.state == WritableStreamState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        let done = Signal::pending();
        self.pending_abort = Some(PendingAbort {
            done: done.clone(),
            reason: reason.clone(),
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(reason.unwrap_or(StreamError::Aborted(None)));
        }
        done
    }

    pub(crate) fn close(&mut self) -> oneshot::Receiver<StreamResult<()>> {
        match self.state {
            WritableStreamState::Closed => return settled(Err(StreamError::Closed)),
            WritableStreamState::Errored => return settled(Err(self.stored_error())),
            _ => {}
        }
        if self.close_queued_or_in_flight() {
            return settled(Err(StreamError::Closing));
        }
        let (tx, rx) = oneshot::channel();
        self.close_request = Some(tx);
        if self.backpressure && self.state == WritableStreamState::Writable {
            if let Some(writer) = &self.writer {
                writer.ready.resolve();
            }
        }
        self.queue.push((QueueRecord::Close, 0));
        self.advance_queue_if_needed();
        rx
    }

    /// Close that reports success when the stream is already closing or
    /// closed. Used when propagating a close through a pipe.
    pub(crate) fn close_with_error_propagation(&mut self) -> oneshot::Receiver<StreamResult<()>> {
        if self.close_queued_or_in_flight() || self.state == WritableStreamState::Closed {
            return settled(Ok(()));
        }
        if self.state == WritableStreamState::Errored {
            return settled(Err(self.stored_error()));
        }
        self.close()
    }

    pub(crate) fn write(&mut self, lock_id: u64, chunk: T) -> oneshot::Receiver<StreamResult<()>> {
        if !self.holds_lock(lock_id) {
            return settled(Err(StreamError::Released));
        }
        let size = self.chunk_size(&chunk);
        if self.state == WritableStreamState::Errored {
            return settled(Err(self.stored_error()));
        }
        if self.state == WritableStreamState::Closed {
            return settled(Err(StreamError::Closed));
        }
        if self.close_queued_or_in_flight() {
            return settled(Err(StreamError::Closing));
        }
        if self.state == WritableStreamState::Erroring {
            return settled(Err(self.stored_error()));
        }
        let (tx, rx) = oneshot::channel();
        self.write_requests.push_back(tx);
        self.queue.push((QueueRecord::Chunk { chunk, lock_id }, size));
        self.queue_total_size += size;
        if !self.close_queued_or_in_flight() && self.state == WritableStreamState::Writable {
            let backpressure = self.get_backpressure();
            self.update_backpressure(backpressure);
        }
        self.advance_queue_if_needed();
        rx
    }

    // ----------- Writer bookkeeping -----------
    pub(crate) fn holds_lock(&self, lock_id: u64) -> bool {
        self.writer.as_ref().is_some_and(|w| w.id == lock_id)
    }

    fn acquire_writer(&mut self) -> StreamResult<u64> {
        if self.writer.is_some() {
            return Err(StreamError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id += 1;
        let (ready, closed) = match self.state {
            WritableStreamState::Writable => {
                let ready = if !self.close_queued_or_in_flight() && self.backpressure {
                    Signal::pending()
                } else {
                    Signal::resolved()
                };
                (ready, Signal::pending())
            }
            WritableStreamState::Erroring => (Signal::rejected(self.stored_error()), Signal::pending()),
            WritableStreamState::Closed => (Signal::resolved(), Signal::resolved()),
            WritableStreamState::Errored => (
                Signal::rejected(self.stored_error()),
                Signal::rejected(self.stored_error()),
            ),
        };
        self.writer = Some(WriterSlot { id, ready, closed });
        Ok(id)
    }

    fn release_writer(&mut self, lock_id: u64) {
        if !self.holds_lock(lock_id) {
            return;
        }
        if let Some(writer) = self.writer.take() {
            writer.ready.reject(StreamError::Released);
            writer.closed.reject(StreamError::Released);
        }
        self.reject_queued_writes(lock_id);
    }

    /// Drops the chunks `lock_id` queued that the sink has not picked up yet
    /// and rejects their requests. An in-flight write settles through the sink.
    fn reject_queued_writes(&mut self, lock_id: u64) {
        let queued_by_lock = |record: &QueueRecord<T>| {
            matches!(record, QueueRecord::Chunk { lock_id: id, .. } if *id == lock_id)
        };
        if !self.queue.iter().any(|(record, _)| queued_by_lock(record)) {
            return;
        }

        let records: Vec<_> = std::iter::from_fn(|| self.queue.shift()).collect();
        let mut requests = std::mem::take(&mut self.write_requests).into_iter();
        let mut rejected = 0;
        for (record, size) in records {
            let request = match record {
                QueueRecord::Chunk { .. } => requests.next(),
                _ => None,
            };
            if queued_by_lock(&record) {
                debug_assert!(size <= self.queue_total_size);
                self.queue_total_size -= size;
                if let Some(request) = request {
                    let _ = request.send(Err(StreamError::Released));
                }
                rejected += 1;
                continue;
            }
            self.write_requests.extend(request);
            self.queue.push((record, size));
        }
        trace!(rejected, "rejected writes queued through a released writer");

        if self.state == WritableStreamState::Writable && !self.close_queued_or_in_flight() {
            let backpressure = self.get_backpressure();
            self.update_backpressure(backpressure);
        }
    }

    pub(crate) fn writer_ready(&self, lock_id: u64) -> Signal {
        match &self.writer {
            Some(writer) if writer.id == lock_id => writer.ready.clone(),
            _ => Signal::rejected(StreamError::Released),
        }
    }

    pub(crate) fn writer_closed(&self, lock_id: u64) -> Signal {
        match &self.writer {
            Some(writer) if writer.id == lock_id => writer.closed.clone(),
            _ => Signal::rejected(StreamError::Released),
        }
    }

    pub(crate) fn writer_desired_size(&self) -> Option<isize> {
        match self.state {
            WritableStreamState::Errored | WritableStreamState::Erroring => None,
            WritableStreamState::Closed => Some(0),
            WritableStreamState::Writable => Some(self.desired_size()),
        }
    }
}

// ----------- Controller -----------
/// Engine entry points reachable from a [`WritableStreamDefaultController`].
pub(crate) trait ControllerTarget {
    fn error(&self, error: StreamError);
    fn desired_size(&self) -> Option<isize>;
    fn state(&self) -> (WritableStreamState, Option<StreamError>);
}

impl<T> ControllerTarget for Mutex<WritableStreamInner<T>> {
    fn error(&self, error: StreamError) {
        self.lock().error_if_needed(error);
    }

    fn desired_size(&self) -> Option<isize> {
        self.lock().writer_desired_size()
    }

    fn state(&self) -> (WritableStreamState, Option<StreamError>) {
        let inner = self.lock();
        (inner.state, inner.stored_error.clone())
    }
}

/// Handle given to a [`WritableSink`].
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    target: WeakPtr<DynWritableTarget>,
    signal: AbortSignal,
}

impl WritableStreamDefaultController {
    fn new(target: WeakPtr<DynWritableTarget>, signal: AbortSignal) -> Self {
        Self { target, signal }
    }

    /// Signal an error on the stream
    pub fn error(&self, error: StreamError) {
        if let Some(target) = self.target.upgrade() {
            target.error(error);
        }
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.target.upgrade().and_then(|target| target.desired_size())
    }

    pub(crate) fn state(&self) -> Option<(WritableStreamState, Option<StreamError>)> {
        self.target.upgrade().map(|target| target.state())
    }

    /// Fires when the stream is aborted, carrying the abort reason.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Returns `true` if the stream has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    /// Resolves once the stream is aborted.
    ///
    /// Sinks may `select!` on this alongside slow I/O so an abort stops the
    /// current write promptly.
    pub fn abort_future(&self) -> impl Future<Output = StreamError> + Unpin {
        self.signal.aborted()
    }

    /// Races a future against the abort signal.
    ///
    /// ```no_run
    /// # use conduit_streams::{StreamResult, WritableStreamDefaultController};
    /// # async fn slow_io(_: Vec<u8>) {}
    /// async fn write(chunk: Vec<u8>, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
    ///     controller.with_abort(slow_io(chunk)).await
    /// }
    /// ```
    pub fn with_abort<F, T>(&self, fut: F) -> impl Future<Output = StreamResult<T>>
    where
        F: Future<Output = T>,
    {
        self.signal.with_abort(fut)
    }
}

// ----------- Sink contract -----------
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink
    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async { Ok(()) }
    }

    /// Abort the sink
    fn abort(&mut self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

fn with_inner<T>(inner: &WeakPtr<Mutex<WritableStreamInner<T>>>, f: impl FnOnce(&mut WritableStreamInner<T>)) {
    if let Some(inner) = inner.upgrade() {
        f(&mut inner.lock());
    }
}

async fn writable_stream_task<T, Sink>(
    sink: Sink,
    mut controller: WritableStreamDefaultController,
    inner: WeakPtr<Mutex<WritableStreamInner<T>>>,
    mut commands: UnboundedReceiver<SinkCommand<T>>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let mut sink = Some(sink);
    if let Some(s) = sink.as_mut() {
        let started = s.start(&mut controller).await;
        with_inner(&inner, |i| i.on_start_settled(started));
    }

    while let Some(command) = commands.next().await {
        match command {
            SinkCommand::Write(chunk) => {
                let result = match sink.as_mut() {
                    Some(s) => s.write(chunk, &mut controller).await,
                    None => Err(StreamError::Closed),
                };
                with_inner(&inner, |i| i.on_write_settled(result));
            }
            SinkCommand::Close => {
                let result = match sink.take() {
                    Some(s) => s.close().await,
                    None => Ok(()),
                };
                with_inner(&inner, |i| i.on_close_settled(result));
            }
            SinkCommand::Abort { reason, done } => {
                let result = match sink.as_mut() {
                    Some(s) => s.abort(reason).await,
                    None => Ok(()),
                };
                with_inner(&inner, |i| i.on_abort_settled(result, &done));
            }
        }
    }
    trace!("writable sink task finished");
}

// ----------- WritableStream -----------
pub struct WritableStream<T: MaybeSend + 'static, LockState = Unlocked> {
    pub(crate) inner: SharedPtr<Mutex<WritableStreamInner<T>>>,
    _state: PhantomData<fn() -> LockState>,
}

impl<T: MaybeSend + 'static, L> WritableStream<T, L> {
    pub(crate) fn from_inner(inner: SharedPtr<Mutex<WritableStreamInner<T>>>) -> Self {
        Self {
            inner,
            _state: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    /// A controller handle bound to this stream, for adapters built on top
    /// of a writable stream.
    pub(crate) fn controller(&self) -> WritableStreamDefaultController {
        let signal = self.inner.lock().abort_controller.signal();
        let target: SharedPtr<DynWritableTarget> = self.inner.clone();
        WritableStreamDefaultController::new(SharedPtr::downgrade(&target), signal)
    }

    pub fn state(&self) -> WritableStreamState {
        self.inner.lock().state
    }
}

impl<T: MaybeSend + 'static> WritableStream<T, Unlocked> {
    pub fn builder<Sink>(sink: Sink) -> WritableStreamBuilder<T, Sink>
    where
        Sink: WritableSink<T>,
    {
        WritableStreamBuilder::new(sink)
    }

    /// Locks the stream to a new writer.
    pub fn get_writer(&self) -> StreamResult<(WritableStream<T, Locked>, WritableStreamDefaultWriter<T>)> {
        let writer = WritableStreamDefaultWriter::acquire(self.inner.clone())?;
        Ok((WritableStream::from_inner(self.inner.clone()), writer))
    }

    /// Aborts the stream, discarding queued chunks.
    pub fn abort(&self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> {
        let done = {
            let mut inner = self.inner.lock();
            if inner.writer.is_some() {
                Signal::rejected(StreamError::Locked)
            } else {
                inner.abort(reason)
            }
        };
        done.wait()
    }

    /// Closes the stream once every queued chunk has been written.
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.writer.is_some() {
                settled(Err(StreamError::Locked))
            } else {
                inner.close()
            }
        };
        async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }
}

// ----------- Writer -----------
/// Exclusive writer. Dropping it releases the lock.
///
/// Implements [`futures::Sink`]: `poll_ready` waits on [`ready`](Self::ready),
/// `poll_flush` waits for the last write to settle and `poll_close` closes the
/// stream.
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    inner: SharedPtr<Mutex<WritableStreamInner<T>>>,
    lock_id: u64,
    pending_write: Option<oneshot::Receiver<StreamResult<()>>>,
    pending_close: Option<oneshot::Receiver<StreamResult<()>>>,
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    fn acquire(inner: SharedPtr<Mutex<WritableStreamInner<T>>>) -> StreamResult<Self> {
        let lock_id = inner.lock().acquire_writer()?;
        Ok(Self {
            inner,
            lock_id,
            pending_write: None,
            pending_close: None,
        })
    }

    pub(crate) fn start_write(&self, chunk: T) -> oneshot::Receiver<StreamResult<()>> {
        self.inner.lock().write(self.lock_id, chunk)
    }

    pub(crate) fn start_close_with_error_propagation(&self) -> oneshot::Receiver<StreamResult<()>> {
        let mut inner = self.inner.lock();
        if !inner.holds_lock(self.lock_id) {
            return settled(Err(StreamError::Released));
        }
        inner.close_with_error_propagation()
    }

    pub(crate) fn start_abort(&self, reason: Option<StreamError>) -> Signal {
        let mut inner = self.inner.lock();
        if !inner.holds_lock(self.lock_id) {
            return Signal::rejected(StreamError::Released);
        }
        inner.abort(reason)
    }

    pub(crate) fn stream_state(&self) -> (WritableStreamState, Option<StreamError>, bool) {
        let inner = self.inner.lock();
        (inner.state, inner.stored_error_opt(), inner.close_queued_or_in_flight())
    }

    /// Queues `chunk`; the returned future settles when the sink has
    /// processed it.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let rx = self.start_write(chunk);
        async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let rx = {
            let mut inner = self.inner.lock();
            if !inner.holds_lock(self.lock_id) {
                settled(Err(StreamError::Released))
            } else {
                inner.close()
            }
        };
        async move { rx.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    pub fn abort(&self, reason: Option<StreamError>) -> SignalFuture {
        self.start_abort(reason).wait()
    }

    /// `None` once erroring or errored, `0` once closed.
    pub fn desired_size(&self) -> Option<isize> {
        let inner = self.inner.lock();
        if !inner.holds_lock(self.lock_id) {
            return None;
        }
        inner.writer_desired_size()
    }

    /// Resolves when the stream wants more data.
    pub fn ready(&self) -> SignalFuture {
        self.inner.lock().writer_ready(self.lock_id).wait()
    }

    pub fn closed(&self) -> SignalFuture {
        self.inner.lock().writer_closed(self.lock_id).wait()
    }

    /// Releases the lock and returns the unlocked stream.
    pub fn release_lock(self) -> WritableStream<T, Unlocked> {
        let inner = self.inner.clone();
        drop(self);
        WritableStream::from_inner(inner)
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let Some(rx) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result.unwrap_or(Err(StreamError::TaskDropped)),
        };
        self.pending_write = None;
        Poll::Ready(result)
    }
}

impl<T: MaybeSend + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.inner.lock().release_writer(self.lock_id);
    }
}

impl<T: MaybeSend + 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let ready = self.inner.lock().writer_ready(self.lock_id);
        ready.poll_settled(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> StreamResult<()> {
        let this = self.get_mut();
        let rx = this.start_write(item);
        this.pending_write = Some(rx);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        self.get_mut().poll_pending_write(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let this = self.get_mut();
        if this.pending_close.is_none() {
            let rx = {
                let mut inner = this.inner.lock();
                if !inner.holds_lock(this.lock_id) {
                    settled(Err(StreamError::Released))
                } else {
                    inner.close_with_error_propagation()
                }
            };
            this.pending_close = Some(rx);
        }
        let Some(rx) = this.pending_close.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => Poll::Ready(result.unwrap_or(Err(StreamError::TaskDropped))),
        }
    }
}

fn into_io_error(error: StreamError) -> io::Error {
    io::Error::other(error)
}

impl AsyncWrite for WritableStreamDefaultWriter<Vec<u8>> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ready = this.inner.lock().writer_ready(this.lock_id);
        match ready.poll_settled(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(error)) => Poll::Ready(Err(into_io_error(error))),
            Poll::Ready(Ok(())) => {
                this.pending_write = Some(this.start_write(buf.to_vec()));
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending_write(cx).map_err(into_io_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        futures::Sink::<Vec<u8>>::poll_close(self, cx).map_err(into_io_error)
    }
}

// ----------- Builder -----------
pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + 'static, Sink: WritableSink<T>> WritableStreamBuilder<T, Sink> {
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    pub(crate) fn boxed_strategy(mut self, strategy: BoxedStrategy<T>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (WritableStream<T, Unlocked>, PlatformFuture<'static, ()>) {
        let (tx, rx) = mpsc::unbounded();
        let inner = WritableStreamInner::new(self.strategy, tx);
        let signal = inner.abort_controller.signal();
        let inner = SharedPtr::new(Mutex::new(inner));
        let target: SharedPtr<DynWritableTarget> = inner.clone();
        let controller = WritableStreamDefaultController::new(SharedPtr::downgrade(&target), signal);
        let fut = writable_stream_task(self.sink, controller, SharedPtr::downgrade(&inner), rx);
        (WritableStream::from_inner(inner), platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_util::{spawner, Executor};
    use futures::{future::join, FutureExt, SinkExt};
    use std::sync::Arc;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().push(event.into());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    /// Sink whose writes wait on a gate handed out per call.
    struct GatedSink {
        log: Arc<Log>,
        gates: Arc<Mutex<VecDeque<oneshot::Sender<StreamResult<()>>>>>,
    }

    impl WritableSink<u32> for GatedSink {
        async fn write(&mut self, chunk: u32, _c: &mut WritableStreamDefaultController) -> StreamResult<()> {
            self.log.push(format!("write {chunk}"));
            let (tx, rx) = oneshot::channel();
            self.gates.lock().push_back(tx);
            rx.await.unwrap_or(Ok(()))
        }

        async fn close(self) -> StreamResult<()> {
            self.log.push("close");
            Ok(())
        }

        async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.log.push(format!("abort {}", reason.map(|r| r.to_string()).unwrap_or_default()));
            Ok(())
        }
    }

    type Gates = Arc<Mutex<VecDeque<oneshot::Sender<StreamResult<()>>>>>;

    fn gated(executor: &Executor, hwm: usize) -> (WritableStream<u32>, Arc<Log>, Gates) {
        let log = Arc::new(Log::default());
        let gates: Gates = Arc::default();
        let stream = WritableStream::builder(GatedSink {
            log: log.clone(),
            gates: gates.clone(),
        })
        .strategy(CountQueuingStrategy::new(hwm))
        .spawn(spawner(executor));
        executor.run_until_stalled();
        (stream, log, gates)
    }

    fn open_gate(executor: &Executor, gates: &Gates, result: StreamResult<()>) {
        let gate = gates.lock().pop_front().expect("a write is in flight");
        let _ = gate.send(result);
        executor.run_until_stalled();
    }

    struct CollectSink {
        items: Arc<Mutex<Vec<u32>>>,
    }

    impl WritableSink<u32> for CollectSink {
        async fn write(&mut self, chunk: u32, _c: &mut WritableStreamDefaultController) -> StreamResult<()> {
            self.items.lock().push(chunk);
            Ok(())
        }
    }

    #[test]
    fn writes_reach_sink_in_order_and_close_resolves() {
        let executor = Executor::new();
        let items = Arc::new(Mutex::new(Vec::new()));
        let stream = WritableStream::builder(CollectSink { items: items.clone() }).spawn(spawner(&executor));
        let (_, writer) = stream.get_writer().unwrap();

        executor.run_until(async {
            let writes = futures::future::join_all((0..5).map(|i| writer.write(i))).await;
            assert!(writes.iter().all(|w| w.is_ok()));
            writer.close().await.unwrap();
            writer.closed().await.unwrap();
        });
        assert_eq!(*items.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(stream.state(), WritableStreamState::Closed);
    }

    #[test]
    fn single_flight_writes_settle_in_submission_order() {
        let executor = Executor::new();
        let (stream, log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let spawn = spawner(&executor);
        for i in 0..3 {
            let write = writer.write(i);
            let order = order.clone();
            (spawn.clone())(platform::boxed(async move {
                write.await.unwrap();
                order.lock().push(i);
            }));
        }
        executor.run_until_stalled();
        assert_eq!(log.take(), vec!["write 0"]);
        for _ in 0..3 {
            open_gate(&executor, &gates, Ok(()));
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(log.take(), vec!["write 1", "write 2"]);
    }

    #[test]
    fn ready_tracks_backpressure() {
        let executor = Executor::new();
        let (stream, _log, gates) = gated(&executor, 2);
        let (_, writer) = stream.get_writer().unwrap();
        assert_eq!(writer.desired_size(), Some(2));
        executor.run_until(writer.ready()).unwrap();

        let _w1 = writer.write(1);
        let _w2 = writer.write(2);
        assert_eq!(writer.desired_size(), Some(0));
        let mut ready = writer.ready();
        executor.run_until_stalled();
        assert!((&mut ready).now_or_never().is_none());

        open_gate(&executor, &gates, Ok(()));
        assert_eq!(writer.desired_size(), Some(1));
        executor.run_until(ready).unwrap();
    }

    #[test]
    fn abort_waits_for_in_flight_write() {
        let executor = Executor::new();
        let (stream, log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let first = writer.write(1);
        let queued = writer.write(2);
        executor.run_until_stalled();

        let mut abort = writer.abort(Some("stop".into()));
        executor.run_until_stalled();
        assert!((&mut abort).now_or_never().is_none());
        assert_eq!(stream.state(), WritableStreamState::Erroring);
        assert_eq!(writer.desired_size(), None);

        open_gate(&executor, &gates, Ok(()));
        let (first, queued) = executor.run_until(join(first, queued));
        first.unwrap();
        assert_eq!(queued.unwrap_err().to_string(), "stop");
        executor.run_until(abort).unwrap();
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert_eq!(log.take(), vec!["write 1", "abort stop"]);
        assert_eq!(executor.run_until(writer.closed()).unwrap_err().to_string(), "stop");
    }

    #[test]
    fn earlier_failure_wins_over_abort_reason() {
        let executor = Executor::new();
        let (stream, log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let first = writer.write(1);
        executor.run_until_stalled();

        writer.inner.lock().error_if_needed("disk full".into());
        let abort = writer.abort(Some("late".into()));
        open_gate(&executor, &gates, Ok(()));
        executor.run_until(first).unwrap();
        assert_eq!(executor.run_until(abort).unwrap_err().to_string(), "disk full");
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert!(!log.take().iter().any(|e| e.starts_with("abort")));
    }

    #[test]
    fn failed_write_errors_stream_and_rejects_queue() {
        let executor = Executor::new();
        let (stream, _log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let first = writer.write(1);
        let second = writer.write(2);
        executor.run_until_stalled();
        open_gate(&executor, &gates, Err("io".into()));

        let (first, second) = executor.run_until(join(first, second));
        assert_eq!(first.unwrap_err().to_string(), "io");
        assert_eq!(second.unwrap_err().to_string(), "io");
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert_eq!(executor.run_until(writer.write(3)).unwrap_err().to_string(), "io");
        assert_eq!(executor.run_until(writer.ready()).unwrap_err().to_string(), "io");
    }

    #[test]
    fn close_waits_for_queue_and_blocks_further_writes() {
        let executor = Executor::new();
        let (stream, log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let write = writer.write(1);
        let close = writer.close();
        assert!(matches!(executor.run_until(writer.write(2)), Err(StreamError::Closing)));
        assert!(matches!(executor.run_until(writer.close()), Err(StreamError::Closing)));

        executor.run_until_stalled();
        open_gate(&executor, &gates, Ok(()));
        let (write, close) = executor.run_until(join(write, close));
        write.unwrap();
        close.unwrap();
        assert_eq!(log.take(), vec!["write 1", "close"]);
        assert!(matches!(executor.run_until(writer.write(3)), Err(StreamError::Closed)));
        // Aborting a closed stream is a no-op.
        executor.run_until(writer.abort(None)).unwrap();
    }

    #[test]
    fn size_function_failure_errors_stream() {
        struct Failing;
        impl QueuingStrategy<u32> for Failing {
            fn size(&self, _chunk: &u32) -> usize {
                1
            }

            fn try_size(&self, _chunk: &u32) -> StreamResult<usize> {
                Err("bad size".into())
            }

            fn high_water_mark(&self) -> usize {
                1
            }
        }

        let executor = Executor::new();
        let items = Arc::new(Mutex::new(Vec::new()));
        let stream = WritableStream::builder(CollectSink { items: items.clone() })
            .strategy(Failing)
            .spawn(spawner(&executor));
        executor.run_until_stalled();
        let (_, writer) = stream.get_writer().unwrap();
        assert_eq!(executor.run_until(writer.write(1)).unwrap_err().to_string(), "bad size");
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert!(items.lock().is_empty());
    }

    #[test]
    fn writer_lock_is_exclusive_and_release_rejects_signals() {
        let executor = Executor::new();
        let (stream, _log, _gates) = gated(&executor, 0);
        let (_, writer) = stream.get_writer().unwrap();
        assert!(stream.locked());
        assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));
        assert!(matches!(executor.run_until(stream.abort(None)), Err(StreamError::Locked)));
        assert!(matches!(executor.run_until(stream.close()), Err(StreamError::Locked)));

        let ready = writer.ready();
        let closed = writer.closed();
        let stream = writer.release_lock();
        assert!(matches!(executor.run_until(ready), Err(StreamError::Released)));
        assert!(matches!(executor.run_until(closed), Err(StreamError::Released)));
        assert!(!stream.locked());
        let (_, writer) = stream.get_writer().unwrap();
        assert_eq!(writer.desired_size(), Some(0));
    }

    #[test]
    fn release_rejects_writes_still_queued_by_that_writer() {
        let executor = Executor::new();
        let (stream, log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let first = writer.write(1);
        let second = writer.write(2);
        executor.run_until_stalled();
        assert_eq!(writer.desired_size(), Some(2));

        let stream = writer.release_lock();
        open_gate(&executor, &gates, Ok(()));
        let (first, second) = executor.run_until(join(first, second));
        first.unwrap();
        assert!(matches!(second, Err(StreamError::Released)));
        assert_eq!(log.take(), vec!["write 1"]);
        assert_eq!(stream.state(), WritableStreamState::Writable);

        let (_, writer) = stream.get_writer().unwrap();
        assert_eq!(writer.desired_size(), Some(4));
        let third = writer.write(3);
        executor.run_until_stalled();
        open_gate(&executor, &gates, Ok(()));
        executor.run_until(third).unwrap();
        assert_eq!(log.take(), vec!["write 3"]);
    }

    #[test]
    fn write_reports_closing_before_erroring() {
        let executor = Executor::new();
        let (stream, _log, gates) = gated(&executor, 4);
        let (_, writer) = stream.get_writer().unwrap();
        let first = writer.write(1);
        let close = writer.close();
        executor.run_until_stalled();

        writer.inner.lock().error_if_needed("late failure".into());
        assert_eq!(stream.state(), WritableStreamState::Erroring);
        assert!(matches!(executor.run_until(writer.write(2)), Err(StreamError::Closing)));

        open_gate(&executor, &gates, Ok(()));
        let (first, close) = executor.run_until(join(first, close));
        first.unwrap();
        assert_eq!(close.unwrap_err().to_string(), "late failure");
        assert_eq!(executor.run_until(writer.write(3)).unwrap_err().to_string(), "late failure");
    }

    #[test]
    fn sink_can_error_stream_through_controller() {
        struct SelfErroring;
        impl WritableSink<u32> for SelfErroring {
            async fn write(&mut self, chunk: u32, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
                if chunk == 0 {
                    controller.error("rejected zero".into());
                }
                Ok(())
            }
        }

        let executor = Executor::new();
        let stream = WritableStream::builder(SelfErroring).spawn(spawner(&executor));
        let (_, writer) = stream.get_writer().unwrap();
        executor.run_until(writer.write(0)).unwrap();
        assert_eq!(stream.state(), WritableStreamState::Errored);
        assert_eq!(executor.run_until(writer.closed()).unwrap_err().to_string(), "rejected zero");
    }

    #[test]
    fn abort_signal_reaches_sink() {
        struct Watching {
            seen: Arc<Mutex<Option<String>>>,
        }

        impl WritableSink<u32> for Watching {
            async fn write(&mut self, _chunk: u32, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
                let reason = controller.abort_future().await;
                *self.seen.lock() = Some(reason.to_string());
                Err(reason)
            }
        }

        let executor = Executor::new();
        let seen = Arc::new(Mutex::new(None));
        let stream = WritableStream::builder(Watching { seen: seen.clone() }).spawn(spawner(&executor));
        let (_, writer) = stream.get_writer().unwrap();
        let write = writer.write(1);
        executor.run_until_stalled();
        let abort = writer.abort(Some("cut".into()));
        let (write, abort) = executor.run_until(join(write, abort));
        assert_eq!(write.unwrap_err().to_string(), "cut");
        abort.unwrap();
        assert_eq!(seen.lock().as_deref(), Some("cut"));
    }

    #[test]
    fn futures_sink_interface() {
        let executor = Executor::new();
        let items = Arc::new(Mutex::new(Vec::new()));
        let stream = WritableStream::builder(CollectSink { items: items.clone() }).spawn(spawner(&executor));
        let (_, mut writer) = stream.get_writer().unwrap();
        executor.run_until(async {
            writer.send(7).await.unwrap();
            writer.feed(8).await.unwrap();
            writer.close().await.unwrap();
        });
        assert_eq!(*items.lock(), vec![7, 8]);
    }

    #[test]
    fn failing_start_errors_stream() {
        struct BadStart;
        impl WritableSink<u32> for BadStart {
            async fn start(&mut self, _c: &mut WritableStreamDefaultController) -> StreamResult<()> {
                Err("no start".into())
            }

            async fn write(&mut self, _chunk: u32, _c: &mut WritableStreamDefaultController) -> StreamResult<()> {
                unreachable!("writes must not reach a sink that failed to start")
            }
        }

        let executor = Executor::new();
        let stream = WritableStream::builder(BadStart).spawn(spawner(&executor));
        let (_, writer) = stream.get_writer().unwrap();
        let write = writer.write(1);
        assert_eq!(executor.run_until(write).unwrap_err().to_string(), "no start");
        assert_eq!(stream.state(), WritableStreamState::Errored);
    }
}
