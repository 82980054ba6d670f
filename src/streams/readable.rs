use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    Stream, StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    byte_controller::{ByteController, ByteView},
    chunked_queue::ChunkedQueue,
    error::{StreamError, StreamResult},
    reader::{ReadableStreamBYOBReadResult, ReadableStreamDefaultReader},
    signal::Signal,
    CountQueuingStrategy, DefaultStream, Locked, QueuingStrategy, StreamTypeMarker, Unlocked,
};
use crate::platform::{self, BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr, WeakPtr};

pub(crate) type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;
pub(crate) type ReadIntoRequest = oneshot::Sender<StreamResult<ReadableStreamBYOBReadResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Readable,
    Closed,
    Errored,
}

/// Requests the engine sends to the task that owns the underlying source.
pub(crate) enum SourceCommand {
    Pull,
    Cancel {
        reason: Option<StreamError>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
}

/// A completion that is already settled.
pub(crate) fn settled<V>(value: V) -> oneshot::Receiver<V> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(value);
    rx
}

// ----------- Reader bookkeeping -----------
pub(crate) enum ReaderRequests<T> {
    Default(VecDeque<ReadRequest<T>>),
    Byob(VecDeque<ReadIntoRequest>),
}

pub(crate) struct ReaderSlot<T> {
    pub(crate) id: u64,
    pub(crate) closed: Signal,
    pub(crate) requests: ReaderRequests<T>,
}

/// Stream-level state shared by both controller variants.
pub(crate) struct StreamCore<T> {
    pub(crate) state: StreamState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderSlot<T>>,
    source_tx: Option<UnboundedSender<SourceCommand>>,
    next_lock_id: u64,
}

impl<T> StreamCore<T> {
    fn new(source_tx: UnboundedSender<SourceCommand>) -> Self {
        Self {
            state: StreamState::Readable,
            stored_error: None,
            disturbed: false,
            reader: None,
            source_tx: Some(source_tx),
            next_lock_id: 0,
        }
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.state == StreamState::Readable
    }

    pub(crate) fn stored_error(&self) -> StreamError {
        self.stored_error.clone().unwrap_or(StreamError::Errored)
    }

    pub(crate) fn has_default_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderSlot {
                requests: ReaderRequests::Default(_),
                ..
            })
        )
    }

    pub(crate) fn has_byob_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderSlot {
                requests: ReaderRequests::Byob(_),
                ..
            })
        )
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Default(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Byob(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn add_read_request(&mut self, request: ReadRequest<T>) {
        if let Some(ReaderSlot {
            requests: ReaderRequests::Default(requests),
            ..
        }) = &mut self.reader
        {
            requests.push_back(request);
        }
    }

    pub(crate) fn add_read_into_request(&mut self, request: ReadIntoRequest) {
        if let Some(ReaderSlot {
            requests: ReaderRequests::Byob(requests),
            ..
        }) = &mut self.reader
        {
            requests.push_back(request);
        }
    }

    pub(crate) fn take_read_request(&mut self) -> Option<ReadRequest<T>> {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReaderRequests::Default(requests),
                ..
            }) => requests.pop_front(),
            _ => None,
        }
    }

    /// Settles the oldest read request; `None` signals done.
    pub(crate) fn fulfill_read_request(&mut self, chunk: Option<T>) {
        if let Some(ReaderSlot {
            requests: ReaderRequests::Default(requests),
            ..
        }) = &mut self.reader
        {
            if let Some(request) = requests.pop_front() {
                let _ = request.send(Ok(chunk));
            }
        }
    }

    pub(crate) fn fulfill_read_into_request(&mut self, view: ByteView, done: bool) {
        if let Some(ReaderSlot {
            requests: ReaderRequests::Byob(requests),
            ..
        }) = &mut self.reader
        {
            if let Some(request) = requests.pop_front() {
                let _ = request.send(Ok(ReadableStreamBYOBReadResult {
                    value: Some(view),
                    done,
                }));
            }
        }
    }

    pub(crate) fn close(&mut self) {
        debug_assert!(self.is_readable());
        debug!("readable stream closed");
        self.state = StreamState::Closed;
        if let Some(reader) = &mut self.reader {
            reader.closed.resolve();
            if let ReaderRequests::Default(requests) = &mut reader.requests {
                for request in requests.drain(..) {
                    let _ = request.send(Ok(None));
                }
            }
        }
    }

    pub(crate) fn error(&mut self, error: StreamError) {
        debug_assert!(self.is_readable());
        debug!(%error, "readable stream errored");
        self.state = StreamState::Errored;
        self.stored_error = Some(error.clone());
        if let Some(reader) = &mut self.reader {
            reader.closed.reject(error.clone());
            match &mut reader.requests {
                ReaderRequests::Default(requests) => {
                    for request in requests.drain(..) {
                        let _ = request.send(Err(error.clone()));
                    }
                }
                ReaderRequests::Byob(requests) => {
                    for request in requests.drain(..) {
                        let _ = request.send(Err(error.clone()));
                    }
                }
            }
        }
    }

    pub(crate) fn request_pull(&self) {
        trace!("dispatching pull");
        if let Some(tx) = &self.source_tx {
            let _ = tx.unbounded_send(SourceCommand::Pull);
        }
    }

    pub(crate) fn clear_algorithms(&mut self) {
        self.source_tx = None;
    }

    /// Runs the source's cancel algorithm and clears the algorithms.
    pub(crate) fn cancel_source(
        &mut self,
        reason: Option<StreamError>,
    ) -> oneshot::Receiver<StreamResult<()>> {
        let (completion, rx) = oneshot::channel();
        if let Some(tx) = self.source_tx.take() {
            let _ = tx.unbounded_send(SourceCommand::Cancel { reason, completion });
        }
        rx
    }

    fn acquire_reader(&mut self, byob: bool) -> StreamResult<(u64, Signal)> {
        if self.reader.is_some() {
            return Err(StreamError::Locked);
        }
        let id = self.next_lock_id;
        self.next_lock_id += 1;
        let closed = match self.state {
            StreamState::Readable => Signal::pending(),
            StreamState::Closed => Signal::resolved(),
            StreamState::Errored => Signal::rejected(self.stored_error()),
        };
        let requests = if byob {
            ReaderRequests::Byob(VecDeque::new())
        } else {
            ReaderRequests::Default(VecDeque::new())
        };
        self.reader = Some(ReaderSlot {
            id,
            closed: closed.clone(),
            requests,
        });
        Ok((id, closed))
    }
}

// ----------- Pull discipline -----------
/// `started`/`pulling`/`pullAgain` flags guaranteeing a single pull in flight.
#[derive(Debug, Default)]
pub(crate) struct PullFlags {
    pub(crate) started: bool,
    pulling: bool,
    pull_again: bool,
}

impl PullFlags {
    /// Returns `true` if a pull should be dispatched now; otherwise records
    /// that another pull is wanted once the outstanding one settles.
    pub(crate) fn begin(&mut self) -> bool {
        if self.pulling {
            self.pull_again = true;
            return false;
        }
        self.pulling = true;
        true
    }

    /// Marks the outstanding pull settled, returning whether it must rerun.
    pub(crate) fn settle(&mut self) -> bool {
        self.pulling = false;
        std::mem::take(&mut self.pull_again)
    }
}

// ----------- Default controller state -----------
pub(crate) struct DefaultController<T> {
    queue: ChunkedQueue<(T, usize)>,
    queue_total_size: usize,
    strategy: BoxedStrategy<T>,
    pub(crate) flags: PullFlags,
    close_requested: bool,
}

impl<T> DefaultController<T> {
    fn new(strategy: BoxedStrategy<T>) -> Self {
        Self {
            queue: ChunkedQueue::new(),
            queue_total_size: 0,
            strategy,
            flags: PullFlags::default(),
            close_requested: false,
        }
    }

    fn desired_size(&self, core: &StreamCore<T>) -> Option<isize> {
        match core.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0),
            StreamState::Readable => Some(super::desired_size(
                self.strategy.high_water_mark(),
                self.queue_total_size,
            )),
        }
    }

    pub(crate) fn can_close_or_enqueue(&self, core: &StreamCore<T>) -> bool {
        !self.close_requested && core.is_readable()
    }

    pub(crate) fn should_call_pull(&self, core: &StreamCore<T>) -> bool {
        if !self.can_close_or_enqueue(core) || !self.flags.started {
            return false;
        }
        if core.num_read_requests() > 0 {
            return true;
        }
        self.desired_size(core).is_some_and(|size| size > 0)
    }

    fn call_pull_if_needed(&mut self, core: &mut StreamCore<T>) {
        if self.should_call_pull(core) && self.flags.begin() {
            core.request_pull();
        }
    }

    fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total_size = 0;
    }

    fn enqueue(&mut self, core: &mut StreamCore<T>, chunk: T) -> StreamResult<()> {
        if !self.can_close_or_enqueue(core) {
            return Err(StreamError::InvalidState(
                "cannot enqueue after close was requested or the stream ended",
            ));
        }
        // Sized even when handed straight to a read, so a failing size
        // function errors the stream either way.
        let size = match self.strategy.try_size(&chunk) {
            Ok(size) => size,
            Err(error) => {
                self.error(core, error.clone());
                return Err(error);
            }
        };
        if core.num_read_requests() > 0 {
            core.fulfill_read_request(Some(chunk));
        } else {
            self.queue.push((chunk, size));
            self.queue_total_size += size;
        }
        self.call_pull_if_needed(core);
        Ok(())
    }

    fn close(&mut self, core: &mut StreamCore<T>) -> StreamResult<()> {
        if !self.can_close_or_enqueue(core) {
            return Err(StreamError::InvalidState(
                "cannot close a stream that is closing or not readable",
            ));
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            core.clear_algorithms();
            core.close();
        }
        Ok(())
    }

    fn error(&mut self, core: &mut StreamCore<T>, error: StreamError) {
        if !core.is_readable() {
            return;
        }
        self.reset_queue();
        core.clear_algorithms();
        core.error(error);
    }

    fn pull_steps(&mut self, core: &mut StreamCore<T>, request: ReadRequest<T>) {
        match self.queue.shift() {
            Some((chunk, size)) => {
                debug_assert!(self.queue_total_size >= size);
                self.queue_total_size -= size;
                if self.close_requested && self.queue.is_empty() {
                    core.clear_algorithms();
                    core.close();
                } else {
                    self.call_pull_if_needed(core);
                }
                let _ = request.send(Ok(Some(chunk)));
            }
            None => {
                core.add_read_request(request);
                self.call_pull_if_needed(core);
            }
        }
    }
}

pub(crate) enum ReadableController<T> {
    Default(DefaultController<T>),
    Byte(ByteController<T>),
}

/// Shared state behind every handle of one readable stream.
pub(crate) struct ReadableStreamInner<T> {
    pub(crate) core: StreamCore<T>,
    pub(crate) controller: ReadableController<T>,
}

impl<T> ReadableStreamInner<T> {
    pub(crate) fn new(controller: ReadableController<T>, source_tx: UnboundedSender<SourceCommand>) -> Self {
        Self {
            core: StreamCore::new(source_tx),
            controller,
        }
    }

    pub(crate) fn desired_size(&self) -> Option<isize> {
        match &self.controller {
            ReadableController::Default(c) => c.desired_size(&self.core),
            ReadableController::Byte(c) => c.desired_size(&self.core),
        }
    }

    pub(crate) fn enqueue(&mut self, chunk: T) -> StreamResult<()> {
        match &mut self.controller {
            ReadableController::Default(c) => c.enqueue(&mut self.core, chunk),
            ReadableController::Byte(_) => Err(StreamError::InvalidState(
                "byte streams are fed through their byte controller",
            )),
        }
    }

    pub(crate) fn close(&mut self) -> StreamResult<()> {
        match &mut self.controller {
            ReadableController::Default(c) => c.close(&mut self.core),
            ReadableController::Byte(c) => c.close(&mut self.core),
        }
    }

    pub(crate) fn error(&mut self, error: StreamError) {
        match &mut self.controller {
            ReadableController::Default(c) => c.error(&mut self.core, error),
            ReadableController::Byte(c) => c.error(&mut self.core, error),
        }
    }

    /// `true` while the default controller would accept `enqueue`.
    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        match &self.controller {
            ReadableController::Default(c) => c.can_close_or_enqueue(&self.core),
            ReadableController::Byte(_) => self.core.is_readable(),
        }
    }

    /// `true` while the controller is not asking for more data.
    pub(crate) fn has_backpressure(&self) -> bool {
        match &self.controller {
            ReadableController::Default(c) => !c.should_call_pull(&self.core),
            ReadableController::Byte(c) => !c.should_call_pull(&self.core),
        }
    }

    fn flags(&mut self) -> &mut PullFlags {
        match &mut self.controller {
            ReadableController::Default(c) => &mut c.flags,
            ReadableController::Byte(c) => &mut c.flags,
        }
    }

    pub(crate) fn call_pull_if_needed(&mut self) {
        match &mut self.controller {
            ReadableController::Default(c) => c.call_pull_if_needed(&mut self.core),
            ReadableController::Byte(c) => c.call_pull_if_needed(&mut self.core),
        }
    }

    pub(crate) fn on_start_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.flags().started = true;
                self.call_pull_if_needed();
            }
            Err(error) => self.error(error),
        }
    }

    pub(crate) fn on_pull_settled(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                if self.flags().settle() {
                    self.call_pull_if_needed();
                }
            }
            Err(error) => self.error(error),
        }
    }

    pub(crate) fn read(&mut self, lock_id: u64, request: ReadRequest<T>) {
        if !self.holds_lock(lock_id) {
            let _ = request.send(Err(StreamError::Released));
            return;
        }
        self.core.disturbed = true;
        match self.core.state {
            StreamState::Closed => {
                let _ = request.send(Ok(None));
            }
            StreamState::Errored => {
                let _ = request.send(Err(self.core.stored_error()));
            }
            StreamState::Readable => match &mut self.controller {
                ReadableController::Default(c) => c.pull_steps(&mut self.core, request),
                ReadableController::Byte(c) => c.pull_steps(&mut self.core, request),
            },
        }
    }

    pub(crate) fn cancel(&mut self, reason: Option<StreamError>) -> oneshot::Receiver<StreamResult<()>> {
        self.core.disturbed = true;
        match self.core.state {
            StreamState::Closed => return settled(Ok(())),
            StreamState::Errored => return settled(Err(self.core.stored_error())),
            StreamState::Readable => {}
        }
        debug!("canceling readable stream");
        self.core.close();
        if let Some(ReaderSlot {
            requests: ReaderRequests::Byob(requests),
            ..
        }) = &mut self.core.reader
        {
            for request in requests.drain(..) {
                let _ = request.send(Ok(ReadableStreamBYOBReadResult {
                    value: None,
                    done: true,
                }));
            }
        }
        match &mut self.controller {
            ReadableController::Default(c) => {
                c.reset_queue();
                self.core.cancel_source(reason)
            }
            ReadableController::Byte(c) => c.cancel_steps(&mut self.core, reason),
        }
    }

    pub(crate) fn holds_lock(&self, lock_id: u64) -> bool {
        self.core.reader.as_ref().is_some_and(|r| r.id == lock_id)
    }

    pub(crate) fn acquire_reader(&mut self, byob: bool) -> StreamResult<(u64, Signal)> {
        if byob && !matches!(self.controller, ReadableController::Byte(_)) {
            return Err(StreamError::InvalidArgument(
                "zero-copy readers require a byte stream",
            ));
        }
        self.core.acquire_reader(byob)
    }

    /// The lock's `closed` signal, or a rejected one for a stale lock.
    pub(crate) fn reader_closed(&self, lock_id: u64) -> Signal {
        match &self.core.reader {
            Some(reader) if reader.id == lock_id => reader.closed.clone(),
            _ => Signal::rejected(StreamError::Released),
        }
    }

    pub(crate) fn release_reader(&mut self, lock_id: u64) {
        if !self.holds_lock(lock_id) {
            return;
        }
        let Some(reader) = self.core.reader.take() else {
            return;
        };
        reader.closed.reject(StreamError::Released);
        if let ReadableController::Byte(c) = &mut self.controller {
            c.release_steps();
        }
        match reader.requests {
            ReaderRequests::Default(requests) => {
                for request in requests {
                    let _ = request.send(Err(StreamError::Released));
                }
            }
            ReaderRequests::Byob(requests) => {
                for request in requests {
                    let _ = request.send(Err(StreamError::Released));
                }
            }
        }
    }
}

// ----------- Source contract -----------
/// Producer of values for a readable stream.
///
/// Every method has a no-op default except `pull`; a source that pushes data
/// on its own can simply return `Ok(())` from `pull`.
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

/// Handle given to a [`ReadableSource`] to feed its stream.
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    inner: WeakPtr<Mutex<ReadableStreamInner<T>>>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(inner: WeakPtr<Mutex<ReadableStreamInner<T>>>) -> Self {
        Self { inner }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut ReadableStreamInner<T>) -> R) -> StreamResult<R> {
        let inner = self.inner.upgrade().ok_or(StreamError::TaskDropped)?;
        let mut guard = inner.lock();
        Ok(f(&mut guard))
    }

    /// `None` once errored, `0` once closed, otherwise the buffering headroom.
    pub fn desired_size(&self) -> Option<isize> {
        self.with_inner(|inner| inner.desired_size()).ok().flatten()
    }

    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.with_inner(|inner| inner.enqueue(chunk))?
    }

    pub fn close(&self) -> StreamResult<()> {
        self.with_inner(|inner| inner.close())?
    }

    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.with_inner(|inner| inner.error(error))
    }

    pub(crate) fn settle_start(&self, result: StreamResult<()>) {
        let _ = self.with_inner(|inner| inner.on_start_settled(result));
    }

    pub(crate) fn settle_pull(&self, result: StreamResult<()>) {
        let _ = self.with_inner(|inner| inner.on_pull_settled(result));
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.with_inner(|inner| inner.can_close_or_enqueue())
            .unwrap_or(false)
    }

    pub(crate) fn has_backpressure(&self) -> bool {
        self.with_inner(|inner| inner.has_backpressure())
            .unwrap_or(true)
    }

    pub(crate) fn state(&self) -> Option<(StreamState, Option<StreamError>)> {
        self.with_inner(|inner| (inner.core.state, inner.core.stored_error.clone()))
            .ok()
    }
}

// ----------- Source task -----------
async fn readable_stream_task<T, Source>(
    mut source: Source,
    mut controller: ReadableStreamDefaultController<T>,
    mut commands: UnboundedReceiver<SourceCommand>,
) where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    let started = source.start(&mut controller).await;
    controller.settle_start(started);

    while let Some(command) = commands.next().await {
        match command {
            SourceCommand::Pull => {
                let result = source.pull(&mut controller).await;
                controller.settle_pull(result);
            }
            SourceCommand::Cancel { reason, completion } => {
                let result = source.cancel(reason).await;
                let _ = completion.send(result);
            }
        }
    }
    trace!("readable source task finished");
}

// ----------- ReadableStream -----------
pub struct ReadableStream<T: MaybeSend + 'static, StreamType = DefaultStream, LockState = Unlocked> {
    pub(crate) inner: SharedPtr<Mutex<ReadableStreamInner<T>>>,
    _phantom: PhantomData<fn() -> (StreamType, LockState)>,
}

impl<T: MaybeSend + 'static, S, L> ReadableStream<T, S, L> {
    pub(crate) fn from_inner(inner: SharedPtr<Mutex<ReadableStreamInner<T>>>) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().core.reader.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().core.state
    }
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> ReadableStream<T, S, Unlocked> {
    /// Locks the stream to a new default reader.
    pub fn get_reader(
        &self,
    ) -> StreamResult<(ReadableStream<T, S, Locked>, ReadableStreamDefaultReader<T, S>)> {
        let reader = ReadableStreamDefaultReader::acquire(self.inner.clone())?;
        Ok((ReadableStream::from_inner(self.inner.clone()), reader))
    }

    /// Cancels the stream. Fails with [`StreamError::Locked`] while a reader
    /// holds the lock.
    pub fn cancel(&self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.core.reader.is_some() {
                settled(Err(StreamError::Locked))
            } else {
                inner.cancel(reason)
            }
        };
        async move { rx.await.unwrap_or(Ok(())) }
    }

    /// Async iteration over the remaining chunks.
    pub fn values(
        &self,
        options: ReadableStreamIteratorOptions,
    ) -> StreamResult<ReadableStreamAsyncIterator<T, S>> {
        let (_, reader) = self.get_reader()?;
        Ok(ReadableStreamAsyncIterator {
            reader: Some(reader),
            pending: None,
            prevent_cancel: options.prevent_cancel,
        })
    }
}

impl<T: MaybeSend + 'static> ReadableStream<T, DefaultStream, Unlocked> {
    /// Returns a builder for a readable stream over `source`.
    pub fn builder<Source>(source: Source) -> ReadableStreamBuilder<T, Source, DefaultStream>
    where
        Source: ReadableSource<T>,
    {
        ReadableStreamBuilder::new(source)
    }

    pub fn from_vec(items: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>, DefaultStream> {
        Self::builder(IteratorSource::new(items.into_iter()))
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>, DefaultStream>
    where
        I: Iterator<Item = T> + MaybeSend + 'static,
    {
        Self::builder(IteratorSource::new(iter))
    }

    pub fn from_stream<St>(stream: St) -> ReadableStreamBuilder<T, AsyncStreamSource<St>, DefaultStream>
    where
        St: Stream<Item = T> + Unpin + MaybeSend + 'static,
    {
        Self::builder(AsyncStreamSource::new(stream))
    }
}

// ----------- Builder -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source, StreamType = DefaultStream> {
    pub(crate) source: Source,
    pub(crate) strategy: BoxedStrategy<T>,
    pub(crate) high_water_mark: usize,
    pub(crate) auto_allocate_chunk_size: Option<std::num::NonZeroUsize>,
    _phantom: PhantomData<fn() -> StreamType>,
}

impl<T: MaybeSend + 'static, Source, S> ReadableStreamBuilder<T, Source, S> {
    pub(crate) fn with_parts(source: Source, strategy: BoxedStrategy<T>, high_water_mark: usize) -> Self {
        Self {
            source,
            strategy,
            high_water_mark,
            auto_allocate_chunk_size: None,
            _phantom: PhantomData,
        }
    }
}

impl<T: MaybeSend + 'static, Source> ReadableStreamBuilder<T, Source, DefaultStream>
where
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self::with_parts(source, Box::new(CountQueuingStrategy::new(1)), 1)
    }

    pub fn strategy<Q>(mut self, strategy: Q) -> Self
    where
        Q: QueuingStrategy<T> + MaybeSend + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (ReadableStream<T, DefaultStream, Unlocked>, PlatformFuture<'static, ()>) {
        let (tx, rx) = mpsc::unbounded();
        let controller = ReadableController::Default(DefaultController::new(self.strategy));
        let inner = SharedPtr::new(Mutex::new(ReadableStreamInner::new(controller, tx)));
        let controller = ReadableStreamDefaultController::new(SharedPtr::downgrade(&inner));
        let fut = readable_stream_task(self.source, controller, rx);
        (ReadableStream::from_inner(inner), platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, DefaultStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}

// ----------- Built-in sources -----------
pub struct IteratorSource<I> {
    iter: I,
}

impl<I> IteratorSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    T: MaybeSend + 'static,
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

pub struct AsyncStreamSource<S> {
    stream: S,
}

impl<S> AsyncStreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    T: MaybeSend + 'static,
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        }
    }
}

// ----------- Async iteration -----------
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadableStreamIteratorOptions {
    pub prevent_cancel: bool,
}

/// `futures::Stream` view of a readable stream, holding its reader lock.
///
/// Reaching the end releases the lock. Dropping the iterator early cancels the
/// stream unless `prevent_cancel` was set.
pub struct ReadableStreamAsyncIterator<T: MaybeSend + 'static, S: StreamTypeMarker = DefaultStream> {
    reader: Option<ReadableStreamDefaultReader<T, S>>,
    pending: Option<oneshot::Receiver<StreamResult<Option<T>>>>,
    prevent_cancel: bool,
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> Stream for ReadableStreamAsyncIterator<T, S> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_ref() else {
            return Poll::Ready(None);
        };
        let pending = this.pending.get_or_insert_with(|| reader.start_read());
        let outcome = match Pin::new(pending).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome.unwrap_or(Err(StreamError::TaskDropped)),
        };
        this.pending = None;
        match outcome {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                this.reader = None;
                Poll::Ready(None)
            }
            Err(error) => {
                this.reader = None;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> Drop for ReadableStreamAsyncIterator<T, S> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            if !self.prevent_cancel {
                drop(reader.start_cancel(None));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_util::{spawner, Executor};
    use futures::future::join;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct CountingSource {
        pulls: Arc<AtomicUsize>,
        limit: usize,
    }

    impl ReadableSource<usize> for CountingSource {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<usize>) -> StreamResult<()> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst);
            if n < self.limit {
                controller.enqueue(n)
            } else {
                controller.close()
            }
        }
    }

    /// Source that never produces on its own; tests push through the controller.
    struct ManualSource {
        controller: Arc<Mutex<Option<ReadableStreamDefaultController<u32>>>>,
        pulls: Arc<AtomicUsize>,
    }

    impl ReadableSource<u32> for ManualSource {
        async fn start(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            *self.controller.lock() = Some(controller.clone());
            Ok(())
        }

        async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manual_stream(
        executor: &Executor,
        hwm: usize,
    ) -> (
        ReadableStream<u32>,
        ReadableStreamDefaultController<u32>,
        Arc<AtomicUsize>,
    ) {
        let slot = Arc::new(Mutex::new(None));
        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::builder(ManualSource {
            controller: slot.clone(),
            pulls: pulls.clone(),
        })
        .strategy(CountQueuingStrategy::new(hwm))
        .spawn(spawner(executor));
        executor.run_until_stalled();
        let controller = slot.lock().clone().expect("source started");
        (stream, controller, pulls)
    }

    #[test]
    fn reads_values_in_order_then_done() {
        let executor = Executor::new();
        let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(spawner(&executor));
        let (_, reader) = stream.get_reader().unwrap();

        executor.run_until(async move {
            assert_eq!(reader.read().await.unwrap(), Some(1));
            assert_eq!(reader.read().await.unwrap(), Some(2));
            assert_eq!(reader.read().await.unwrap(), Some(3));
            assert_eq!(reader.read().await.unwrap(), None);
            assert_eq!(reader.read().await.unwrap(), None);
            reader.closed().await.unwrap();
        });
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn desired_size_tracks_queue_and_state() {
        let executor = Executor::new();
        let (stream, controller, _) = manual_stream(&executor, 3);

        assert_eq!(controller.desired_size(), Some(3));
        controller.enqueue(1).unwrap();
        controller.enqueue(2).unwrap();
        assert_eq!(controller.desired_size(), Some(1));
        controller.enqueue(3).unwrap();
        controller.enqueue(4).unwrap();
        assert_eq!(controller.desired_size(), Some(-1));

        controller.close().unwrap();
        // Close is pending until the queue drains.
        assert_eq!(stream.state(), StreamState::Readable);
        let (_, reader) = stream.get_reader().unwrap();
        executor.run_until(async {
            for expected in 1..=4 {
                assert_eq!(reader.read().await.unwrap(), Some(expected));
            }
        });
        assert_eq!(controller.desired_size(), Some(0));

        let (stream, controller, _) = manual_stream(&executor, 1);
        controller.error("boom".into()).unwrap();
        assert_eq!(controller.desired_size(), None);
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[test]
    fn enqueue_with_pending_read_bypasses_queue() {
        let executor = Executor::new();
        let (stream, controller, _) = manual_stream(&executor, 0);
        let (_, reader) = stream.get_reader().unwrap();

        let read = reader.read();
        controller.enqueue(42).unwrap();
        assert_eq!(controller.desired_size(), Some(0));
        let value = executor.run_until(read).unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(controller.desired_size(), Some(0));
    }

    #[test]
    fn enqueue_after_close_is_rejected() {
        let executor = Executor::new();
        let (_stream, controller, _) = manual_stream(&executor, 1);
        controller.enqueue(1).unwrap();
        controller.close().unwrap();
        assert!(matches!(controller.enqueue(2), Err(StreamError::InvalidState(_))));
        assert!(matches!(controller.close(), Err(StreamError::InvalidState(_))));
    }

    #[test]
    fn pull_is_single_flight() {
        struct SlowSource {
            active: Arc<AtomicUsize>,
            max_active: Arc<AtomicUsize>,
            gate: Option<oneshot::Receiver<()>>,
            produced: u32,
        }

        impl ReadableSource<u32> for SlowSource {
            async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                if let Some(gate) = self.gate.take() {
                    let _ = gate.await;
                }
                self.produced += 1;
                let result = controller.enqueue(self.produced);
                self.active.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }

        let executor = Executor::new();
        let (open, gate) = oneshot::channel();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::builder(SlowSource {
            active,
            max_active: max_active.clone(),
            gate: Some(gate),
            produced: 0,
        })
        .strategy(CountQueuingStrategy::new(0))
        .spawn(spawner(&executor));
        let (_, reader) = stream.get_reader().unwrap();

        let reads = futures::future::join3(reader.read(), reader.read(), reader.read());
        executor.run_until_stalled();
        open.send(()).unwrap();
        let (a, b, c) = executor.run_until(reads);
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (Some(1), Some(2), Some(3)));
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pull_fills_up_to_high_water_mark() {
        let executor = Executor::new();
        let pulls = Arc::new(AtomicUsize::new(0));
        let stream = ReadableStream::builder(CountingSource {
            pulls: pulls.clone(),
            limit: 100,
        })
        .strategy(CountQueuingStrategy::new(4))
        .spawn(spawner(&executor));
        executor.run_until_stalled();
        assert_eq!(pulls.load(Ordering::SeqCst), 4);

        let (_, reader) = stream.get_reader().unwrap();
        assert_eq!(executor.run_until(reader.read()).unwrap(), Some(0));
        executor.run_until_stalled();
        assert_eq!(pulls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn error_rejects_pending_reads_and_closed() {
        let executor = Executor::new();
        let (stream, controller, _) = manual_stream(&executor, 1);
        let (_, reader) = stream.get_reader().unwrap();
        let read = reader.read();
        let closed = reader.closed();
        controller.error("broken".into()).unwrap();

        let (read, closed) = executor.run_until(join(read, closed));
        assert_eq!(read.unwrap_err().to_string(), "broken");
        assert_eq!(closed.unwrap_err().to_string(), "broken");
        assert_eq!(executor.run_until(reader.read()).unwrap_err().to_string(), "broken");
    }

    #[test]
    fn cancel_runs_source_cancel_and_resolves_reads() {
        struct CancelSource {
            reason: Arc<Mutex<Option<String>>>,
        }

        impl ReadableSource<u8> for CancelSource {
            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController<u8>) -> StreamResult<()> {
                Ok(())
            }

            async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
                *self.reason.lock() = reason.map(|r| r.to_string());
                Ok(())
            }
        }

        let executor = Executor::new();
        let reason = Arc::new(Mutex::new(None));
        let stream = ReadableStream::builder(CancelSource {
            reason: reason.clone(),
        })
        .spawn(spawner(&executor));
        let (_, reader) = stream.get_reader().unwrap();
        let read = reader.read();
        let cancel = reader.cancel(Some("done here".into()));

        let (read, cancel) = executor.run_until(join(read, cancel));
        assert_eq!(read.unwrap(), None);
        cancel.unwrap();
        assert_eq!(reason.lock().as_deref(), Some("done here"));
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn cancel_failure_is_reported_to_caller() {
        struct FailingCancel;

        impl ReadableSource<u8> for FailingCancel {
            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController<u8>) -> StreamResult<()> {
                Ok(())
            }

            async fn cancel(&mut self, _reason: Option<StreamError>) -> StreamResult<()> {
                Err("cannot cancel".into())
            }
        }

        let executor = Executor::new();
        let stream = ReadableStream::builder(FailingCancel).spawn(spawner(&executor));
        let result = executor.run_until(stream.cancel(None));
        assert_eq!(result.unwrap_err().to_string(), "cannot cancel");
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn second_reader_is_rejected_until_release() {
        let executor = Executor::new();
        let stream = ReadableStream::from_vec(vec![1, 2]).spawn(spawner(&executor));
        let (_locked, reader) = stream.get_reader().unwrap();
        assert!(stream.locked());
        assert!(matches!(stream.get_reader(), Err(StreamError::Locked)));
        assert!(matches!(
            executor.run_until(stream.cancel(None)),
            Err(StreamError::Locked)
        ));

        assert_eq!(executor.run_until(reader.read()).unwrap(), Some(1));
        let stream = reader.release_lock();
        assert!(!stream.locked());
        let (_, reader) = stream.get_reader().unwrap();
        assert_eq!(executor.run_until(reader.read()).unwrap(), Some(2));
    }

    #[test]
    fn release_rejects_pending_reads_and_closed() {
        let executor = Executor::new();
        let (stream, _controller, _) = manual_stream(&executor, 0);
        let (_, reader) = stream.get_reader().unwrap();
        let read = reader.read();
        let closed = reader.closed();
        drop(reader);

        let (read, closed) = executor.run_until(join(read, closed));
        assert!(matches!(read, Err(StreamError::Released)));
        assert!(matches!(closed, Err(StreamError::Released)));
        assert!(!stream.locked());
    }

    #[test]
    fn size_function_runs_for_chunks_handed_to_a_pending_read() {
        struct RejectAll;

        impl QueuingStrategy<u32> for RejectAll {
            fn size(&self, _chunk: &u32) -> usize {
                1
            }

            fn try_size(&self, _chunk: &u32) -> StreamResult<usize> {
                Err("unsized".into())
            }

            fn high_water_mark(&self) -> usize {
                0
            }
        }

        let executor = Executor::new();
        let slot = Arc::new(Mutex::new(None));
        let stream = ReadableStream::builder(ManualSource {
            controller: slot.clone(),
            pulls: Arc::new(AtomicUsize::new(0)),
        })
        .strategy(RejectAll)
        .spawn(spawner(&executor));
        executor.run_until_stalled();
        let controller = slot.lock().clone().expect("source started");

        let (_, reader) = stream.get_reader().unwrap();
        let read = reader.read();
        assert_eq!(controller.enqueue(5).unwrap_err().to_string(), "unsized");
        assert_eq!(executor.run_until(read).unwrap_err().to_string(), "unsized");
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[test]
    fn size_function_errors_the_stream() {
        struct Picky;

        impl QueuingStrategy<u32> for Picky {
            fn size(&self, _chunk: &u32) -> usize {
                1
            }

            fn try_size(&self, chunk: &u32) -> StreamResult<usize> {
                if *chunk == 13 {
                    Err("unlucky".into())
                } else {
                    Ok(1)
                }
            }

            fn high_water_mark(&self) -> usize {
                8
            }
        }

        struct Pushing;
        impl ReadableSource<u32> for Pushing {
            async fn start(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
                controller.enqueue(1)?;
                assert!(controller.enqueue(13).is_err());
                Ok(())
            }

            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
                Ok(())
            }
        }

        let executor = Executor::new();
        let stream = ReadableStream::builder(Pushing)
            .strategy(Picky)
            .spawn(spawner(&executor));
        executor.run_until_stalled();
        assert_eq!(stream.state(), StreamState::Errored);
        let (_, reader) = stream.get_reader().unwrap();
        assert_eq!(executor.run_until(reader.read()).unwrap_err().to_string(), "unlucky");
    }

    #[test]
    fn start_failure_errors_the_stream() {
        struct BadStart;
        impl ReadableSource<u8> for BadStart {
            async fn start(&mut self, _c: &mut ReadableStreamDefaultController<u8>) -> StreamResult<()> {
                Err("no start".into())
            }

            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController<u8>) -> StreamResult<()> {
                unreachable!("pull must not run after a failed start")
            }
        }

        let executor = Executor::new();
        let stream = ReadableStream::builder(BadStart).spawn(spawner(&executor));
        executor.run_until_stalled();
        assert_eq!(stream.state(), StreamState::Errored);
    }

    #[test]
    fn values_iterates_and_releases() {
        let executor = Executor::new();
        let stream = ReadableStream::from_iterator(0..5u8).spawn(spawner(&executor));
        let items: Vec<u8> = executor.run_until(async {
            stream
                .values(Default::default())
                .unwrap()
                .map(|item| item.unwrap())
                .collect()
                .await
        });
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert!(!stream.locked());
    }

    #[test]
    fn dropping_iterator_early_cancels_unless_prevented() {
        let executor = Executor::new();
        let stream = ReadableStream::from_iterator(0..100u32).spawn(spawner(&executor));
        executor.run_until(async {
            let mut values = stream.values(Default::default()).unwrap();
            assert_eq!(values.next().await.unwrap().unwrap(), 0);
        });
        executor.run_until_stalled();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.locked());

        let stream = ReadableStream::from_iterator(0..100u32).spawn(spawner(&executor));
        executor.run_until(async {
            let mut values = stream
                .values(ReadableStreamIteratorOptions {
                    prevent_cancel: true,
                })
                .unwrap();
            assert_eq!(values.next().await.unwrap().unwrap(), 0);
        });
        assert_eq!(stream.state(), StreamState::Readable);
        let (_, reader) = stream.get_reader().unwrap();
        assert_eq!(executor.run_until(reader.read()).unwrap(), Some(1));
    }

    #[test]
    fn from_stream_adapts_futures_streams() {
        let executor = Executor::new();
        let stream =
            ReadableStream::from_stream(futures::stream::iter(vec!["a", "b"])).spawn(spawner(&executor));
        let (_, reader) = stream.get_reader().unwrap();
        executor.run_until(async move {
            assert_eq!(reader.read().await.unwrap(), Some("a"));
            assert_eq!(reader.read().await.unwrap(), Some("b"));
            assert_eq!(reader.read().await.unwrap(), None);
        });
    }
}
