//! Forking one readable stream into two branches.
//!
//! A single coordinator task owns the reader on the source and performs one
//! read at a time on behalf of whichever branch asked first; branches that
//! pull while that read is outstanding only leave a "read again" mark.
//! The source is canceled once both branches have been canceled, with a
//! [`StreamError::TeeCanceled`] reason carrying both branch reasons.

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    future::{self, Either},
    StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    byte_controller::{ByteView, ReadableByteStreamController, ReadableStreamBYOBRequest},
    byte_source_trait::ReadableByteSource,
    error::{StreamError, StreamResult},
    readable::{ReadableSource, ReadableStream, ReadableStreamBuilder, ReadableStreamDefaultController},
    reader::{ReadableStreamBYOBReader, ReadableStreamDefaultReader},
    signal::{Signal, SignalFuture},
    ByteStream, CountQueuingStrategy, DefaultStream, QueuingStrategy, Unlocked,
};
use crate::platform::{self, BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    One,
    Two,
}

impl Branch {
    const BOTH: [Branch; 2] = [Branch::One, Branch::Two];

    fn index(self) -> usize {
        match self {
            Branch::One => 0,
            Branch::Two => 1,
        }
    }

    fn other(self) -> Branch {
        match self {
            Branch::One => Branch::Two,
            Branch::Two => Branch::One,
        }
    }
}

/// Cancellation bookkeeping shared by both kinds of tee.
struct CancelState {
    canceled: [bool; 2],
    reasons: [Option<StreamError>; 2],
    /// Settles with the outcome of canceling the source.
    done: Signal,
}

impl CancelState {
    fn new() -> Self {
        Self {
            canceled: [false; 2],
            reasons: [None, None],
            done: Signal::pending(),
        }
    }

    fn is_canceled(&self, branch: Branch) -> bool {
        self.canceled[branch.index()]
    }

    fn both_canceled(&self) -> bool {
        self.canceled.iter().all(|c| *c)
    }

    /// Records a branch cancel; returns the composite reason once both
    /// branches are canceled.
    fn cancel(&mut self, branch: Branch, reason: Option<StreamError>) -> Option<StreamError> {
        self.canceled[branch.index()] = true;
        self.reasons[branch.index()] = reason;
        if !self.is_canceled(branch.other()) {
            return None;
        }
        let [first, second] = std::mem::take(&mut self.reasons);
        Some(StreamError::tee_canceled(first, second))
    }

    /// The source finished on its own: pending branch cancels succeed.
    fn source_finished(&self) {
        if !self.both_canceled() {
            self.done.resolve();
        }
    }
}

/// Waits for a branch cancel to be settled by the source.
async fn settle_cancel(
    done: Signal,
    source_cancel: Option<futures::channel::oneshot::Receiver<StreamResult<()>>>,
) -> StreamResult<()> {
    if let Some(rx) = source_cancel {
        debug!("both tee branches canceled, canceling source");
        match rx.await.unwrap_or(Ok(())) {
            Ok(()) => done.resolve(),
            Err(error) => done.reject(error),
        };
    }
    done.wait().await
}

// ----------- Value tee -----------
struct TeeState<T: MaybeSend + 'static> {
    reader: ReadableStreamDefaultReader<T, DefaultStream>,
    branches: [Option<ReadableStreamDefaultController<T>>; 2],
    reading: bool,
    read_again: bool,
    cancel: CancelState,
}

impl<T: MaybeSend + Clone + 'static> TeeState<T> {
    fn branch(&self, branch: Branch) -> Option<&ReadableStreamDefaultController<T>> {
        if self.cancel.is_canceled(branch) {
            return None;
        }
        self.branches[branch.index()].as_ref()
    }

    /// Delivers one read result; returns `true` when another read is owed.
    fn on_read(&mut self, result: StreamResult<Option<T>>) -> bool {
        self.reading = false;
        match result {
            Ok(Some(chunk)) => {
                if let Some(controller) = self.branch(Branch::One) {
                    let _ = controller.enqueue(chunk.clone());
                }
                if let Some(controller) = self.branch(Branch::Two) {
                    let _ = controller.enqueue(chunk);
                }
                if std::mem::take(&mut self.read_again) {
                    self.reading = true;
                    return true;
                }
            }
            Ok(None) => {
                for branch in Branch::BOTH {
                    if let Some(controller) = self.branch(branch) {
                        let _ = controller.close();
                    }
                }
                self.cancel.source_finished();
            }
            Err(error) => self.on_source_error(error),
        }
        false
    }

    fn on_source_error(&mut self, error: StreamError) {
        for controller in self.branches.iter().flatten() {
            let _ = controller.error(error.clone());
        }
        self.cancel.source_finished();
    }
}

struct TeeBranchSource<T: MaybeSend + 'static> {
    state: SharedPtr<Mutex<TeeState<T>>>,
    pulls: UnboundedSender<()>,
    branch: Branch,
}

impl<T: MaybeSend + Clone + 'static> ReadableSource<T> for TeeBranchSource<T> {
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<T>) -> StreamResult<()> {
        let mut state = self.state.lock();
        if state.reading {
            state.read_again = true;
            return Ok(());
        }
        state.reading = true;
        drop(state);
        let _ = self.pulls.unbounded_send(());
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let (done, source_cancel) = {
            let mut state = self.state.lock();
            let composite = state.cancel.cancel(self.branch, reason);
            let source_cancel = composite.map(|reason| state.reader.start_cancel(Some(reason)));
            (state.cancel.done.clone(), source_cancel)
        };
        settle_cancel(done, source_cancel).await
    }
}

async fn tee_coordinator<T: MaybeSend + Clone + 'static>(
    state: SharedPtr<Mutex<TeeState<T>>>,
    mut pulls: UnboundedReceiver<()>,
) {
    while pulls.next().await.is_some() {
        loop {
            let rx = state.lock().reader.start_read();
            let result = rx.await.unwrap_or(Err(StreamError::TaskDropped));
            if !state.lock().on_read(result) {
                break;
            }
        }
    }
    trace!("tee coordinator finished");
}

/// Forwards a source error that happens while no read is outstanding.
async fn forward_source_error(closed: SignalFuture, on_error: impl FnOnce(StreamError)) {
    if let Err(error) = closed.await {
        on_error(error);
    }
    future::pending::<()>().await
}

/// Configures the two branches of a value tee.
pub struct TeeBuilder<T: MaybeSend + 'static> {
    reader: ReadableStreamDefaultReader<T, DefaultStream>,
    strategies: [BoxedStrategy<T>; 2],
}

impl<T: MaybeSend + Clone + 'static> TeeBuilder<T> {
    pub fn branch1_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.strategies[0] = Box::new(strategy);
        self
    }

    pub fn branch2_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.strategies[1] = Box::new(strategy);
        self
    }

    /// Return both branches + driver future without spawning
    ///
    /// The future drives both branches and the coordinator.
    #[allow(clippy::type_complexity)]
    pub fn prepare(
        self,
    ) -> (
        (ReadableStream<T, DefaultStream, Unlocked>, ReadableStream<T, DefaultStream, Unlocked>),
        PlatformFuture<'static, ()>,
    ) {
        let closed = self.reader.closed();
        let state = SharedPtr::new(Mutex::new(TeeState {
            reader: self.reader,
            branches: [None, None],
            reading: false,
            read_again: false,
            cancel: CancelState::new(),
        }));
        let (tx, rx) = mpsc::unbounded();

        let [strategy1, strategy2] = self.strategies;
        let build = |branch: Branch, strategy: BoxedStrategy<T>| {
            let source = TeeBranchSource {
                state: state.clone(),
                pulls: tx.clone(),
                branch,
            };
            let high_water_mark = strategy.high_water_mark();
            let (stream, fut) =
                ReadableStreamBuilder::<T, _, DefaultStream>::with_parts(source, strategy, high_water_mark).prepare();
            state.lock().branches[branch.index()] =
                Some(ReadableStreamDefaultController::new(SharedPtr::downgrade(&stream.inner)));
            (stream, fut)
        };
        let (branch1, fut1) = build(Branch::One, strategy1);
        let (branch2, fut2) = build(Branch::Two, strategy2);
        drop(tx);

        let watcher_state = state.clone();
        let watcher = forward_source_error(closed, move |error| watcher_state.lock().on_source_error(error));
        let coordinator = tee_coordinator(state, rx);
        let fut = async move {
            let drivers = future::join(fut1, fut2);
            futures::pin_mut!(watcher, coordinator);
            future::join(drivers, future::select(coordinator, watcher)).await;
        };
        ((branch1, branch2), platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> (ReadableStream<T, DefaultStream, Unlocked>, ReadableStream<T, DefaultStream, Unlocked>)
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branches, fut) = self.prepare();
        spawn_fn(fut);
        branches
    }
}

impl<T: MaybeSend + Clone + 'static> ReadableStream<T, DefaultStream, Unlocked> {
    /// Locks this stream and forks it into two branches that each see every
    /// chunk.
    pub fn tee(&self) -> StreamResult<TeeBuilder<T>> {
        let (_, reader) = self.get_reader()?;
        Ok(TeeBuilder {
            reader,
            strategies: [
                Box::new(CountQueuingStrategy::new(1)),
                Box::new(CountQueuingStrategy::new(1)),
            ],
        })
    }
}

// ----------- Byte tee -----------
enum TeeReader {
    Default(ReadableStreamDefaultReader<Vec<u8>, ByteStream>),
    Byob(ReadableStreamBYOBReader),
}

impl TeeReader {
    fn closed(&self) -> SignalFuture {
        match self {
            TeeReader::Default(reader) => reader.closed(),
            TeeReader::Byob(reader) => reader.closed(),
        }
    }

    fn start_cancel(&self, reason: Option<StreamError>) -> futures::channel::oneshot::Receiver<StreamResult<()>> {
        match self {
            TeeReader::Default(reader) => reader.start_cancel(reason),
            TeeReader::Byob(reader) => reader.start_cancel(reason),
        }
    }
}

struct ByteTeeState {
    reader: Option<TeeReader>,
    branches: [Option<ReadableByteStreamController>; 2],
    reading: bool,
    read_again: [bool; 2],
    cancel: CancelState,
}

impl ByteTeeState {
    fn branch(&self, branch: Branch) -> Option<&ReadableByteStreamController> {
        if self.cancel.is_canceled(branch) {
            return None;
        }
        self.branches[branch.index()].as_ref()
    }

    fn default_reader(&mut self) -> StreamResult<&ReadableStreamDefaultReader<Vec<u8>, ByteStream>> {
        if matches!(self.reader, Some(TeeReader::Byob(_))) {
            if let Some(TeeReader::Byob(reader)) = self.reader.take() {
                trace!("tee switching source to a default reader");
                let (_, reader) = reader.release_lock().get_reader()?;
                self.reader = Some(TeeReader::Default(reader));
            }
        }
        match &self.reader {
            Some(TeeReader::Default(reader)) => Ok(reader),
            _ => Err(StreamError::InvalidState("tee lost its source reader")),
        }
    }

    fn byob_reader(&mut self) -> StreamResult<&ReadableStreamBYOBReader> {
        if matches!(self.reader, Some(TeeReader::Default(_))) {
            if let Some(TeeReader::Default(reader)) = self.reader.take() {
                trace!("tee switching source to a BYOB reader");
                let (_, reader) = reader.release_lock().get_byob_reader()?;
                self.reader = Some(TeeReader::Byob(reader));
            }
        }
        match &self.reader {
            Some(TeeReader::Byob(reader)) => Ok(reader),
            _ => Err(StreamError::InvalidState("tee lost its source reader")),
        }
    }

    /// Next branch owed a read, if any.
    fn take_read_again(&mut self) -> Option<Branch> {
        let branch = Branch::BOTH
            .into_iter()
            .find(|branch| self.read_again[branch.index()])?;
        self.read_again = [false; 2];
        self.reading = true;
        Some(branch)
    }

    fn on_default_chunk(&mut self, chunk: Vec<u8>) -> Option<Branch> {
        self.reading = false;
        match (self.branch(Branch::One), self.branch(Branch::Two)) {
            (Some(first), Some(second)) => {
                let _ = first.enqueue(chunk.clone());
                let _ = second.enqueue(chunk);
            }
            (Some(only), None) | (None, Some(only)) => {
                let _ = only.enqueue(chunk);
            }
            (None, None) => {}
        }
        self.take_read_again()
    }

    fn on_byob_chunk(&mut self, request: &ReadableStreamBYOBRequest, origin: Branch, view: ByteView) -> Option<Branch> {
        self.reading = false;
        if let Some(controller) = self.branch(origin.other()) {
            let _ = controller.enqueue(view.as_slice().to_vec());
        }
        if !self.cancel.is_canceled(origin) {
            let _ = request.respond_with_new_view(view);
        }
        self.take_read_again()
    }

    /// The source closed. `returned` is the buffer handed back by a BYOB
    /// read that ended the stream.
    fn on_close(&mut self, returned: Option<(&ReadableStreamBYOBRequest, Branch, ByteView)>) {
        self.reading = false;
        for branch in Branch::BOTH {
            if let Some(controller) = self.branch(branch) {
                let _ = controller.close();
            }
        }
        let origin = returned.as_ref().map(|(_, branch, _)| *branch);
        if let Some((request, branch, view)) = returned {
            if !self.cancel.is_canceled(branch) {
                let _ = request.respond_with_new_view(view);
            }
        }
        for branch in Branch::BOTH {
            if Some(branch) == origin {
                continue;
            }
            if let Some(request) = self.branch(branch).and_then(|c| c.byob_request()) {
                let _ = request.respond(0);
            }
        }
        self.cancel.source_finished();
    }

    fn on_source_error(&mut self, error: StreamError) {
        self.reading = false;
        for controller in self.branches.iter().flatten() {
            let _ = controller.error(error.clone());
        }
        self.cancel.source_finished();
    }
}

struct ByteTeeBranchSource {
    state: SharedPtr<Mutex<ByteTeeState>>,
    pulls: UnboundedSender<Branch>,
    branch: Branch,
}

impl ReadableByteSource for ByteTeeBranchSource {
    async fn pull(&mut self, _controller: &mut ReadableByteStreamController) -> StreamResult<()> {
        let mut state = self.state.lock();
        if state.reading {
            state.read_again[self.branch.index()] = true;
            return Ok(());
        }
        state.reading = true;
        drop(state);
        let _ = self.pulls.unbounded_send(self.branch);
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let (done, source_cancel) = {
            let mut state = self.state.lock();
            let composite = state.cancel.cancel(self.branch, reason);
            let source_cancel = match (composite, &state.reader) {
                (Some(reason), Some(reader)) => Some(reader.start_cancel(Some(reason))),
                _ => None,
            };
            (state.cancel.done.clone(), source_cancel)
        };
        settle_cancel(done, source_cancel).await
    }
}

/// Performs one read for `branch`, through the branch's BYOB request when it
/// has one. Returns the branch owed the next read.
async fn byte_tee_read(state: &SharedPtr<Mutex<ByteTeeState>>, branch: Branch) -> Option<Branch> {
    let request = state.lock().branch(branch).and_then(|c| c.byob_request());
    let taken = request.and_then(|request| request.take_view().ok().map(|view| (request, view)));

    let Some((request, view)) = taken else {
        let rx = {
            let mut guard = state.lock();
            match guard.default_reader() {
                Ok(reader) => reader.start_read(),
                Err(error) => {
                    guard.on_source_error(error);
                    return None;
                }
            }
        };
        let result = rx.await.unwrap_or(Err(StreamError::TaskDropped));
        let mut guard = state.lock();
        return match result {
            Ok(Some(chunk)) => guard.on_default_chunk(chunk),
            Ok(None) => {
                guard.on_close(None);
                None
            }
            Err(error) => {
                guard.on_source_error(error);
                None
            }
        };
    };

    let rx = {
        let mut guard = state.lock();
        match guard.byob_reader() {
            Ok(reader) => reader.start_read(view, 1),
            Err(error) => {
                guard.on_source_error(error);
                return None;
            }
        }
    };
    let result = rx.await.unwrap_or(Err(StreamError::TaskDropped));
    let mut guard = state.lock();
    match result {
        Ok(read) if !read.done => match read.value {
            Some(view) => guard.on_byob_chunk(&request, branch, view),
            None => {
                guard.on_close(None);
                None
            }
        },
        Ok(read) => {
            guard.on_close(read.value.map(|view| (&request, branch, view)));
            None
        }
        Err(error) => {
            guard.on_source_error(error);
            None
        }
    }
}

async fn byte_tee_coordinator(state: SharedPtr<Mutex<ByteTeeState>>, mut pulls: UnboundedReceiver<Branch>) {
    while let Some(mut branch) = pulls.next().await {
        while let Some(next) = byte_tee_read(&state, branch).await {
            branch = next;
        }
    }
    trace!("byte tee coordinator finished");
}

/// Follows the source reader across reader switches and forwards its error.
async fn forward_byte_source_error(state: SharedPtr<Mutex<ByteTeeState>>) {
    loop {
        let closed = match &state.lock().reader {
            Some(reader) => Either::Left(reader.closed()),
            None => Either::Right(future::pending()),
        };
        match closed.await {
            Ok(()) => break,
            Err(StreamError::Released) => continue,
            Err(error) => {
                state.lock().on_source_error(error);
                break;
            }
        }
    }
    future::pending::<()>().await
}

/// The two branches of a byte stream tee.
pub struct ByteTeeBuilder {
    reader: ReadableStreamDefaultReader<Vec<u8>, ByteStream>,
}

impl ByteTeeBuilder {
    /// Return both branches + driver future without spawning
    #[allow(clippy::type_complexity)]
    pub fn prepare(
        self,
    ) -> (
        (ReadableStream<Vec<u8>, ByteStream, Unlocked>, ReadableStream<Vec<u8>, ByteStream, Unlocked>),
        PlatformFuture<'static, ()>,
    ) {
        let state = SharedPtr::new(Mutex::new(ByteTeeState {
            reader: Some(TeeReader::Default(self.reader)),
            branches: [None, None],
            reading: false,
            read_again: [false; 2],
            cancel: CancelState::new(),
        }));
        let (tx, rx) = mpsc::unbounded();

        let build = |branch: Branch| {
            let source = ByteTeeBranchSource {
                state: state.clone(),
                pulls: tx.clone(),
                branch,
            };
            let (stream, fut) = ReadableStream::builder_bytes(source).prepare();
            state.lock().branches[branch.index()] =
                Some(ReadableByteStreamController::new(SharedPtr::downgrade(&stream.inner)));
            (stream, fut)
        };
        let (branch1, fut1) = build(Branch::One);
        let (branch2, fut2) = build(Branch::Two);
        drop(tx);

        let watcher = forward_byte_source_error(state.clone());
        let coordinator = byte_tee_coordinator(state, rx);
        let fut = async move {
            let drivers = future::join(fut1, fut2);
            futures::pin_mut!(watcher, coordinator);
            future::join(drivers, future::select(coordinator, watcher)).await;
        };
        ((branch1, branch2), platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> (ReadableStream<Vec<u8>, ByteStream, Unlocked>, ReadableStream<Vec<u8>, ByteStream, Unlocked>)
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branches, fut) = self.prepare();
        spawn_fn(fut);
        branches
    }
}

impl ReadableStream<Vec<u8>, ByteStream, Unlocked> {
    /// Locks this byte stream and forks it into two byte branches.
    ///
    /// A branch with a pending BYOB read has the source fill its buffer
    /// directly; the other branch receives a copy.
    pub fn tee(&self) -> StreamResult<ByteTeeBuilder> {
        let (_, reader) = self.get_reader()?;
        Ok(ByteTeeBuilder { reader })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_util::{spawner, Executor};
    use futures::{future::join, FutureExt};
    use std::sync::Arc;

    async fn drain<T: MaybeSend + 'static>(stream: &ReadableStream<T>) -> Vec<T> {
        let (_, reader) = stream.get_reader().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = reader.read().await.unwrap() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn both_branches_see_every_chunk() {
        let executor = Executor::new();
        let source = ReadableStream::from_vec(vec!["x1".to_string(), "x2".to_string()]).spawn(spawner(&executor));
        let (branch1, branch2) = source.tee().unwrap().spawn(spawner(&executor));
        assert!(source.locked());

        let first = executor.run_until(drain(&branch1));
        assert_eq!(first, vec!["x1", "x2"]);
        // Branch two is read only after the source has closed.
        let second = executor.run_until(drain(&branch2));
        assert_eq!(second, vec!["x1", "x2"]);
    }

    struct Endless {
        next: u32,
        canceled: Arc<Mutex<Vec<String>>>,
    }

    impl ReadableSource<u32> for Endless {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            self.next += 1;
            controller.enqueue(self.next)
        }

        async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.canceled.lock().push(format!("{reason:?}"));
            Ok(())
        }
    }

    #[test]
    fn source_canceled_only_after_both_branches() {
        let executor = Executor::new();
        let canceled = Arc::new(Mutex::new(Vec::new()));
        let source = ReadableStream::builder(Endless {
            next: 0,
            canceled: canceled.clone(),
        })
        .spawn(spawner(&executor));
        let (branch1, branch2) = source.tee().unwrap().spawn(spawner(&executor));
        executor.run_until_stalled();

        let mut first = Box::pin(branch1.cancel(Some("one".into())));
        executor.run_until_stalled();
        assert!((&mut first).now_or_never().is_none());
        assert!(canceled.lock().is_empty());

        let second = branch2.cancel(Some("two".into()));
        let (first, second) = executor.run_until(join(first, second));
        first.unwrap();
        second.unwrap();

        let canceled = canceled.lock();
        assert_eq!(canceled.len(), 1);
        assert!(canceled[0].contains("TeeCanceled"));
        assert!(canceled[0].contains("one") && canceled[0].contains("two"));
    }

    #[test]
    fn composite_reason_keeps_branch_order() {
        let mut state = CancelState::new();
        assert!(state.cancel(Branch::Two, Some("b".into())).is_none());
        match state.cancel(Branch::One, Some("a".into())) {
            Some(StreamError::TeeCanceled { branch1, branch2 }) => {
                assert_eq!(branch1.unwrap().to_string(), "a");
                assert_eq!(branch2.unwrap().to_string(), "b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn source_error_reaches_both_branches() {
        struct Failing;
        impl ReadableSource<u32> for Failing {
            async fn pull(&mut self, _c: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
                Err("boom".into())
            }
        }

        let executor = Executor::new();
        let source = ReadableStream::builder(Failing).spawn(spawner(&executor));
        let (branch1, branch2) = source.tee().unwrap().spawn(spawner(&executor));
        let (_, reader1) = branch1.get_reader().unwrap();
        let (_, reader2) = branch2.get_reader().unwrap();
        let (r1, r2) = executor.run_until(join(reader1.read(), reader2.read()));
        assert_eq!(r1.unwrap_err().to_string(), "boom");
        assert_eq!(r2.unwrap_err().to_string(), "boom");
    }

    struct Bytes {
        chunks: Vec<Vec<u8>>,
    }

    impl ReadableByteSource for Bytes {
        async fn pull(&mut self, controller: &mut ReadableByteStreamController) -> StreamResult<()> {
            if self.chunks.is_empty() {
                controller.close()?;
                if let Some(request) = controller.byob_request() {
                    request.respond(0)?;
                }
                return Ok(());
            }
            let chunk = self.chunks.remove(0);
            match controller.byob_request() {
                Some(request) => {
                    let written = request.fill(&chunk)?;
                    if written < chunk.len() {
                        controller.enqueue(chunk[written..].to_vec())?;
                    }
                    Ok(())
                }
                None => controller.enqueue(chunk),
            }
        }
    }

    #[test]
    fn byte_tee_default_reads_get_independent_copies() {
        let executor = Executor::new();
        let source = ReadableStream::builder_bytes(Bytes {
            chunks: vec![vec![1, 2, 3], vec![4]],
        })
        .spawn(spawner(&executor));
        let (branch1, branch2) = source.tee().unwrap().spawn(spawner(&executor));

        let read_all = |branch: &ReadableStream<Vec<u8>, ByteStream>| {
            let (_, reader) = branch.get_reader().unwrap();
            async move {
                let mut out = Vec::new();
                while let Some(chunk) = reader.read().await.unwrap() {
                    out.extend(chunk);
                }
                out
            }
        };
        let (a, b) = executor.run_until(join(read_all(&branch1), read_all(&branch2)));
        assert_eq!(a, vec![1, 2, 3, 4]);
        assert_eq!(b, vec![1, 2, 3, 4]);
    }

    #[test]
    fn byte_tee_fills_byob_buffer_and_copies_to_other_branch() {
        let executor = Executor::new();
        let source = ReadableStream::builder_bytes(Bytes {
            chunks: vec![vec![9, 8, 7]],
        })
        .spawn(spawner(&executor));
        let (branch1, branch2) = source.tee().unwrap().spawn(spawner(&executor));

        let (_, byob) = branch1.get_byob_reader().unwrap();
        let result = executor.run_until(byob.read(ByteView::new(vec![0; 8]))).unwrap();
        assert!(!result.done);
        assert_eq!(result.value.unwrap().as_slice(), &[9, 8, 7]);

        let (_, reader) = branch2.get_reader().unwrap();
        assert_eq!(executor.run_until(reader.read()).unwrap(), Some(vec![9, 8, 7]));

        let result = executor.run_until(byob.read(ByteView::new(vec![0; 8]))).unwrap();
        assert!(result.done);
        assert_eq!(executor.run_until(reader.read()).unwrap(), None);
    }
}
