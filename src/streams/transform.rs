use std::{future::Future, marker::PhantomData};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    error::{StreamError, StreamResult},
    readable::{ReadableSource, ReadableStream, ReadableStreamBuilder, ReadableStreamDefaultController, StreamState},
    signal::Signal,
    writable::{WritableSink, WritableStream, WritableStreamDefaultController, WritableStreamState},
    CountQueuingStrategy, DefaultStream, QueuingStrategy, Unlocked,
};
use crate::platform::{self, BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};

type Completion = oneshot::Sender<StreamResult<()>>;

/// Commands sent from the two sides to the transform task
enum TransformCommand<I> {
    Transform { chunk: I, completion: Completion },
    Close { completion: Completion },
    Abort { reason: Option<StreamError>, completion: Completion },
    Cancel { reason: Option<StreamError>, completion: Completion },
}

/// Backpressure flag shared by the writable side and the controller.
///
/// `change` settles every time the flag flips, releasing writes gated on it.
struct Backpressure {
    engaged: bool,
    change: Signal,
}

impl Backpressure {
    fn set(&mut self, engaged: bool) {
        self.change.resolve();
        self.change = Signal::pending();
        self.engaged = engaged;
    }
}

// ----------- Controller -----------
/// Handle given to a [`Transformer`] to feed the readable side.
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    readable: ReadableStreamDefaultController<O>,
    writable: WritableStreamDefaultController,
    backpressure: SharedPtr<Mutex<Backpressure>>,
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    /// Enqueue to readable side
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        if !self.readable.can_close_or_enqueue() {
            return Err(StreamError::InvalidState("readable side does not accept chunks"));
        }
        if let Err(error) = self.readable.enqueue(chunk) {
            self.error_writable_and_unblock_write(error.clone());
            return Err(match self.readable.state() {
                Some((_, Some(stored))) => stored,
                _ => error,
            });
        }
        let has_backpressure = self.readable.has_backpressure();
        let mut backpressure = self.backpressure.lock();
        if has_backpressure != backpressure.engaged {
            debug_assert!(has_backpressure);
            backpressure.set(true);
        }
        Ok(())
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) {
        let _ = self.readable.error(error.clone());
        self.error_writable_and_unblock_write(error);
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) {
        debug!("transform stream terminated");
        let _ = self.readable.close();
        self.error_writable_and_unblock_write(StreamError::Terminated);
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<isize> {
        self.readable.desired_size()
    }

    fn error_writable_and_unblock_write(&self, error: StreamError) {
        self.writable.error(error);
        self.unblock_write();
    }

    fn unblock_write(&self) {
        let mut backpressure = self.backpressure.lock();
        if backpressure.engaged {
            backpressure.set(false);
        }
    }

    fn readable_error(&self) -> Option<StreamError> {
        match self.readable.state() {
            Some((StreamState::Errored, error)) => Some(error.unwrap_or(StreamError::Errored)),
            _ => None,
        }
    }

    fn writable_error(&self) -> Option<StreamError> {
        match self.writable.state() {
            Some((WritableStreamState::Errored, error)) => Some(error.unwrap_or(StreamError::Errored)),
            _ => None,
        }
    }
}

// ----------- Transformer contract -----------
/// Transformer trait
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    /// Called when the readable side is canceled or the writable side aborted
    fn cancel(&mut self, reason: Option<StreamError>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}

/// Passes every chunk through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl IdentityTransformer {
    pub fn new() -> Self {
        Self
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer {
    async fn transform(&mut self, chunk: T, controller: &mut TransformStreamDefaultController<T>) -> StreamResult<()> {
        controller.enqueue(chunk)
    }
}

// ----------- Internal sides -----------
/// Sink behind the writable side
struct TransformWritableSink<I> {
    commands: UnboundedSender<TransformCommand<I>>,
    backpressure: SharedPtr<Mutex<Backpressure>>,
}

impl<I: MaybeSend + 'static> TransformWritableSink<I> {
    async fn request(&self, command: impl FnOnce(Completion) -> TransformCommand<I>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .unbounded_send(command(tx))
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

impl<I: MaybeSend + 'static> WritableSink<I> for TransformWritableSink<I> {
    async fn write(&mut self, chunk: I, controller: &mut WritableStreamDefaultController) -> StreamResult<()> {
        let gate = {
            let backpressure = self.backpressure.lock();
            backpressure.engaged.then(|| backpressure.change.clone())
        };
        if let Some(gate) = gate {
            trace!("transform write waiting on backpressure");
            let _ = gate.wait().await;
            if let Some((WritableStreamState::Erroring, error)) = controller.state() {
                return Err(error.unwrap_or(StreamError::Errored));
            }
        }
        self.request(|completion| TransformCommand::Transform { chunk, completion }).await
    }

    async fn close(self) -> StreamResult<()> {
        self.request(|completion| TransformCommand::Close { completion }).await
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        self.request(|completion| TransformCommand::Abort { reason, completion })
            .await
    }
}

/// Source behind the readable side
struct TransformReadableSource<I> {
    commands: UnboundedSender<TransformCommand<I>>,
    backpressure: SharedPtr<Mutex<Backpressure>>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> ReadableSource<O> for TransformReadableSource<I> {
    async fn pull(&mut self, _controller: &mut ReadableStreamDefaultController<O>) -> StreamResult<()> {
        let mut backpressure = self.backpressure.lock();
        if backpressure.engaged {
            backpressure.set(false);
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .unbounded_send(TransformCommand::Cancel { reason, completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

// ----------- Transform task -----------
enum FinishStep {
    Flush,
    Abort(Option<StreamError>),
    Cancel(Option<StreamError>),
}

struct TransformDriver<I, O: MaybeSend + 'static, T> {
    transformer: T,
    controller: TransformStreamDefaultController<O>,
    start_error: Option<StreamError>,
    /// Outcome shared by close, abort and cancel: only the first runs.
    finish: Option<Signal>,
    _input: PhantomData<fn(I)>,
}

impl<I, O, T> TransformDriver<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    async fn transform(&mut self, chunk: I) -> StreamResult<()> {
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }
        let result = self.transformer.transform(chunk, &mut self.controller).await;
        if let Err(error) = &result {
            self.controller.error(error.clone());
        }
        result
    }

    async fn flush(&mut self) -> StreamResult<()> {
        match self.transformer.flush(&mut self.controller).await {
            Ok(()) => {
                if let Some(error) = self.controller.readable_error() {
                    return Err(error);
                }
                let _ = self.controller.readable.close();
                Ok(())
            }
            Err(error) => {
                let _ = self.controller.readable.error(error.clone());
                Err(error)
            }
        }
    }

    async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        match self.transformer.cancel(reason.clone()).await {
            Ok(()) => {
                if let Some(error) = self.controller.readable_error() {
                    return Err(error);
                }
                let _ = self
                    .controller
                    .readable
                    .error(reason.unwrap_or(StreamError::Aborted(None)));
                Ok(())
            }
            Err(error) => {
                let _ = self.controller.readable.error(error.clone());
                Err(error)
            }
        }
    }

    async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
        match self.transformer.cancel(reason.clone()).await {
            Ok(()) => {
                if let Some(error) = self.controller.writable_error() {
                    return Err(error);
                }
                self.controller
                    .error_writable_and_unblock_write(reason.unwrap_or(StreamError::Canceled));
                Ok(())
            }
            Err(error) => {
                self.controller.error_writable_and_unblock_write(error.clone());
                Err(error)
            }
        }
    }

    async fn finish(&mut self, step: FinishStep) -> StreamResult<()> {
        if let Some(finish) = &self.finish {
            return finish.wait().await;
        }
        let finish = Signal::pending();
        self.finish = Some(finish.clone());
        let result = match step {
            FinishStep::Flush => self.flush().await,
            FinishStep::Abort(reason) => self.abort(reason).await,
            FinishStep::Cancel(reason) => self.cancel(reason).await,
        };
        match &result {
            Ok(()) => finish.resolve(),
            Err(error) => finish.reject(error.clone()),
        };
        result
    }

    async fn run(mut self, mut commands: UnboundedReceiver<TransformCommand<I>>) {
        if let Err(error) = self.transformer.start(&mut self.controller).await {
            debug!(%error, "transformer failed to start");
            self.controller.error(error.clone());
            self.start_error = Some(error);
        }

        while let Some(command) = commands.next().await {
            let (result, completion) = match command {
                TransformCommand::Transform { chunk, completion } => (self.transform(chunk).await, completion),
                TransformCommand::Close { completion } => (self.finish(FinishStep::Flush).await, completion),
                TransformCommand::Abort { reason, completion } => {
                    (self.finish(FinishStep::Abort(reason)).await, completion)
                }
                TransformCommand::Cancel { reason, completion } => {
                    (self.finish(FinishStep::Cancel(reason)).await, completion)
                }
            };
            let _ = completion.send(result);
        }
        trace!("transform task finished");
    }
}

// ----------- TransformStream -----------
/// A writable side and a readable side joined by a [`Transformer`].
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O, DefaultStream, Unlocked>,
    writable: WritableStream<I, Unlocked>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    pub fn builder<T>(transformer: T) -> TransformStreamBuilder<I, O, T>
    where
        T: Transformer<I, O>,
    {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(self) -> ReadableStream<O, DefaultStream, Unlocked> {
        self.readable
    }

    /// Get the writable side
    pub fn writable(self) -> WritableStream<I, Unlocked> {
        self.writable
    }

    /// Split into both sides
    pub fn split(self) -> (ReadableStream<O, DefaultStream, Unlocked>, WritableStream<I, Unlocked>) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// A transform stream that forwards chunks unchanged, giving a connected
    /// writable/readable pair.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer> {
        TransformStreamBuilder::new(IdentityTransformer)
    }
}

pub struct TransformStreamBuilder<I: MaybeSend + 'static, O: MaybeSend + 'static, T> {
    transformer: T,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
}

impl<I, O, T> TransformStreamBuilder<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    fn new(transformer: T) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(1)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0)),
        }
    }

    pub fn writable_strategy<S: QueuingStrategy<I> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.writable_strategy = Box::new(strategy);
        self
    }

    pub fn readable_strategy<S: QueuingStrategy<O> + MaybeSend + 'static>(mut self, strategy: S) -> Self {
        self.readable_strategy = Box::new(strategy);
        self
    }

    /// Return stream + driver future without spawning
    ///
    /// The future drives both sides and the transformer.
    pub fn prepare(self) -> (TransformStream<I, O>, PlatformFuture<'static, ()>) {
        let (tx, rx) = mpsc::unbounded();
        let backpressure = SharedPtr::new(Mutex::new(Backpressure {
            engaged: true,
            change: Signal::pending(),
        }));

        let source = TransformReadableSource {
            commands: tx.clone(),
            backpressure: backpressure.clone(),
        };
        let (readable, readable_fut) =
            ReadableStreamBuilder::<O, _, DefaultStream>::with_parts(source, self.readable_strategy, 0).prepare();

        let sink = TransformWritableSink {
            commands: tx,
            backpressure: backpressure.clone(),
        };
        let (writable, writable_fut) = WritableStream::builder(sink)
            .boxed_strategy(self.writable_strategy)
            .prepare();

        let controller = TransformStreamDefaultController {
            readable: ReadableStreamDefaultController::new(SharedPtr::downgrade(&readable.inner)),
            writable: writable.controller(),
            backpressure,
        };
        let driver = TransformDriver {
            transformer: self.transformer,
            controller,
            start_error: None,
            finish: None,
            _input: PhantomData,
        };

        let fut = async move {
            futures::join!(readable_fut, writable_fut, driver.run(rx));
        };
        (TransformStream { readable, writable }, platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}
