use std::future::Future;

use futures::{
    future::{self, Either},
    select_biased, FutureExt,
};
use tracing::debug;

use super::{
    abort::AbortSignal,
    error::{StreamError, StreamResult},
    readable::{ReadableStream, StreamState},
    reader::ReadableStreamDefaultReader,
    transform::TransformStream,
    writable::{WritableStream, WritableStreamDefaultWriter, WritableStreamState},
    DefaultStream, StreamTypeMarker, Unlocked,
};
use crate::platform::{self, MaybeSend, PlatformFuture};

/// Options for [`ReadableStream::pipe_to`].
#[derive(Clone, Default)]
pub struct StreamPipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    /// Aborting this signal shuts the pipe down with the signal's reason.
    pub signal: Option<AbortSignal>,
}

/// What the pipe does to the other side before releasing its locks.
enum ShutdownAction {
    None,
    AbortDestination(StreamError),
    CancelSource(StreamError),
    CloseDestination,
    AbortBoth(StreamError),
}

enum StepFailure {
    Source(StreamError),
    Destination(StreamError),
}

enum PipeEvent<T> {
    Aborted(StreamError),
    SourceClosed(StreamResult<()>),
    DestinationClosed(StreamResult<()>),
    Step(Result<Option<T>, StepFailure>),
}

struct Pipe<T: MaybeSend + 'static, S: StreamTypeMarker> {
    reader: ReadableStreamDefaultReader<T, S>,
    writer: WritableStreamDefaultWriter<T>,
    options: StreamPipeOptions,
    last_write: Option<futures::channel::oneshot::Receiver<StreamResult<()>>>,
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> Pipe<T, S> {
    async fn next_chunk(&self) -> Result<Option<T>, StepFailure> {
        self.writer.ready().await.map_err(StepFailure::Destination)?;
        self.reader.read().await.map_err(StepFailure::Source)
    }

    /// Conditions that end the pipe before any chunk moves, checked in the
    /// order errors and closes propagate.
    fn initial_shutdown(&self) -> Option<(ShutdownAction, Option<StreamError>)> {
        if let Some(signal) = &self.options.signal {
            if let Some(reason) = signal.reason() {
                return Some(self.abort_action(reason));
            }
        }
        let (source_state, source_error) = self.reader.stream_state();
        let (dest_state, dest_error, dest_closing) = self.writer.stream_state();
        if source_state == StreamState::Errored {
            return Some(self.source_errored(source_error.unwrap_or(StreamError::Errored)));
        }
        if matches!(dest_state, WritableStreamState::Errored | WritableStreamState::Erroring) {
            return Some(self.destination_errored(dest_error.unwrap_or(StreamError::Errored)));
        }
        if source_state == StreamState::Closed {
            return Some(self.source_closed());
        }
        if dest_closing || dest_state == WritableStreamState::Closed {
            return Some(self.destination_closed());
        }
        None
    }

    fn abort_action(&self, reason: StreamError) -> (ShutdownAction, Option<StreamError>) {
        let action = match (self.options.prevent_abort, self.options.prevent_cancel) {
            (true, true) => ShutdownAction::None,
            (false, true) => ShutdownAction::AbortDestination(reason.clone()),
            (true, false) => ShutdownAction::CancelSource(reason.clone()),
            (false, false) => ShutdownAction::AbortBoth(reason.clone()),
        };
        (action, Some(reason))
    }

    fn source_errored(&self, error: StreamError) -> (ShutdownAction, Option<StreamError>) {
        if self.options.prevent_abort {
            (ShutdownAction::None, Some(error))
        } else {
            (ShutdownAction::AbortDestination(error.clone()), Some(error))
        }
    }

    fn destination_errored(&self, error: StreamError) -> (ShutdownAction, Option<StreamError>) {
        if self.options.prevent_cancel {
            (ShutdownAction::None, Some(error))
        } else {
            (ShutdownAction::CancelSource(error.clone()), Some(error))
        }
    }

    fn source_closed(&self) -> (ShutdownAction, Option<StreamError>) {
        if self.options.prevent_close {
            (ShutdownAction::None, None)
        } else {
            (ShutdownAction::CloseDestination, None)
        }
    }

    fn destination_closed(&self) -> (ShutdownAction, Option<StreamError>) {
        let error = StreamError::DestinationClosed;
        if self.options.prevent_cancel {
            (ShutdownAction::None, Some(error))
        } else {
            (ShutdownAction::CancelSource(error.clone()), Some(error))
        }
    }

    async fn run(mut self) -> StreamResult<()> {
        let (action, error) = match self.initial_shutdown() {
            Some(shutdown) => shutdown,
            None => self.pump().await,
        };
        self.shutdown(action, error).await
    }

    /// Moves chunks until something ends the pipe.
    async fn pump(&mut self) -> (ShutdownAction, Option<StreamError>) {
        let mut aborted = match &self.options.signal {
            Some(signal) => Either::Left(signal.aborted()),
            None => Either::Right(future::pending()),
        }
        .fuse();
        let mut source_closed = self.reader.closed();
        let mut destination_closed = self.writer.closed();

        loop {
            let event = {
                let step = self.next_chunk().fuse();
                futures::pin_mut!(step);
                // A read that settles together with the source closing still
                // delivers its chunk.
                select_biased! {
                    reason = aborted => PipeEvent::Aborted(reason),
                    result = step => PipeEvent::Step(result),
                    result = source_closed => PipeEvent::SourceClosed(result),
                    result = destination_closed => PipeEvent::DestinationClosed(result),
                }
            };
            match event {
                PipeEvent::Step(Ok(Some(chunk))) => {
                    self.last_write = Some(self.writer.start_write(chunk));
                }
                PipeEvent::Step(Ok(None)) | PipeEvent::SourceClosed(Ok(())) => return self.source_closed(),
                PipeEvent::Step(Err(StepFailure::Source(error))) | PipeEvent::SourceClosed(Err(error)) => {
                    return self.source_errored(error)
                }
                PipeEvent::Step(Err(StepFailure::Destination(error))) | PipeEvent::DestinationClosed(Err(error)) => {
                    return self.destination_errored(error)
                }
                PipeEvent::DestinationClosed(Ok(())) => return self.destination_closed(),
                PipeEvent::Aborted(reason) => return self.abort_action(reason),
            }
        }
    }

    async fn shutdown(mut self, action: ShutdownAction, error: Option<StreamError>) -> StreamResult<()> {
        debug!(error = ?error.as_ref().map(|e| e.to_string()), "pipe shutting down");
        let (dest_state, _, dest_closing) = self.writer.stream_state();
        if dest_state == WritableStreamState::Writable && !dest_closing {
            if let Some(last_write) = self.last_write.take() {
                let _ = last_write.await;
            }
        }

        let outcome = match action {
            ShutdownAction::None => Ok(()),
            ShutdownAction::AbortDestination(reason) => self.abort_destination(reason).await,
            ShutdownAction::CancelSource(reason) => self.cancel_source(reason).await,
            ShutdownAction::CloseDestination => self
                .writer
                .start_close_with_error_propagation()
                .await
                .unwrap_or(Err(StreamError::TaskDropped)),
            ShutdownAction::AbortBoth(reason) => {
                let (aborted, canceled) =
                    future::join(self.abort_destination(reason.clone()), self.cancel_source(reason)).await;
                aborted.and(canceled)
            }
        };

        // Dropping the reader and writer releases both locks.
        match (outcome, error) {
            (Err(error), _) | (Ok(()), Some(error)) => Err(error),
            (Ok(()), None) => Ok(()),
        }
    }

    async fn abort_destination(&self, reason: StreamError) -> StreamResult<()> {
        if self.writer.stream_state().0 != WritableStreamState::Writable {
            return Ok(());
        }
        self.writer.start_abort(Some(reason)).wait().await
    }

    async fn cancel_source(&self, reason: StreamError) -> StreamResult<()> {
        if self.reader.stream_state().0 != StreamState::Readable {
            return Ok(());
        }
        self.reader
            .start_cancel(Some(reason))
            .await
            .unwrap_or(Ok(()))
    }
}

impl<T: MaybeSend + 'static, S: StreamTypeMarker> ReadableStream<T, S, Unlocked> {
    /// Pipes every chunk into `destination`, propagating close, errors and
    /// cancellation between the two according to `options`.
    ///
    /// Both streams are locked as soon as this is called; the returned future
    /// drives the transfer and settles once both locks are released.
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T, Unlocked>,
        options: StreamPipeOptions,
    ) -> impl Future<Output = StreamResult<()>> {
        let pipe = self.get_reader().and_then(|(_, reader)| {
            let (_, writer) = destination.get_writer()?;
            Ok(Pipe {
                reader,
                writer,
                options,
                last_write: None,
            })
        });
        async move { pipe?.run().await }
    }

    /// Pipes this stream into the writable side of `transform` and returns
    /// its readable side together with the pipe future.
    pub fn pipe_through<O: MaybeSend + 'static>(
        &self,
        transform: TransformStream<T, O>,
        options: StreamPipeOptions,
    ) -> StreamResult<PipeBuilder<O>> {
        let (readable, writable) = transform.split();
        if self.locked() || writable.locked() {
            return Err(StreamError::Locked);
        }
        let pipe = self.pipe_to(&writable, options);
        let pipe = async move {
            if let Err(error) = pipe.await {
                debug!(%error, "pipe through ended with an error");
            }
        };
        Ok(PipeBuilder {
            readable,
            pipe: platform::boxed(pipe),
        })
    }
}

/// Readable end of a [`pipe_through`](ReadableStream::pipe_through) and the
/// future moving data into it.
pub struct PipeBuilder<O: MaybeSend + 'static> {
    readable: ReadableStream<O, DefaultStream, Unlocked>,
    pipe: PlatformFuture<'static, ()>,
}

impl<O: MaybeSend + 'static> PipeBuilder<O> {
    /// Return the readable side + pipe future without spawning
    pub fn prepare(self) -> (ReadableStream<O, DefaultStream, Unlocked>, PlatformFuture<'static, ()>) {
        (self.readable, self.pipe)
    }

    /// Spawn the pipe with the given executor entry point
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O, DefaultStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        spawn_fn(self.pipe);
        self.readable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        abort::AbortController,
        test_util::{spawner, Executor},
        writable::{WritableSink, WritableStreamDefaultController},
        CountQueuingStrategy, IdentityTransformer, ReadableSource, ReadableStreamDefaultController,
    };
    use futures::channel::oneshot;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc};

    #[derive(Default)]
    struct Record {
        chunks: Mutex<Vec<u32>>,
        events: Mutex<Vec<String>>,
    }

    struct RecordingSink {
        record: Arc<Record>,
        fail_on: Option<u32>,
    }

    impl WritableSink<u32> for RecordingSink {
        async fn write(&mut self, chunk: u32, _c: &mut WritableStreamDefaultController) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err("sink rejected".into());
            }
            self.record.chunks.lock().push(chunk);
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.record.events.lock().push("close".into());
            Ok(())
        }

        async fn abort(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            self.record
                .events
                .lock()
                .push(format!("abort: {}", reason.map(|r| r.to_string()).unwrap_or_default()));
            Ok(())
        }
    }

    fn recording(executor: &Executor, fail_on: Option<u32>) -> (WritableStream<u32>, Arc<Record>) {
        let record = Arc::new(Record::default());
        let stream = WritableStream::builder(RecordingSink {
            record: record.clone(),
            fail_on,
        })
        .strategy(CountQueuingStrategy::new(2))
        .spawn(spawner(executor));
        (stream, record)
    }

    /// Source that hands out scripted results and records cancellation.
    struct ScriptedSource {
        script: VecDeque<StreamResult<Option<u32>>>,
        canceled: Arc<Mutex<Option<String>>>,
    }

    impl ReadableSource<u32> for ScriptedSource {
        async fn pull(&mut self, controller: &mut ReadableStreamDefaultController<u32>) -> StreamResult<()> {
            match self.script.pop_front() {
                Some(Ok(Some(chunk))) => controller.enqueue(chunk),
                Some(Ok(None)) => controller.close(),
                Some(Err(error)) => Err(error),
                None => Ok(()),
            }
        }

        async fn cancel(&mut self, reason: Option<StreamError>) -> StreamResult<()> {
            *self.canceled.lock() = Some(reason.map(|r| r.to_string()).unwrap_or_default());
            Ok(())
        }
    }

    fn scripted(
        executor: &Executor,
        script: Vec<StreamResult<Option<u32>>>,
    ) -> (ReadableStream<u32>, Arc<Mutex<Option<String>>>) {
        let canceled = Arc::new(Mutex::new(None));
        let stream = ReadableStream::builder(ScriptedSource {
            script: script.into(),
            canceled: canceled.clone(),
        })
        .spawn(spawner(executor));
        (stream, canceled)
    }

    #[test]
    fn pipes_all_chunks_then_closes_destination() {
        let executor = Executor::new();
        let source = ReadableStream::from_vec(vec![1, 2, 3]).spawn(spawner(&executor));
        let (dest, record) = recording(&executor, None);

        executor
            .run_until(source.pipe_to(&dest, StreamPipeOptions::default()))
            .unwrap();
        assert_eq!(*record.chunks.lock(), vec![1, 2, 3]);
        assert_eq!(*record.events.lock(), vec!["close".to_string()]);
        assert!(!source.locked());
        assert!(!dest.locked());
        assert_eq!(dest.state(), WritableStreamState::Closed);
    }

    #[test]
    fn prevent_close_leaves_destination_open() {
        let executor = Executor::new();
        let source = ReadableStream::from_vec(vec![1]).spawn(spawner(&executor));
        let (dest, record) = recording(&executor, None);
        let options = StreamPipeOptions {
            prevent_close: true,
            ..Default::default()
        };
        executor.run_until(source.pipe_to(&dest, options)).unwrap();
        assert_eq!(*record.chunks.lock(), vec![1]);
        assert!(record.events.lock().is_empty());
        assert_eq!(dest.state(), WritableStreamState::Writable);
    }

    #[test]
    fn source_error_aborts_destination() {
        let executor = Executor::new();
        let (source, _) = scripted(&executor, vec![Ok(Some(1)), Err("source broke".into())]);
        let (dest, record) = recording(&executor, None);

        let result = executor.run_until(source.pipe_to(&dest, StreamPipeOptions::default()));
        assert_eq!(result.unwrap_err().to_string(), "source broke");
        assert_eq!(*record.chunks.lock(), vec![1]);
        assert_eq!(*record.events.lock(), vec!["abort: source broke".to_string()]);
        assert_eq!(dest.state(), WritableStreamState::Errored);
    }

    #[test]
    fn destination_error_cancels_source() {
        let executor = Executor::new();
        let (source, canceled) = scripted(&executor, vec![Ok(Some(1)), Ok(Some(2)), Ok(Some(3))]);
        let (dest, _record) = recording(&executor, Some(2));

        let result = executor.run_until(source.pipe_to(&dest, StreamPipeOptions::default()));
        assert_eq!(result.unwrap_err().to_string(), "sink rejected");
        assert_eq!(canceled.lock().as_deref(), Some("sink rejected"));
    }

    #[test]
    fn closed_destination_cancels_source() {
        let executor = Executor::new();
        let (source, canceled) = scripted(&executor, vec![Ok(Some(1))]);
        let (dest, _record) = recording(&executor, None);
        executor.run_until(dest.close()).unwrap();

        let result = executor.run_until(source.pipe_to(&dest, StreamPipeOptions::default()));
        assert!(matches!(result, Err(StreamError::DestinationClosed)));
        assert_eq!(
            canceled.lock().as_deref(),
            Some(StreamError::DestinationClosed.to_string().as_str())
        );
    }

    #[test]
    fn abort_signal_stops_pipe_and_aborts_both_sides() {
        let executor = Executor::new();
        let (source, canceled) = scripted(&executor, vec![Ok(Some(1))]);
        let (dest, record) = recording(&executor, None);
        let controller = AbortController::new();
        let options = StreamPipeOptions {
            signal: Some(controller.signal()),
            ..Default::default()
        };

        let (tx, rx) = oneshot::channel();
        let pipe = source.pipe_to(&dest, options);
        (spawner(&executor))(platform::boxed(async move {
            let _ = tx.send(pipe.await);
        }));
        executor.run_until_stalled();
        assert_eq!(*record.chunks.lock(), vec![1]);

        controller.abort(Some("user stop".into()));
        let result = executor.run_until(rx).unwrap();
        assert_eq!(result.unwrap_err().to_string(), "user stop");
        assert_eq!(canceled.lock().as_deref(), Some("user stop"));
        assert_eq!(*record.events.lock(), vec!["abort: user stop".to_string()]);
    }

    #[test]
    fn locked_streams_are_rejected() {
        let executor = Executor::new();
        let source = ReadableStream::from_vec(vec![1]).spawn(spawner(&executor));
        let (dest, _) = recording(&executor, None);
        let (_, writer) = dest.get_writer().unwrap();
        let result = executor.run_until(source.pipe_to(&dest, StreamPipeOptions::default()));
        assert!(matches!(result, Err(StreamError::Locked)));
        assert!(!source.locked());
        drop(writer);
    }

    #[test]
    fn pipe_through_identity() {
        let executor = Executor::new();
        let source = ReadableStream::from_vec(vec![4, 5]).spawn(spawner(&executor));
        let transform = TransformStream::builder(IdentityTransformer).spawn(spawner(&executor));
        let readable = source
            .pipe_through(transform, StreamPipeOptions::default())
            .unwrap()
            .spawn(spawner(&executor));
        let (_, reader) = readable.get_reader().unwrap();
        let out = executor.run_until(async {
            let mut out = Vec::new();
            while let Some(chunk) = reader.read().await.unwrap() {
                out.push(chunk);
            }
            out
        });
        assert_eq!(out, vec![4, 5]);
    }
}
