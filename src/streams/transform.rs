use super::error::StreamError;
use super::readable::{ReadableSource, ReadableStream, ReadableStreamDefaultController};
use super::writable::{WritableSink, WritableStream, WritableStreamDefaultController};
use super::{CountQueuingStrategy, QueuingStrategy, Unlocked};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{self, Either},
    stream::StreamExt,
};
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

type StreamResult<T> = Result<T, StreamError>;

// ----------- Transformer Trait -----------

/// Chunk-rewriting algorithm sitting between a writable input side and a
/// readable output side.
///
/// `transform` may enqueue zero or more output chunks per input chunk;
/// `flush` runs when the input side closes, before the output side is closed.
/// A failure in either errors both sides with the same reason.
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn transform(
        &mut self,
        chunk: I,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn flush(
        &mut self,
        controller: &TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }
}

/// Passes chunks through unchanged. Useful as a connected readable/writable
/// pair for piping or buffering.
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk))
    }
}

// ----------- Controller -----------

/// Handle a [`Transformer`] uses to emit output and to settle both sides.
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    readable: ReadableStreamDefaultController<O>,
    writable: WritableStreamDefaultController,
}

impl<O: MaybeSend + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    /// Enqueues a chunk on the output side.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        self.readable.enqueue(chunk)
    }

    /// Errors BOTH sides of the transform with the same reason.
    pub fn error(&self, error: StreamError) {
        let _ = self.readable.error(error.clone());
        self.writable.error(error);
    }

    /// Closes the output side and errors the input side: no further data
    /// flows, but output already queued is still readable.
    pub fn terminate(&self) {
        let _ = self.readable.close();
        self.writable
            .error(StreamError::from("transform stream terminated"));
    }

    /// The output side's remaining room under its high-water mark.
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }
}

// ----------- Internal Plumbing -----------

enum TransformCommand<I> {
    Write {
        chunk: I,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
}

/// Output-side source: data arrives from the transform task, never from a
/// pull.
pub struct TransformReadableSource<O> {
    _phantom: PhantomData<fn() -> O>,
}

impl<O: MaybeSend + 'static> ReadableSource<O> for TransformReadableSource<O> {
    async fn pull(&mut self, _controller: &ReadableStreamDefaultController<O>) -> StreamResult<()> {
        Ok(())
    }
}

/// Input-side sink: forwards chunks to the transform task one at a time.
pub struct TransformWritableSink<I> {
    transform_tx: UnboundedSender<TransformCommand<I>>,
}

impl<I: MaybeSend + 'static> WritableSink<I> for TransformWritableSink<I> {
    async fn write(
        &mut self,
        chunk: I,
        controller: &WritableStreamDefaultController,
    ) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.transform_tx
            .unbounded_send(TransformCommand::Write {
                chunk,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;
        // A transform stalled on output backpressure must not hold teardown
        // up: bail out as soon as the stream starts erroring.
        match future::select(rx, controller.aborted()).await {
            Either::Left((outcome, _)) => outcome.unwrap_or(Err(StreamError::TaskDropped)),
            Either::Right(((), _)) => Err(StreamError::Aborted(None)),
        }
    }

    async fn close(self) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.transform_tx
            .unbounded_send(TransformCommand::Close { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.transform_tx
            .unbounded_send(TransformCommand::Abort {
                reason,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

async fn transform_task<I, O, T>(
    mut transformer: T,
    mut transform_rx: UnboundedReceiver<TransformCommand<I>>,
    controller: TransformStreamDefaultController<O>,
    writable_ctrl: WritableStreamDefaultController,
) where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    if let Err(error) = transformer.start(&controller).await {
        controller.error(error);
        return;
    }

    while let Some(cmd) = transform_rx.next().await {
        match cmd {
            TransformCommand::Write { chunk, completion } => {
                // Backpressure mirroring: the transform does not run until
                // the output side has demand. The write this command belongs
                // to stays in flight, so a saturated output throttles the
                // input producer. A teardown unblocks the wait.
                let gate = future::select(
                    controller.readable.wait_for_demand(),
                    writable_ctrl.aborted(),
                )
                .await;
                if matches!(gate, Either::Right(_)) {
                    let _ = completion.send(Err(StreamError::Aborted(None)));
                    continue;
                }
                match transformer.transform(chunk, &controller).await {
                    Ok(()) => {
                        // Let the output task apply the enqueues before the
                        // next gate check reads the queue mirror.
                        controller.readable.barrier().await;
                        let _ = completion.send(Ok(()));
                    }
                    Err(error) => {
                        debug!(%error, "transform failed");
                        controller.error(error.clone());
                        let _ = completion.send(Err(error));
                        break;
                    }
                }
            }
            TransformCommand::Close { completion } => {
                match transformer.flush(&controller).await {
                    Ok(()) => {
                        let _ = controller.readable.close();
                        let _ = completion.send(Ok(()));
                    }
                    Err(error) => {
                        debug!(%error, "transform flush failed");
                        controller.error(error.clone());
                        let _ = completion.send(Err(error));
                    }
                }
                break;
            }
            TransformCommand::Abort { reason, completion } => {
                debug!(?reason, "transform aborted");
                controller.error(StreamError::Aborted(reason));
                let _ = completion.send(Ok(()));
                break;
            }
        }
    }
}

// ----------- TransformStream -----------

/// A connected writable input side and readable output side joined by a
/// [`Transformer`]. Data either waits in the input queue ahead of its
/// transform or sits in the output queue awaiting a reader; the transform
/// itself holds nothing.
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O, TransformReadableSource<O>, Unlocked>,
    writable: WritableStream<I, TransformWritableSink<I>, Unlocked>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    pub fn builder<T>(transformer: T) -> TransformStreamBuilder<I, O, T>
    where
        T: Transformer<I, O>,
    {
        TransformStreamBuilder::new(transformer)
    }

    pub fn readable(self) -> ReadableStream<O, TransformReadableSource<O>, Unlocked> {
        self.readable
    }

    pub fn writable(self) -> WritableStream<I, TransformWritableSink<I>, Unlocked> {
        self.writable
    }

    pub fn split(
        self,
    ) -> (
        ReadableStream<O, TransformReadableSource<O>, Unlocked>,
        WritableStream<I, TransformWritableSink<I>, Unlocked>,
    ) {
        (self.readable, self.writable)
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// An identity transform: a connected readable/writable pair.
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

// ----------- Builder -----------

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
            writable_strategy: Box::new(CountQueuingStrategy::new(1.0)),
            readable_strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn writable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<I> + MaybeSend + MaybeSync + 'static,
    {
        self.writable_strategy = Box::new(strategy);
        self
    }

    pub fn readable_strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<O> + MaybeSend + MaybeSync + 'static,
    {
        self.readable_strategy = Box::new(strategy);
        self
    }

    /// Returns the stream plus ONE future driving both sides and the
    /// transform itself.
    pub fn prepare(self) -> (TransformStream<I, O>, PlatformBoxFutureStatic<()>) {
        let (transform_tx, transform_rx) = unbounded();

        let (readable, readable_task) = ReadableStream::new_inner(
            TransformReadableSource {
                _phantom: PhantomData,
            },
            self.readable_strategy,
        );
        let (writable, writable_task) = WritableStream::new_inner(
            TransformWritableSink { transform_tx },
            self.writable_strategy,
        );

        let controller = TransformStreamDefaultController {
            readable: readable.controller().clone(),
            writable: writable.controller().clone(),
        };
        let writable_ctrl = writable.controller().clone();

        let transform = transform_task(self.transformer, transform_rx, controller, writable_ctrl);
        let task: PlatformBoxFutureStatic<()> = Box::pin(async move {
            futures::join!(readable_task, writable_task, transform);
        });

        (TransformStream { readable, writable }, task)
    }

    /// Builds the stream, handing its combined task future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, task) = self.prepare();
        spawn_fn(task);
        stream
    }
}
