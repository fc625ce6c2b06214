use super::error::StreamError;
use super::notify::{SizeMirror, WakerSet};
use super::queue::SizedQueue;
use super::{CountQueuingStrategy, Locked, QueuingStrategy, Unlocked};
use crate::platform::{BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFutureStatic, SharedPtr};
use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{self, poll_fn},
    stream::{Stream, StreamExt},
};
use parking_lot::RwLock;
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll, Waker},
};
use tracing::{debug, trace};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------

/// Producer side of a readable stream.
///
/// `start` runs once before any command is served; `pull` is invoked when the
/// stream wants more data (never more than one invocation in flight);
/// `cancel` is a best-effort teardown hook whose outcome is reported only to
/// the caller that cancelled.
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Commands and Controller Messages -----------

enum StreamCommand<T> {
    Read {
        completion: oneshot::Sender<StreamResult<Option<T>>>,
    },
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterClosedWaker {
        waker: Waker,
    },
}

enum ControllerMsg<T> {
    Enqueue { chunk: T },
    Close,
    Error(StreamError),
    RegisterDemandWaker { waker: Waker },
    /// Round-trip marker: acknowledged once every message ahead of it has
    /// been applied, so callers can observe an up-to-date queue mirror.
    Barrier { completion: oneshot::Sender<()> },
}

// ----------- Shared Mirrors -----------

/// State published by the stream task for synchronous fast-path checks on
/// handles. Advisory only; the task remains the single writer of record.
struct ReadableShared {
    queue_total_size: SizeMirror,
    high_water_mark: f64,
    closed: AtomicBool,
    errored: AtomicBool,
    close_requested: AtomicBool,
    locked: AtomicBool,
    stored_error: RwLock<Option<StreamError>>,
}

impl ReadableShared {
    fn new(high_water_mark: f64) -> Self {
        Self {
            queue_total_size: SizeMirror::new(0.0),
            high_water_mark,
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            stored_error: RwLock::new(None),
        }
    }

    fn is_terminal(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.errored.load(Ordering::SeqCst)
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .read()
            .clone()
            .unwrap_or(StreamError::InvalidState("stream is errored"))
    }

    /// Room left under the high-water mark; `None` once terminal.
    fn desired_size(&self) -> Option<f64> {
        if self.is_terminal() {
            return None;
        }
        Some(self.high_water_mark - self.queue_total_size.get())
    }
}

// ----------- Controller Handle -----------

/// Handle a [`ReadableSource`] (or a transformer) uses to feed its stream.
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    tx: UnboundedSender<ControllerMsg<T>>,
    shared: SharedPtr<ReadableShared>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: SharedPtr::clone(&self.shared),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    /// Room left under the high-water mark, or `None` once the stream is
    /// closed or errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.desired_size()
    }

    /// Appends a chunk to the stream's queue (or hands it straight to a
    /// waiting reader). Fails once close has been requested or the stream is
    /// terminal.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if self.shared.close_requested.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState("enqueue after close requested"));
        }
        if self.shared.errored.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState("enqueue on errored stream"));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState("enqueue on closed stream"));
        }
        self.tx
            .unbounded_send(ControllerMsg::Enqueue { chunk })
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Requests a close. Chunks already queued are still delivered; the
    /// stream transitions once the queue drains.
    pub fn close(&self) -> StreamResult<()> {
        if self.shared.is_terminal() {
            return Err(StreamError::InvalidState("close on terminated stream"));
        }
        if self.shared.close_requested.swap(true, Ordering::SeqCst) {
            return Err(StreamError::InvalidState("close already requested"));
        }
        self.tx
            .unbounded_send(ControllerMsg::Close)
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Errors the stream: the queue is discarded and every current and future
    /// read fails with `error`.
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.tx
            .unbounded_send(ControllerMsg::Error(error))
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Acknowledged once every controller message sent before it has been
    /// applied, making the queue-size mirror current for the caller.
    pub(crate) async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .unbounded_send(ControllerMsg::Barrier { completion: tx })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Resolves once the queue is back under the high-water mark or the
    /// stream has terminated. This is the gate a transform uses to mirror
    /// output-side backpressure onto its input side.
    pub fn wait_for_demand(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            if self.shared.is_terminal() {
                return Poll::Ready(());
            }
            if self.shared.queue_total_size.get() < self.shared.high_water_mark {
                return Poll::Ready(());
            }
            let _ = self.tx.unbounded_send(ControllerMsg::RegisterDemandWaker {
                waker: cx.waker().clone(),
            });
            Poll::Pending
        })
    }
}

// ----------- Inner State -----------

struct ReadableStreamInner<T, Source> {
    state: StreamState,
    queue: SizedQueue<T>,
    strategy: BoxedStrategy<T>,
    source: Option<Source>,
    close_requested: bool,
    pulling: bool,
    pull_again: bool,
    pull_requested: bool,
    cancel_requested: bool,
    cancel_reason: Option<String>,
    cancel_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
    closed_wakers: WakerSet,
    demand_wakers: WakerSet,
    stored_error: Option<StreamError>,
}

impl<T: MaybeSend + 'static, Source> ReadableStreamInner<T, Source> {
    fn new(source: Source, strategy: BoxedStrategy<T>) -> Self {
        Self {
            state: StreamState::Readable,
            queue: SizedQueue::new(),
            strategy,
            source: Some(source),
            close_requested: false,
            pulling: false,
            pull_again: false,
            pull_requested: false,
            cancel_requested: false,
            cancel_reason: None,
            cancel_completions: Vec::new(),
            pending_reads: VecDeque::new(),
            closed_wakers: WakerSet::new(),
            demand_wakers: WakerSet::new(),
            stored_error: None,
        }
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("stream is errored"))
    }

    /// Pull gating: only while readable, with no close or cancel pending, and
    /// only when a reader is parked or the queue is under the high-water mark.
    fn should_pull(&self, high_water_mark: f64) -> bool {
        self.state == StreamState::Readable
            && !self.close_requested
            && !self.cancel_requested
            && (!self.pending_reads.is_empty() || self.queue.total_size() < high_water_mark)
    }

    /// Records that a pull is wanted. Coalesces onto the in-flight pull when
    /// one is running: at most one extra pull is queued, never a counter.
    fn pull_if_needed(&mut self) {
        if self.pulling {
            self.pull_again = true;
        } else {
            self.pull_requested = true;
        }
    }
}

fn finish_close<T: MaybeSend + 'static, Source>(
    inner: &mut ReadableStreamInner<T, Source>,
    shared: &ReadableShared,
) {
    if inner.state != StreamState::Readable {
        return;
    }
    inner.state = StreamState::Closed;
    shared.closed.store(true, Ordering::SeqCst);
    shared.close_requested.store(true, Ordering::SeqCst);
    while let Some(completion) = inner.pending_reads.pop_front() {
        let _ = completion.send(Ok(None));
    }
    inner.closed_wakers.wake_all();
    inner.demand_wakers.wake_all();
    trace!("readable stream closed");
}

fn error_stream<T: MaybeSend + 'static, Source>(
    inner: &mut ReadableStreamInner<T, Source>,
    shared: &ReadableShared,
    error: StreamError,
) {
    if inner.state != StreamState::Readable {
        return;
    }
    debug!(%error, "readable stream errored");
    inner.state = StreamState::Errored;
    inner.stored_error = Some(error.clone());
    *shared.stored_error.write() = Some(error.clone());
    shared.errored.store(true, Ordering::SeqCst);
    inner.queue.clear();
    shared.queue_total_size.set(0.0);
    while let Some(completion) = inner.pending_reads.pop_front() {
        let _ = completion.send(Err(error.clone()));
    }
    inner.closed_wakers.wake_all();
    inner.demand_wakers.wake_all();
}

// ----------- Stream Task -----------

async fn readable_stream_task<T, Source>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg<T>>,
    mut inner: ReadableStreamInner<T, Source>,
    shared: SharedPtr<ReadableShared>,
    controller: ReadableStreamDefaultController<T>,
) where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    // start() runs to completion before any command is served; commands sent
    // meanwhile wait in the channel.
    if let Some(mut source) = inner.source.take() {
        match source.start(&controller).await {
            Ok(()) => {
                inner.source = Some(source);
                inner.pull_if_needed();
            }
            Err(error) => {
                debug!(%error, "readable source start failed");
                error_stream(&mut inner, &shared, error);
            }
        }
    }

    let mut pull_future: Option<PlatformBoxFutureStatic<(Source, StreamResult<()>)>> = None;
    let mut cancel_future: Option<PlatformBoxFutureStatic<StreamResult<()>>> = None;
    let mut commands_open = true;

    poll_fn(|cx| {
        let hwm = shared.high_water_mark;

        // Controller messages first: a source's enqueue/close must land
        // before the reads that race it.
        while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
            match msg {
                ControllerMsg::Enqueue { chunk } => {
                    if inner.state != StreamState::Readable
                        || inner.close_requested
                        || inner.cancel_requested
                    {
                        trace!("dropping chunk enqueued on closing or terminated stream");
                        continue;
                    }
                    if let Some(completion) = inner.pending_reads.pop_front() {
                        // A reader is parked: hand the chunk over without
                        // charging the queue.
                        let _ = completion.send(Ok(Some(chunk)));
                        inner.pull_if_needed();
                    } else {
                        let size = inner.strategy.size(&chunk);
                        match inner.queue.enqueue(chunk, size) {
                            Ok(()) => {
                                shared.queue_total_size.set(inner.queue.total_size());
                                inner.pull_if_needed();
                            }
                            Err(error) => {
                                // Strategy failure is fatal to the controller.
                                error_stream(&mut inner, &shared, error);
                            }
                        }
                    }
                }
                ControllerMsg::Close => {
                    if inner.state == StreamState::Readable {
                        inner.close_requested = true;
                        shared.close_requested.store(true, Ordering::SeqCst);
                        if inner.queue.is_empty() {
                            finish_close(&mut inner, &shared);
                        }
                    }
                }
                ControllerMsg::Error(error) => {
                    error_stream(&mut inner, &shared, error);
                }
                ControllerMsg::RegisterDemandWaker { waker } => {
                    inner.demand_wakers.register(&waker);
                    if inner.state != StreamState::Readable || inner.queue.total_size() < hwm {
                        inner.demand_wakers.wake_all();
                    }
                }
                ControllerMsg::Barrier { completion } => {
                    let _ = completion.send(());
                }
            }
        }

        // Commands from stream/reader handles.
        loop {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => match cmd {
                    StreamCommand::Read { completion } => {
                        if inner.state == StreamState::Errored {
                            let _ = completion.send(Err(inner.get_stored_error()));
                        } else if let Some((chunk, _)) = inner.queue.dequeue() {
                            shared.queue_total_size.set(inner.queue.total_size());
                            if inner.queue.total_size() < hwm {
                                inner.demand_wakers.wake_all();
                            }
                            let _ = completion.send(Ok(Some(chunk)));
                            if inner.close_requested && inner.queue.is_empty() {
                                finish_close(&mut inner, &shared);
                            } else {
                                inner.pull_if_needed();
                            }
                        } else if inner.state == StreamState::Closed {
                            let _ = completion.send(Ok(None));
                        } else {
                            inner.pending_reads.push_back(completion);
                            inner.pull_if_needed();
                        }
                    }
                    StreamCommand::Cancel { reason, completion } => {
                        if inner.state != StreamState::Readable {
                            // Terminal: a cancel is a no-op reporting success.
                            let _ = completion.send(Ok(()));
                        } else if inner.cancel_requested {
                            inner.cancel_completions.push(completion);
                        } else {
                            debug!(?reason, "readable stream cancelled");
                            inner.cancel_requested = true;
                            inner.cancel_completions.push(completion);
                            inner.queue.clear();
                            shared.queue_total_size.set(0.0);
                            finish_close(&mut inner, &shared);
                            if let Some(mut source) = inner.source.take() {
                                cancel_future =
                                    Some(Box::pin(async move { source.cancel(reason).await }));
                            } else if inner.pulling {
                                // The source is inside the in-flight pull;
                                // tear it down once the pull settles.
                                inner.cancel_reason = reason;
                            } else {
                                inner.cancel_requested = false;
                                for tx in inner.cancel_completions.drain(..) {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                        }
                    }
                    StreamCommand::RegisterClosedWaker { waker } => {
                        inner.closed_wakers.register(&waker);
                        if inner.state != StreamState::Readable {
                            inner.closed_wakers.wake_all();
                        }
                    }
                },
                Poll::Ready(None) => {
                    commands_open = false;
                    break;
                }
                Poll::Pending => break,
            }
        }

        // Drive the cancel teardown. Its outcome goes only to the callers
        // that cancelled; the stream itself is already closed.
        if let Some(fut) = cancel_future.as_mut() {
            if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                inner.cancel_requested = false;
                for tx in inner.cancel_completions.drain(..) {
                    let _ = tx.send(result.clone());
                }
                cancel_future = None;
                cx.waker().wake_by_ref();
            }
        }

        // Start a pull when one was requested and the gate allows it.
        if inner.pull_requested {
            inner.pull_requested = false;
            if inner.pulling {
                inner.pull_again = true;
            } else if inner.should_pull(hwm) {
                if let Some(source) = inner.source.take() {
                    inner.pulling = true;
                    inner.pull_again = false;
                    let ctrl = controller.clone();
                    pull_future = Some(Box::pin(async move {
                        let mut source = source;
                        let result = source.pull(&ctrl).await;
                        (source, result)
                    }));
                }
            }
        }

        // Drive the in-flight pull; a failed pull errors the stream.
        if let Some(fut) = pull_future.as_mut() {
            if let Poll::Ready((source, result)) = fut.as_mut().poll(cx) {
                inner.pulling = false;
                pull_future = None;
                inner.source = Some(source);
                match result {
                    Ok(()) => {
                        if inner.pull_again {
                            inner.pull_again = false;
                            inner.pull_requested = true;
                        }
                    }
                    Err(error) => {
                        error_stream(&mut inner, &shared, error);
                    }
                }
                // A cancel that raced the pull still owes the source its
                // teardown call.
                if inner.cancel_requested && cancel_future.is_none() {
                    if let Some(mut source) = inner.source.take() {
                        let reason = inner.cancel_reason.take();
                        cancel_future = Some(Box::pin(async move { source.cancel(reason).await }));
                    }
                }
                cx.waker().wake_by_ref();
            }
        }

        // All handles gone and nothing left in flight: tear down.
        if !commands_open && pull_future.is_none() && cancel_future.is_none() {
            return Poll::Ready(());
        }

        Poll::Pending
    })
    .await;
}

// ----------- Main ReadableStream -----------

/// A pull/push readable stream of chunks with queue-size backpressure.
///
/// Construction hands back the stream plus its task future; spawn the future
/// on whatever executor drives your program.
pub struct ReadableStream<T: MaybeSend + 'static, Source, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    shared: SharedPtr<ReadableShared>,
    controller: ReadableStreamDefaultController<T>,
    read_receiver: Option<oneshot::Receiver<StreamResult<Option<T>>>>,
    _phantom: PhantomData<fn() -> (Source, LockState)>,
}

impl<T: MaybeSend + 'static, Source, LockState> ReadableStream<T, Source, LockState> {
    fn handle_clone<L>(&self) -> ReadableStream<T, Source, L> {
        ReadableStream {
            command_tx: self.command_tx.clone(),
            shared: SharedPtr::clone(&self.shared),
            controller: self.controller.clone(),
            read_receiver: None,
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    pub(crate) fn controller(&self) -> &ReadableStreamDefaultController<T> {
        &self.controller
    }
}

impl<T: MaybeSend + 'static, Source: ReadableSource<T>> ReadableStream<T, Source, Unlocked> {
    pub fn builder(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    pub(crate) fn new_inner(
        source: Source,
        strategy: BoxedStrategy<T>,
    ) -> (Self, PlatformBoxFutureStatic<()>) {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let shared = SharedPtr::new(ReadableShared::new(strategy.high_water_mark()));

        let controller = ReadableStreamDefaultController {
            tx: ctrl_tx,
            shared: SharedPtr::clone(&shared),
        };

        let inner = ReadableStreamInner::new(source, strategy);
        let task = readable_stream_task(
            command_rx,
            ctrl_rx,
            inner,
            SharedPtr::clone(&shared),
            controller.clone(),
        );

        let stream = Self {
            command_tx,
            shared,
            controller,
            read_receiver: None,
            _phantom: PhantomData,
        };

        (stream, Box::pin(task))
    }
}

impl<T: MaybeSend + 'static> ReadableStream<T, IteratorSource<std::vec::IntoIter<T>>, Unlocked> {
    /// A stream over an owned `Vec`, closing after the last element.
    pub fn from_vec(items: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        Self::builder(IteratorSource::new(items.into_iter()))
    }
}

impl<T, I> ReadableStream<T, IteratorSource<I>, Unlocked>
where
    T: MaybeSend + 'static,
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// A stream over any iterator, closing after the last element.
    pub fn from_iter(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>> {
        Self::builder(IteratorSource::new(iter))
    }
}

impl<T, S> ReadableStream<T, StreamSource<S>, Unlocked>
where
    T: MaybeSend + 'static,
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// A stream adapting any `futures::Stream`, closing when it ends.
    pub fn from_stream(stream: S) -> ReadableStreamBuilder<T, StreamSource<S>> {
        Self::builder(StreamSource::new(stream))
    }
}

impl<T: MaybeSend + 'static, Source, LockState> ReadableStream<T, Source, LockState> {
    /// Cancels the stream, discarding queued chunks and tearing the source
    /// down best-effort.
    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .unbounded_send(StreamCommand::Cancel {
                reason,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

impl<T: MaybeSend + 'static, Source> ReadableStream<T, Source, Unlocked> {
    /// Locks the stream to a single active reader.
    pub fn get_reader(
        &self,
    ) -> Result<
        (
            ReadableStream<T, Source, Locked>,
            ReadableStreamDefaultReader<T, Source>,
        ),
        StreamError,
    > {
        if self
            .shared
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }
        let locked_stream = self.handle_clone::<Locked>();
        let reader = ReadableStreamDefaultReader(self.handle_clone::<Locked>());
        Ok((locked_stream, reader))
    }
}

// ----------- Default Reader -----------

/// Exclusive reading handle obtained from [`ReadableStream::get_reader`].
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static, Source>(
    ReadableStream<T, Source, Locked>,
);

impl<T: MaybeSend + 'static, Source> ReadableStreamDefaultReader<T, Source> {
    /// Reads the next chunk; `Ok(None)` is end-of-stream.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .command_tx
            .unbounded_send(StreamCommand::Read { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        self.0.cancel(reason).await
    }

    /// Resolves when the stream closes; fails with the stored reason when it
    /// errors instead.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            if self.0.shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(self.0.shared.stored_error()));
            }
            if self.0.shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            let _ = self
                .0
                .command_tx
                .unbounded_send(StreamCommand::RegisterClosedWaker {
                    waker: cx.waker().clone(),
                });
            Poll::Pending
        })
        .await
    }

    pub fn release_lock(self) -> ReadableStream<T, Source, Unlocked> {
        let unlocked = self.0.handle_clone::<Unlocked>();
        // Drop runs after and clears the flag again; harmless.
        self.0.shared.locked.store(false, Ordering::SeqCst);
        unlocked
    }
}

impl<T: MaybeSend + 'static, Source> Drop for ReadableStreamDefaultReader<T, Source> {
    fn drop(&mut self) {
        self.0.shared.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- futures::Stream Integration -----------

impl<T: MaybeSend + 'static, Source, LockState> Stream for ReadableStream<T, Source, LockState> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.read_receiver.is_none() {
            if this.shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Some(Err(this.shared.stored_error())));
            }
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Read { completion: tx })
                .is_err()
            {
                return Poll::Ready(Some(Err(StreamError::TaskDropped)));
            }
            this.read_receiver = Some(rx);
        }
        let rx = this.read_receiver.as_mut().expect("receiver just installed");
        match Pin::new(rx).poll(cx) {
            Poll::Ready(outcome) => {
                this.read_receiver = None;
                match outcome {
                    Ok(Ok(Some(chunk))) => Poll::Ready(Some(Ok(chunk))),
                    Ok(Ok(None)) => Poll::Ready(None),
                    Ok(Err(error)) => Poll::Ready(Some(Err(error))),
                    Err(_) => Poll::Ready(Some(Err(StreamError::TaskDropped))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Builder -----------

pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
}

impl<T: MaybeSend + 'static, Source: ReadableSource<T>> ReadableStreamBuilder<T, Source> {
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + MaybeSync + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Returns the stream plus its unspawned task future.
    pub fn prepare(self) -> (ReadableStream<T, Source, Unlocked>, PlatformBoxFutureStatic<()>) {
        ReadableStream::new_inner(self.source, self.strategy)
    }

    /// Builds the stream, handing its task future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, Source, Unlocked>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, task) = self.prepare();
        spawn_fn(task);
        stream
    }
}

// ----------- Bundled Sources -----------

/// Source over any iterator; closes the stream when the iterator ends.
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
    I: Iterator<Item = T> + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.iter.next() {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

/// Source adapting any `futures::Stream`.
pub struct StreamSource<S> {
    stream: S,
}

impl<S> StreamSource<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S, T> ReadableSource<T> for StreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        match self.stream.next().await {
            Some(item) => controller.enqueue(item)?,
            None => controller.close()?,
        }
        Ok(())
    }
}

// ----------- Tee -----------

enum TeeChunk<T> {
    Data(T),
    End,
    Error(StreamError),
}

/// Branch source fed by the tee coordinator.
pub struct TeeSource<T: MaybeSend + 'static> {
    chunk_rx: UnboundedReceiver<TeeChunk<T>>,
    canceled: SharedPtr<AtomicBool>,
}

impl<T: MaybeSend + 'static> ReadableSource<T> for TeeSource<T> {
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        if self.canceled.load(Ordering::SeqCst) {
            controller.close()?;
            return Ok(());
        }
        match self.chunk_rx.next().await {
            Some(TeeChunk::Data(chunk)) => controller.enqueue(chunk)?,
            Some(TeeChunk::End) | None => controller.close()?,
            Some(TeeChunk::Error(error)) => return Err(error),
        }
        Ok(())
    }

    async fn cancel(&mut self, _reason: Option<String>) -> StreamResult<()> {
        self.canceled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn tee_task<T, Source>(
    reader: ReadableStreamDefaultReader<T, Source>,
    branch1_tx: UnboundedSender<TeeChunk<T>>,
    branch2_tx: UnboundedSender<TeeChunk<T>>,
    branch1_canceled: SharedPtr<AtomicBool>,
    branch2_canceled: SharedPtr<AtomicBool>,
) where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    loop {
        let branch1_dead = branch1_canceled.load(Ordering::SeqCst) || branch1_tx.is_closed();
        let branch2_dead = branch2_canceled.load(Ordering::SeqCst) || branch2_tx.is_closed();
        if branch1_dead && branch2_dead {
            let _ = reader
                .cancel(Some("both tee branches terminated".to_string()))
                .await;
            break;
        }
        match reader.read().await {
            Ok(Some(chunk)) => {
                if !branch1_dead && branch1_tx.unbounded_send(TeeChunk::Data(chunk.clone())).is_err()
                {
                    branch1_canceled.store(true, Ordering::SeqCst);
                }
                if !branch2_dead && branch2_tx.unbounded_send(TeeChunk::Data(chunk)).is_err() {
                    branch2_canceled.store(true, Ordering::SeqCst);
                }
            }
            Ok(None) => {
                let _ = branch1_tx.unbounded_send(TeeChunk::End);
                let _ = branch2_tx.unbounded_send(TeeChunk::End);
                break;
            }
            Err(error) => {
                let _ = branch1_tx.unbounded_send(TeeChunk::Error(error.clone()));
                let _ = branch2_tx.unbounded_send(TeeChunk::Error(error));
                break;
            }
        }
    }
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    /// Splits the stream into two branches that each see every chunk.
    ///
    /// The faster consumer drives progress; the slower branch buffers without
    /// bound. Cancelling one branch leaves the other running; cancelling both
    /// cancels the source.
    pub fn tee(
        self,
    ) -> Result<
        (
            ReadableStream<T, TeeSource<T>, Unlocked>,
            ReadableStream<T, TeeSource<T>, Unlocked>,
            PlatformBoxFutureStatic<()>,
        ),
        StreamError,
    > {
        let (_, reader) = self.get_reader()?;

        let (branch1_tx, branch1_rx) = unbounded();
        let (branch2_tx, branch2_rx) = unbounded();
        let branch1_canceled = SharedPtr::new(AtomicBool::new(false));
        let branch2_canceled = SharedPtr::new(AtomicBool::new(false));

        let source1 = TeeSource {
            chunk_rx: branch1_rx,
            canceled: SharedPtr::clone(&branch1_canceled),
        };
        let source2 = TeeSource {
            chunk_rx: branch2_rx,
            canceled: SharedPtr::clone(&branch2_canceled),
        };

        let (stream1, task1) =
            ReadableStream::new_inner(source1, Box::new(CountQueuingStrategy::new(1.0)));
        let (stream2, task2) =
            ReadableStream::new_inner(source2, Box::new(CountQueuingStrategy::new(1.0)));

        let coordinator = tee_task(
            reader,
            branch1_tx,
            branch2_tx,
            branch1_canceled,
            branch2_canceled,
        );

        let task: PlatformBoxFutureStatic<()> = Box::pin(async move {
            futures::join!(coordinator, task1, task2);
        });

        Ok((stream1, stream2, task))
    }
}
