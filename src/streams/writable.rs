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
    stream::StreamExt,
    task::AtomicWaker,
};
use parking_lot::RwLock;
use pin_project::pin_project;
use std::{
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
    Writable,
    Erroring,
    Closed,
    Errored,
}

// ----------- Sink Trait -----------

/// Consumer side of a writable stream.
///
/// `write` is invoked for one chunk at a time, strictly in submission order;
/// `close` consumes the sink after the queue drains; `abort` is the teardown
/// hook run when the stream errors. A slow `write` is never interrupted: an
/// abort waits for it to settle (cooperative early exit is available via
/// [`WritableStreamDefaultController::aborted`]).
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    fn start(
        &mut self,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn write(
        &mut self,
        chunk: T,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(()))
    }

    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Commands and Controller Messages -----------

enum StreamCommand<T> {
    Write {
        chunk: T,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Flush {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterReadyWaker {
        waker: Waker,
    },
    RegisterClosedWaker {
        waker: Waker,
    },
}

enum ControllerMsg {
    Error(StreamError),
}

// ----------- Shared Mirrors -----------

struct WritableShared {
    queue_total_size: SizeMirror,
    high_water_mark: f64,
    backpressure: AtomicBool,
    closed: AtomicBool,
    errored: AtomicBool,
    locked: AtomicBool,
    stored_error: RwLock<Option<StreamError>>,
}

impl WritableShared {
    fn new(high_water_mark: f64) -> Self {
        Self {
            queue_total_size: SizeMirror::new(0.0),
            high_water_mark,
            backpressure: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
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

    fn desired_size(&self) -> Option<f64> {
        if self.is_terminal() {
            return None;
        }
        Some((self.high_water_mark - self.queue_total_size.get()).max(0.0))
    }
}

// ----------- Controller Handle -----------

/// Handle a [`WritableSink`] uses to observe and affect its stream.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    erroring: SharedPtr<AtomicBool>,
    erroring_waker: SharedPtr<AtomicWaker>,
}

impl WritableStreamDefaultController {
    fn new(tx: UnboundedSender<ControllerMsg>) -> Self {
        Self {
            tx,
            erroring: SharedPtr::new(AtomicBool::new(false)),
            erroring_waker: SharedPtr::new(AtomicWaker::new()),
        }
    }

    /// Errors the stream: queued writes are rejected and the sink's abort
    /// hook runs once any in-flight operation settles.
    pub fn error(&self, error: StreamError) {
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// Synchronous check of the teardown flag.
    pub fn is_aborted(&self) -> bool {
        self.erroring.load(Ordering::SeqCst)
    }

    /// Resolves once the stream starts erroring. A slow `write` can select
    /// against this to exit early instead of holding teardown up; the write
    /// itself is never forcibly interrupted.
    pub fn aborted(&self) -> impl Future<Output = ()> {
        let flag = SharedPtr::clone(&self.erroring);
        let waker = SharedPtr::clone(&self.erroring_waker);
        poll_fn(move |cx| {
            if flag.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            waker.register(cx.waker());
            if flag.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    fn signal_erroring(&self) {
        self.erroring.store(true, Ordering::SeqCst);
        self.erroring_waker.wake();
    }
}

// ----------- Queue Entries and Inner State -----------

struct PendingWrite<T> {
    chunk: T,
    completion: oneshot::Sender<StreamResult<()>>,
}

enum QueueEntry<T> {
    Write(PendingWrite<T>),
    /// Zero-sized close sentinel; processed when it reaches the queue head.
    Close,
}

struct PendingAbort {
    reason: Option<String>,
    /// The stream was already erroring when this abort arrived; its
    /// completions settle with the stored error rather than the sink-abort
    /// outcome.
    already_erroring: bool,
    completions: Vec<oneshot::Sender<StreamResult<()>>>,
}

struct WritableStreamInner<T, Sink> {
    state: StreamState,
    queue: SizedQueue<QueueEntry<T>>,
    strategy: BoxedStrategy<T>,
    sink: Option<Sink>,
    backpressure: bool,
    close_requested: bool,
    close_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<PendingAbort>,
    stored_error: Option<StreamError>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    /// Flush waiters paired with the number of write completions they still
    /// wait for.
    flush_waiters: Vec<(oneshot::Sender<StreamResult<()>>, usize)>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamInner<T, Sink> {
    fn new(sink: Sink, strategy: BoxedStrategy<T>) -> Self {
        Self {
            state: StreamState::Writable,
            queue: SizedQueue::new(),
            strategy,
            sink: Some(sink),
            backpressure: false,
            close_requested: false,
            close_completions: Vec::new(),
            pending_abort: None,
            stored_error: None,
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
            flush_waiters: Vec::new(),
        }
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::InvalidState("stream is errored"))
    }

    fn set_stored_error(&mut self, shared: &WritableShared, error: StreamError) {
        self.stored_error = Some(error.clone());
        *shared.stored_error.write() = Some(error);
    }

    fn update_backpressure(&mut self, shared: &WritableShared) {
        let prev = self.backpressure;
        self.backpressure = self.queue.total_size() >= shared.high_water_mark;
        shared.backpressure.store(self.backpressure, Ordering::SeqCst);
        if prev && !self.backpressure {
            self.ready_wakers.wake_all();
        }
    }

    fn queued_write_count(&self) -> usize {
        self.queue
            .iter()
            .filter(|entry| matches!(entry, QueueEntry::Write(_)))
            .count()
    }
}

// When a write completes, every pending flush gets one step closer.
fn decrement_flush_counters<T: MaybeSend + 'static, Sink>(inner: &mut WritableStreamInner<T, Sink>) {
    let mut i = 0;
    while i < inner.flush_waiters.len() {
        inner.flush_waiters[i].1 -= 1;
        if inner.flush_waiters[i].1 == 0 {
            let (completion, _) = inner.flush_waiters.swap_remove(i);
            let _ = completion.send(Ok(()));
        } else {
            i += 1;
        }
    }
}

// ----------- Erroring -----------

fn start_erroring<T: MaybeSend + 'static, Sink>(
    inner: &mut WritableStreamInner<T, Sink>,
    shared: &WritableShared,
    controller: &WritableStreamDefaultController,
    error: StreamError,
) {
    if inner.state != StreamState::Writable {
        return;
    }
    debug!(%error, "writable stream erroring");
    inner.set_stored_error(shared, error);
    inner.state = StreamState::Erroring;
    controller.signal_erroring();
}

/// Transitions `Erroring` to `Errored`: rejects everything still queued and
/// hands back the sink-abort future to drive, if there is a sink to tear
/// down.
fn finish_erroring<T, Sink>(
    inner: &mut WritableStreamInner<T, Sink>,
    shared: &WritableShared,
) -> Option<InFlight<Sink>>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let stored = inner.get_stored_error();
    inner.state = StreamState::Errored;
    shared.errored.store(true, Ordering::SeqCst);
    debug!(error = %stored, "writable stream errored");

    for entry in inner.queue.clear() {
        if let QueueEntry::Write(pending) = entry {
            let _ = pending.completion.send(Err(stored.clone()));
        }
    }
    shared.queue_total_size.set(0.0);
    inner.backpressure = false;
    shared.backpressure.store(false, Ordering::SeqCst);

    for completion in inner.close_completions.drain(..) {
        let _ = completion.send(Err(stored.clone()));
    }
    for (completion, _) in inner.flush_waiters.drain(..) {
        let _ = completion.send(Err(stored.clone()));
    }
    inner.ready_wakers.wake_all();
    inner.closed_wakers.wake_all();

    let (reason, completions) = match inner.pending_abort.take() {
        Some(pending) if pending.already_erroring => {
            // The abort joined an erroring already underway; it observes the
            // original failure, not the sink-abort outcome.
            for completion in pending.completions {
                let _ = completion.send(Err(stored.clone()));
            }
            (Some(stored.to_string()), Vec::new())
        }
        Some(pending) => {
            let reason = pending.reason.or(Some(stored.to_string()));
            (reason, pending.completions)
        }
        None => (Some(stored.to_string()), Vec::new()),
    };

    if let Some(mut sink) = inner.sink.take() {
        let fut: PlatformBoxFutureStatic<StreamResult<()>> =
            Box::pin(async move { sink.abort(reason).await });
        Some(InFlight::Abort { fut, completions })
    } else {
        for completion in completions {
            let _ = completion.send(Ok(()));
        }
        None
    }
}

// ----------- In-flight Operations -----------

// The single slot realizing the one-algorithm-at-a-time invariant: a write,
// a close and an abort can never run concurrently on one sink.
enum InFlight<Sink> {
    Write {
        fut: PlatformBoxFutureStatic<(Sink, StreamResult<()>)>,
        completion: Option<oneshot::Sender<StreamResult<()>>>,
    },
    Close {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
        completions: Vec<oneshot::Sender<StreamResult<()>>>,
    },
    Abort {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
        completions: Vec<oneshot::Sender<StreamResult<()>>>,
    },
}

// ----------- Command Processing -----------

fn process_command<T, Sink>(
    cmd: StreamCommand<T>,
    inner: &mut WritableStreamInner<T, Sink>,
    shared: &WritableShared,
    controller: &WritableStreamDefaultController,
    inflight: &Option<InFlight<Sink>>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    match cmd {
        StreamCommand::Write { chunk, completion } => {
            match inner.state {
                StreamState::Errored | StreamState::Erroring => {
                    let _ = completion.send(Err(inner.get_stored_error()));
                    return;
                }
                StreamState::Closed => {
                    let _ = completion.send(Err(StreamError::Closed));
                    return;
                }
                StreamState::Writable => {}
            }
            if inner.close_requested {
                let _ = completion.send(Err(StreamError::Closing));
                return;
            }
            let size = inner.strategy.size(&chunk);
            if !size.is_finite() || size < 0.0 {
                // Strategy failure is fatal to the controller, not just to
                // this write.
                let _ = completion.send(Err(StreamError::InvalidSize(size)));
                start_erroring(inner, shared, controller, StreamError::InvalidSize(size));
                return;
            }
            let _ = inner
                .queue
                .enqueue(QueueEntry::Write(PendingWrite { chunk, completion }), size);
            shared.queue_total_size.set(inner.queue.total_size());
            inner.update_backpressure(shared);
        }
        StreamCommand::Close { completion } => {
            match inner.state {
                StreamState::Errored | StreamState::Erroring => {
                    let _ = completion.send(Err(inner.get_stored_error()));
                    return;
                }
                StreamState::Closed => {
                    let _ = completion.send(Err(StreamError::InvalidState(
                        "close on closed stream",
                    )));
                    return;
                }
                StreamState::Writable => {}
            }
            if inner.close_requested {
                let _ = completion.send(Err(StreamError::CloseAlreadyRequested));
                return;
            }
            inner.close_requested = true;
            inner.close_completions.push(completion);
            let _ = inner.queue.enqueue(QueueEntry::Close, 0.0);
        }
        StreamCommand::Abort { reason, completion } => {
            if inner.state == StreamState::Closed || inner.state == StreamState::Errored {
                // Teardown already happened; aborting again is a no-op.
                let _ = completion.send(Ok(()));
                return;
            }
            if let Some(pending) = inner.pending_abort.as_mut() {
                pending.completions.push(completion);
                return;
            }
            let already_erroring = inner.state == StreamState::Erroring;
            inner.pending_abort = Some(PendingAbort {
                reason: reason.clone(),
                already_erroring,
                completions: vec![completion],
            });
            if !already_erroring {
                start_erroring(inner, shared, controller, StreamError::Aborted(reason));
            }
        }
        StreamCommand::Flush { completion } => {
            if inner.state == StreamState::Errored || inner.state == StreamState::Erroring {
                let _ = completion.send(Err(inner.get_stored_error()));
                return;
            }
            let in_flight_writes = matches!(inflight, Some(InFlight::Write { .. })) as usize;
            let waiting_for = inner.queued_write_count() + in_flight_writes;
            if waiting_for == 0 {
                let _ = completion.send(Ok(()));
            } else {
                inner.flush_waiters.push((completion, waiting_for));
            }
        }
        StreamCommand::RegisterReadyWaker { waker } => {
            inner.ready_wakers.register(&waker);
            if !inner.backpressure || inner.state != StreamState::Writable {
                inner.ready_wakers.wake_all();
            }
        }
        StreamCommand::RegisterClosedWaker { waker } => {
            inner.closed_wakers.register(&waker);
            if inner.state == StreamState::Closed || inner.state == StreamState::Errored {
                inner.closed_wakers.wake_all();
            }
        }
    }
}

// ----------- Stream Task -----------

async fn writable_stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut inner: WritableStreamInner<T, Sink>,
    shared: SharedPtr<WritableShared>,
    controller: WritableStreamDefaultController,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    if let Some(mut sink) = inner.sink.take() {
        match sink.start(&controller).await {
            Ok(()) => inner.sink = Some(sink),
            Err(error) => {
                debug!(%error, "writable sink start failed");
                start_erroring(&mut inner, &shared, &controller, error);
            }
        }
    }

    let mut inflight: Option<InFlight<Sink>> = None;
    let mut commands_open = true;

    poll_fn(|cx| {
        while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
            match msg {
                ControllerMsg::Error(error) => {
                    start_erroring(&mut inner, &shared, &controller, error);
                }
            }
        }

        loop {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(cmd)) => {
                    process_command(cmd, &mut inner, &shared, &controller, &inflight);
                }
                Poll::Ready(None) => {
                    commands_open = false;
                    break;
                }
                Poll::Pending => break,
            }
        }

        // Advance the queue: at most one operation in flight at a time.
        if inflight.is_none() {
            match inner.state {
                StreamState::Erroring => {
                    inflight = finish_erroring(&mut inner, &shared);
                }
                StreamState::Writable => match inner.queue.peek() {
                    Some(QueueEntry::Close) => {
                        let _ = inner.queue.dequeue();
                        shared.queue_total_size.set(inner.queue.total_size());
                        let completions = std::mem::take(&mut inner.close_completions);
                        if let Some(sink) = inner.sink.take() {
                            trace!("writable stream closing");
                            let fut: PlatformBoxFutureStatic<StreamResult<()>> =
                                Box::pin(async move { sink.close().await });
                            inflight = Some(InFlight::Close { fut, completions });
                        } else {
                            inner.state = StreamState::Closed;
                            shared.closed.store(true, Ordering::SeqCst);
                            inner.closed_wakers.wake_all();
                            for completion in completions {
                                let _ = completion.send(Ok(()));
                            }
                        }
                    }
                    Some(QueueEntry::Write(_)) => {
                        if let Some((QueueEntry::Write(pending), _)) = inner.queue.dequeue() {
                            shared.queue_total_size.set(inner.queue.total_size());
                            inner.update_backpressure(&shared);
                            if let Some(mut sink) = inner.sink.take() {
                                let ctrl = controller.clone();
                                let chunk = pending.chunk;
                                inflight = Some(InFlight::Write {
                                    fut: Box::pin(async move {
                                        let result = sink.write(chunk, &ctrl).await;
                                        (sink, result)
                                    }),
                                    completion: Some(pending.completion),
                                });
                            } else {
                                let error = StreamError::InvalidState("sink missing");
                                let _ = pending.completion.send(Err(error.clone()));
                                start_erroring(&mut inner, &shared, &controller, error);
                            }
                        }
                    }
                    None => {}
                },
                StreamState::Closed | StreamState::Errored => {}
            }
        }

        // Drive the in-flight operation.
        match inflight.take() {
            Some(InFlight::Write { mut fut, mut completion }) => match fut.as_mut().poll(cx) {
                Poll::Pending => {
                    inflight = Some(InFlight::Write { fut, completion });
                }
                Poll::Ready((sink, result)) => {
                    decrement_flush_counters(&mut inner);
                    inner.sink = Some(sink);
                    match result {
                        Ok(()) => {
                            if let Some(sender) = completion.take() {
                                let _ = sender.send(Ok(()));
                            }
                            if inner.state == StreamState::Erroring {
                                // An abort arrived mid-write; now that the
                                // write settled, tear down.
                                inflight = finish_erroring(&mut inner, &shared);
                            }
                        }
                        Err(error) => {
                            if let Some(sender) = completion.take() {
                                let _ = sender.send(Err(error.clone()));
                            }
                            start_erroring(&mut inner, &shared, &controller, error);
                            inflight = finish_erroring(&mut inner, &shared);
                        }
                    }
                    cx.waker().wake_by_ref();
                }
            },
            Some(InFlight::Close { mut fut, completions }) => match fut.as_mut().poll(cx) {
                Poll::Pending => {
                    inflight = Some(InFlight::Close { fut, completions });
                }
                Poll::Ready(result) => {
                    match result {
                        Ok(()) => {
                            if inner.state == StreamState::Erroring {
                                // An abort raced the close; erroring wins and
                                // the close is reported failed, but the abort
                                // achieved its teardown.
                                let stored = inner.get_stored_error();
                                inner.state = StreamState::Errored;
                                shared.errored.store(true, Ordering::SeqCst);
                                for completion in completions {
                                    let _ = completion.send(Err(stored.clone()));
                                }
                                if let Some(pending) = inner.pending_abort.take() {
                                    for completion in pending.completions {
                                        let _ = completion.send(Ok(()));
                                    }
                                }
                            } else {
                                inner.state = StreamState::Closed;
                                shared.closed.store(true, Ordering::SeqCst);
                                trace!("writable stream closed");
                                for completion in completions {
                                    let _ = completion.send(Ok(()));
                                }
                            }
                        }
                        Err(error) => {
                            inner.set_stored_error(&shared, error.clone());
                            inner.state = StreamState::Errored;
                            shared.errored.store(true, Ordering::SeqCst);
                            debug!(%error, "writable sink close failed");
                            for completion in completions {
                                let _ = completion.send(Err(error.clone()));
                            }
                            if let Some(pending) = inner.pending_abort.take() {
                                for completion in pending.completions {
                                    let _ = completion.send(Err(error.clone()));
                                }
                            }
                        }
                    }
                    inner.closed_wakers.wake_all();
                    inner.ready_wakers.wake_all();
                    cx.waker().wake_by_ref();
                }
            },
            Some(InFlight::Abort { mut fut, completions }) => match fut.as_mut().poll(cx) {
                Poll::Pending => {
                    inflight = Some(InFlight::Abort { fut, completions });
                }
                Poll::Ready(result) => {
                    // The stream is already Errored; the sink-abort outcome
                    // only settles the abort completions.
                    for completion in completions {
                        let _ = completion.send(result.clone());
                    }
                    cx.waker().wake_by_ref();
                }
            },
            None => {}
        }

        if !commands_open && inflight.is_none() {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;
}

// ----------- Main WritableStream -----------

/// A writable stream draining queued chunks into a [`WritableSink`] one at a
/// time, with queue-size backpressure.
#[pin_project]
pub struct WritableStream<T: MaybeSend + 'static, Sink, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    shared: SharedPtr<WritableShared>,
    controller: WritableStreamDefaultController,
    #[pin]
    flush_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    #[pin]
    close_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    _phantom: PhantomData<fn() -> (Sink, LockState)>,
}

impl<T: MaybeSend + 'static, Sink, LockState> WritableStream<T, Sink, LockState> {
    fn handle_clone<L>(&self) -> WritableStream<T, Sink, L> {
        WritableStream {
            command_tx: self.command_tx.clone(),
            shared: SharedPtr::clone(&self.shared),
            controller: self.controller.clone(),
            flush_receiver: None,
            close_receiver: None,
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    /// Room left under the high-water mark, or `None` once terminal.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.desired_size()
    }

    pub(crate) fn controller(&self) -> &WritableStreamDefaultController {
        &self.controller
    }

    fn send_command(&self, cmd: StreamCommand<T>) -> StreamResult<()> {
        self.command_tx
            .unbounded_send(cmd)
            .map_err(|_| StreamError::TaskDropped)
    }
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    pub(crate) fn new_inner(
        sink: Sink,
        strategy: BoxedStrategy<T>,
    ) -> (Self, PlatformBoxFutureStatic<()>) {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let shared = SharedPtr::new(WritableShared::new(strategy.high_water_mark()));
        let controller = WritableStreamDefaultController::new(ctrl_tx);

        let inner = WritableStreamInner::new(sink, strategy);
        let task = writable_stream_task(
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
            flush_receiver: None,
            close_receiver: None,
            _phantom: PhantomData,
        };

        (stream, Box::pin(task))
    }

    /// Aborts the stream: queued writes are rejected and the sink is torn
    /// down. A no-op reporting success once the stream is terminal.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(StreamCommand::Abort {
            reason,
            completion: tx,
        })?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// Closes the stream after every queued write drains.
    pub async fn close(&self) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(StreamCommand::Close { completion: tx })?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// Locks the stream to a single active writer.
    pub fn get_writer(
        &self,
    ) -> Result<
        (
            WritableStream<T, Sink, Locked>,
            WritableStreamDefaultWriter<T, Sink>,
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
        let writer = WritableStreamDefaultWriter {
            stream: self.handle_clone::<Locked>(),
        };
        Ok((locked_stream, writer))
    }
}

// ----------- Default Writer -----------

/// Exclusive writing handle obtained from [`WritableStream::get_writer`].
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    stream: WritableStream<T, Sink, Locked>,
}

impl<T, Sink> WritableStreamDefaultWriter<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    /// Enqueues a chunk immediately and returns a future that resolves when
    /// the sink has processed it.
    ///
    /// The chunk is queued whether or not the future is awaited; callers that
    /// care about memory should await [`ready`](Self::ready) (or each write)
    /// so the queue cannot grow without bound.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let (tx, rx) = oneshot::channel();
        let sent = self.stream.send_command(StreamCommand::Write {
            chunk,
            completion: tx,
        });
        async move {
            sent?;
            rx.await.unwrap_or(Err(StreamError::TaskDropped))
        }
    }

    /// Resolves when the queue is under the high-water mark; fails once the
    /// stream is closed or errored.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + '_ {
        poll_fn(move |cx| {
            let shared = &self.stream.shared;
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Err(StreamError::Closed));
            }
            if !shared.backpressure.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            let _ = self
                .stream
                .send_command(StreamCommand::RegisterReadyWaker {
                    waker: cx.waker().clone(),
                });
            // Re-check after registering so a clear that raced the
            // registration is not missed.
            if !shared.backpressure.load(Ordering::SeqCst) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })
    }

    pub async fn close(&self) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.stream
            .send_command(StreamCommand::Close { completion: tx })?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.stream.send_command(StreamCommand::Abort {
            reason,
            completion: tx,
        })?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// Resolves when the stream closes; fails with the stored reason when it
    /// errors instead.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            let shared = &self.stream.shared;
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            let _ = self
                .stream
                .send_command(StreamCommand::RegisterClosedWaker {
                    waker: cx.waker().clone(),
                });
            Poll::Pending
        })
        .await
    }

    pub fn desired_size(&self) -> Option<f64> {
        self.stream.shared.desired_size()
    }

    pub fn release_lock(self) -> WritableStream<T, Sink, Unlocked> {
        let unlocked = self.stream.handle_clone::<Unlocked>();
        self.stream.shared.locked.store(false, Ordering::SeqCst);
        unlocked
    }
}

impl<T: MaybeSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        self.stream.shared.locked.store(false, Ordering::SeqCst);
    }
}

// ----------- futures::Sink Integration -----------

impl<T, SinkType> futures::Sink<T> for WritableStream<T, SinkType, Unlocked>
where
    T: MaybeSend + 'static,
    SinkType: WritableSink<T>,
{
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(self.shared.stored_error()));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Closed));
        }
        if !self.shared.backpressure.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        let _ = self.send_command(StreamCommand::RegisterReadyWaker {
            waker: cx.waker().clone(),
        });
        if !self.shared.backpressure.load(Ordering::SeqCst) {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.shared.errored.load(Ordering::SeqCst) {
            return Err(self.shared.stored_error());
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let (tx, _rx) = oneshot::channel();
        self.send_command(StreamCommand::Write {
            chunk: item,
            completion: tx,
        })
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.shared.stored_error()));
        }
        if this.flush_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Flush { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.flush_receiver.set(Some(rx));
        }
        let rx = this
            .flush_receiver
            .as_mut()
            .as_pin_mut()
            .expect("receiver just installed");
        match rx.poll(cx) {
            Poll::Ready(outcome) => {
                this.flush_receiver.set(None);
                Poll::Ready(outcome.unwrap_or(Err(StreamError::TaskDropped)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        if this.shared.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.shared.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.shared.stored_error()));
        }
        if this.close_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.close_receiver.set(Some(rx));
        }
        let rx = this
            .close_receiver
            .as_mut()
            .as_pin_mut()
            .expect("receiver just installed");
        match rx.poll(cx) {
            Poll::Ready(outcome) => {
                this.close_receiver.set(None);
                Poll::Ready(outcome.unwrap_or(Err(StreamError::TaskDropped)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Builder -----------

pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
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
    pub fn prepare(self) -> (WritableStream<T, Sink, Unlocked>, PlatformBoxFutureStatic<()>) {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Builds the stream, handing its task future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Sink, Unlocked>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (stream, task) = self.prepare();
        spawn_fn(task);
        stream
    }
}

#[cfg(all(test, feature = "send"))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: SharedPtr<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self::default()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl WritableSink<u32> for RecordingSink {
        async fn write(
            &mut self,
            chunk: u32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.log.lock().push(format!("write:{chunk}"));
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.log.lock().push("close".into());
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log
                .lock()
                .push(format!("abort:{}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_writes_in_order_then_closes_sink_once() {
        let sink = RecordingSink::new();
        let stream = WritableStream::builder(sink.clone())
            .strategy(CountQueuingStrategy::new(4.0))
            .spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().expect("failed to get writer");

        writer.write(1).await.unwrap();
        writer.write(2).await.unwrap();
        writer.write(3).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(sink.log(), vec!["write:1", "write:2", "write:3", "close"]);
        writer.closed().await.unwrap();
    }

    struct SlowCloseSink {
        log: SharedPtr<Mutex<Vec<String>>>,
        close_gate: SharedPtr<tokio::sync::Notify>,
    }

    impl WritableSink<u32> for SlowCloseSink {
        async fn write(
            &mut self,
            chunk: u32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.log.lock().push(format!("write:{chunk}"));
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.close_gate.notified().await;
            self.log.lock().push("close".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_after_close_request_fail() {
        let log = SharedPtr::new(Mutex::new(Vec::new()));
        let close_gate = SharedPtr::new(tokio::sync::Notify::new());
        let stream = WritableStream::builder(SlowCloseSink {
            log: SharedPtr::clone(&log),
            close_gate: SharedPtr::clone(&close_gate),
        })
        .spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        let mut close = Box::pin(writer.close());
        // One poll sends the close command; the sink's close then hangs on
        // the gate, leaving the stream in its closing phase.
        assert!(futures::poll!(&mut close).is_pending());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let write_result = writer.write(9).await;
        assert!(matches!(write_result, Err(StreamError::Closing)));

        close_gate.notify_one();
        close.await.unwrap();
        assert_eq!(log.lock().clone(), vec!["close"]);
    }

    #[tokio::test]
    async fn second_close_is_rejected() {
        let sink = RecordingSink::new();
        let stream = WritableStream::builder(sink).spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        let first = writer.close();
        let second = writer.close();
        let (first_result, second_result) = futures::join!(first, second);

        first_result.unwrap();
        assert!(matches!(
            second_result,
            Err(StreamError::CloseAlreadyRequested) | Err(StreamError::InvalidState(_))
        ));
    }

    struct GatedSink {
        log: SharedPtr<Mutex<Vec<String>>>,
        gate: SharedPtr<tokio::sync::Notify>,
        released: SharedPtr<AtomicBool>,
    }

    impl GatedSink {
        fn new() -> (Self, SharedPtr<Mutex<Vec<String>>>, SharedPtr<tokio::sync::Notify>) {
            let log = SharedPtr::new(Mutex::new(Vec::new()));
            let gate = SharedPtr::new(tokio::sync::Notify::new());
            (
                Self {
                    log: SharedPtr::clone(&log),
                    gate: SharedPtr::clone(&gate),
                    released: SharedPtr::new(AtomicBool::new(false)),
                },
                log,
                gate,
            )
        }
    }

    impl WritableSink<u32> for GatedSink {
        async fn write(
            &mut self,
            chunk: u32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            if !self.released.load(Ordering::SeqCst) {
                self.gate.notified().await;
                self.released.store(true, Ordering::SeqCst);
            }
            self.log.lock().push(format!("write:{chunk}"));
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.log
                .lock()
                .push(format!("abort:{}", reason.unwrap_or_default()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn abort_defers_to_the_write_in_flight() {
        let (sink, log, gate) = GatedSink::new();
        let stream = WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(8.0))
            .spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        let first = writer.write(1);
        let second = writer.write(2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abort = tokio::spawn({
            let stream = writer.release_lock();
            async move { stream.abort(Some("teardown".into())).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The in-flight write is still running: nothing aborted yet.
        assert_eq!(log.lock().len(), 0);

        gate.notify_one();
        abort.await.unwrap().unwrap();

        // The write settled before the sink was aborted, and the queued
        // second write never reached the sink.
        assert_eq!(log.lock().clone(), vec!["write:1", "abort:teardown"]);
        first.await.unwrap();
        assert!(matches!(second.await, Err(StreamError::Aborted(_))));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let sink = RecordingSink::new();
        let stream = WritableStream::builder(sink.clone()).spawn(tokio::spawn);

        stream.abort(Some("first".into())).await.unwrap();
        stream.abort(Some("second".into())).await.unwrap();

        assert_eq!(sink.log(), vec!["abort:first"]);
    }

    #[tokio::test]
    async fn sink_write_failure_errors_the_stream() {
        struct FailingSink;
        impl WritableSink<u32> for FailingSink {
            async fn write(
                &mut self,
                _chunk: u32,
                _controller: &WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Err(StreamError::from("disk full"))
            }
            async fn abort(&mut self, _reason: Option<String>) -> StreamResult<()> {
                Ok(())
            }
        }

        let stream = WritableStream::builder(FailingSink).spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        let first = writer.write(1).await.unwrap_err();
        let second = writer.write(2).await.unwrap_err();
        assert_eq!(first.to_string(), "disk full");
        assert_eq!(second.to_string(), "disk full");
        assert!(writer.closed().await.is_err());
    }

    #[tokio::test]
    async fn invalid_strategy_size_is_fatal() {
        struct NanStrategy;
        impl QueuingStrategy<u32> for NanStrategy {
            fn size(&self, _chunk: &u32) -> f64 {
                f64::NAN
            }
            fn high_water_mark(&self) -> f64 {
                1.0
            }
        }

        let sink = RecordingSink::new();
        let stream = WritableStream::builder(sink.clone())
            .strategy(NanStrategy)
            .spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        assert!(matches!(
            writer.write(1).await,
            Err(StreamError::InvalidSize(_))
        ));
        // The whole stream is gone, not just the one write; nothing ever
        // reached the sink's write hook.
        assert!(writer.write(2).await.is_err());
        assert!(sink.log().iter().all(|entry| entry.starts_with("abort:")));
    }

    #[tokio::test]
    async fn ready_tracks_backpressure() {
        let (sink, log, gate) = GatedSink::new();
        let stream = WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(1.0))
            .spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        // First write goes straight into flight; the queue is empty.
        let first = writer.write(1);
        writer.ready().await.unwrap();

        // Second write sits in the queue at the mark: backpressure.
        let second = writer.write(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            timeout(Duration::from_millis(30), writer.ready()).await.is_err(),
            "ready resolved under backpressure"
        );

        gate.notify_one();
        first.await.unwrap();
        second.await.unwrap();
        writer.ready().await.unwrap();
        assert_eq!(log.lock().clone(), vec!["write:1", "write:2"]);
    }

    #[tokio::test]
    async fn controller_error_tears_the_stream_down() {
        struct ErroringSink;
        impl WritableSink<u32> for ErroringSink {
            async fn write(
                &mut self,
                chunk: u32,
                controller: &WritableStreamDefaultController,
            ) -> StreamResult<()> {
                if chunk == 2 {
                    controller.error(StreamError::from("poisoned chunk"));
                }
                Ok(())
            }
        }

        let stream = WritableStream::builder(ErroringSink).spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();

        writer.write(1).await.unwrap();
        writer.write(2).await.unwrap();
        let failed = writer.write(3).await.unwrap_err();
        assert_eq!(failed.to_string(), "poisoned chunk");
    }

    #[tokio::test]
    async fn futures_sink_interface_delivers_chunks() {
        use futures::SinkExt;

        let sink = RecordingSink::new();
        let mut stream = WritableStream::builder(sink.clone())
            .strategy(CountQueuingStrategy::new(4.0))
            .spawn(tokio::spawn);

        stream.send(7).await.unwrap();
        stream.send(8).await.unwrap();
        SinkExt::close(&mut stream).await.unwrap();

        assert_eq!(sink.log(), vec!["write:7", "write:8", "close"]);
    }

    #[tokio::test]
    async fn writer_lock_is_exclusive() {
        let stream = WritableStream::builder(RecordingSink::new()).spawn(tokio::spawn);
        let (_, writer) = stream.get_writer().unwrap();
        assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));

        let stream = writer.release_lock();
        assert!(stream.get_writer().is_ok());
    }
}
