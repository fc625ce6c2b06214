use super::error::StreamError;
use super::readable::ReadableStream;
use super::transform::{TransformReadableSource, TransformStream};
use super::writable::{WritableSink, WritableStream};
use super::Unlocked;
use crate::platform::{MaybeSend, PlatformBoxFutureStatic};
use futures::future::{self, AbortRegistration, Abortable, Aborted, Either};
use futures::pin_mut;
use std::future::Future;
use tracing::{debug, trace};

type StreamResult<T> = Result<T, StreamError>;

/// Options for one pipe operation.
///
/// The `prevent_*` flags suppress the corresponding teardown propagation: by
/// default a finished source closes the destination, an errored source aborts
/// it, and an errored destination (or an external abort signal) cancels the
/// source. A `signal` cancels the pipe from outside; both streams are torn
/// down unless prevented and the pipe settles with [`StreamError::Canceled`].
#[derive(Default)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortRegistration>,
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: MaybeSend + 'static,
    Source: 'static,
{
    /// Moves every chunk from this stream into `destination` until the source
    /// ends, either side fails, or the signal fires.
    ///
    /// Locks both streams for the duration of the call. Destination
    /// backpressure pauses reading; terminal states propagate in both
    /// directions per the options. Teardown calls racing a side that already
    /// settled are swallowed; they never fail the pipe on their own.
    pub async fn pipe_to<Sink>(
        self,
        destination: &WritableStream<T, Sink, Unlocked>,
        options: Option<PipeOptions>,
    ) -> StreamResult<()>
    where
        Sink: WritableSink<T>,
    {
        let options = options.unwrap_or_default();
        let (_dest, writer) = destination.get_writer()?;
        let (_stream, reader) = self.get_reader()?;

        let pipe_loop = async {
            loop {
                // The destination's readiness gates every read, so a slow
                // sink pauses the source instead of piling chunks up here.
                if let Err(dest_error) = writer.ready().await {
                    debug!(error = %dest_error, "pipe destination failed");
                    if !options.prevent_cancel {
                        let _ = reader.cancel(Some(dest_error.to_string())).await;
                    }
                    return Err(dest_error);
                }

                // The read races the destination's settlement, so a
                // destination dying while the source is quiet still
                // propagates backward instead of leaving the pipe parked.
                let read = reader.read();
                let dest_settled = writer.closed();
                pin_mut!(read, dest_settled);
                let read_result = match future::select(read, dest_settled).await {
                    Either::Left((read_result, _)) => read_result,
                    Either::Right((dest_outcome, _)) => {
                        let dest_error = match dest_outcome {
                            Ok(()) => StreamError::Closed,
                            Err(error) => error,
                        };
                        debug!(error = %dest_error, "pipe destination settled mid-read");
                        if !options.prevent_cancel {
                            let _ = reader.cancel(Some(dest_error.to_string())).await;
                        }
                        return Err(dest_error);
                    }
                };

                match read_result {
                    Ok(Some(chunk)) => {
                        // Eager enqueue; the per-write completion is dropped
                        // and any failure surfaces through the next `ready`.
                        let _ = writer.write(chunk);
                    }
                    Ok(None) => {
                        if !options.prevent_close {
                            writer.close().await?;
                        }
                        trace!("pipe completed");
                        return Ok(());
                    }
                    Err(source_error) => {
                        debug!(error = %source_error, "pipe source failed");
                        if !options.prevent_abort {
                            let _ = writer.abort(Some(source_error.to_string())).await;
                        }
                        return Err(source_error);
                    }
                }
            }
        };

        if let Some(registration) = options.signal {
            match Abortable::new(pipe_loop, registration).await {
                Ok(result) => result,
                Err(Aborted) => {
                    debug!("pipe canceled by signal");
                    if !options.prevent_cancel {
                        let _ = reader.cancel(Some("pipe canceled".to_string())).await;
                    }
                    if !options.prevent_abort {
                        let _ = writer.abort(Some("pipe canceled".to_string())).await;
                    }
                    Err(StreamError::Canceled)
                }
            }
        } else {
            pipe_loop.await
        }
    }

    /// Pipes this stream through `transform`, handing back a builder whose
    /// `prepare`/`spawn` yield the transform's readable side.
    pub fn pipe_through<O>(
        self,
        transform: TransformStream<T, O>,
        options: Option<PipeOptions>,
    ) -> PipeBuilder<T, O, Source>
    where
        O: MaybeSend + 'static,
    {
        PipeBuilder {
            source: self,
            transform,
            options,
        }
    }
}

/// Deferred `source → transform` hookup produced by
/// [`ReadableStream::pipe_through`].
pub struct PipeBuilder<T, O, Source>
where
    T: MaybeSend + 'static,
    O: MaybeSend + 'static,
{
    source: ReadableStream<T, Source, Unlocked>,
    transform: TransformStream<T, O>,
    options: Option<PipeOptions>,
}

impl<T, O, Source> PipeBuilder<T, O, Source>
where
    T: MaybeSend + 'static,
    O: MaybeSend + 'static,
    Source: 'static,
{
    /// Returns the transform's readable side plus the unspawned pipe future.
    ///
    /// The pipe outcome is only observable from the returned future; spawners
    /// that discard it still see failures on the readable side, which the
    /// transform errors when its input dies.
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<O, TransformReadableSource<O>, Unlocked>,
        impl Future<Output = StreamResult<()>>,
    ) {
        let (readable, writable) = self.transform.split();
        let source = self.source;
        let options = self.options;
        let pipe_future = async move { source.pipe_to(&writable, options).await };
        (readable, pipe_future)
    }

    /// Builds the pipeline, handing the pipe future to `spawn_fn`.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O, TransformReadableSource<O>, Unlocked>
    where
        F: FnOnce(PlatformBoxFutureStatic<()>) -> R,
    {
        let (readable, pipe_future) = self.prepare();
        spawn_fn(Box::pin(async move {
            let _ = pipe_future.await;
        }));
        readable
    }
}
