//! Backpressure-aware readable, writable and transform streams plus a pipe
//! engine that moves chunks between them.
//!
//! Every stream owns a task future returned at construction time; hand it to
//! whatever spawner your executor provides (`tokio::spawn`,
//! `tokio::task::spawn_local`, a `LocalPool` spawner, ...). The engine itself
//! never names a runtime.

pub mod platform;
pub mod streams;

pub use streams::{
    error::StreamError,
    pipe::{PipeBuilder, PipeOptions},
    queue::SizedQueue,
    readable::{
        IteratorSource, ReadableSource, ReadableStream, ReadableStreamBuilder,
        ReadableStreamDefaultController, ReadableStreamDefaultReader, StreamSource, TeeSource,
    },
    transform::{
        IdentityTransformer, TransformReadableSource, TransformStream, TransformStreamBuilder,
        TransformStreamDefaultController, TransformWritableSink, Transformer,
    },
    writable::{
        WritableSink, WritableStream, WritableStreamBuilder, WritableStreamDefaultController,
        WritableStreamDefaultWriter,
    },
    ByteLengthQueuingStrategy, CountQueuingStrategy, Locked, QueuingStrategy, Unlocked,
};
