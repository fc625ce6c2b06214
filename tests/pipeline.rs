//! End-to-end pipelines over the public surface: a source piped through a
//! transform into a sink, plus the `futures` Stream/Sink interop.

#![cfg(feature = "send")]

use futures::{future, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use weir::platform::MaybeSend;
use weir::{
    CountQueuingStrategy, ReadableStream, StreamError, TransformStream,
    TransformStreamDefaultController, Transformer, WritableSink, WritableStream,
    WritableStreamDefaultController,
};

type StreamResult<T> = Result<T, StreamError>;

#[derive(Clone, Default)]
struct RecordingSink {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl WritableSink<String> for RecordingSink {
    async fn write(
        &mut self,
        chunk: String,
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

struct Uppercase;

impl Transformer<String, String> for Uppercase {
    fn transform(
        &mut self,
        chunk: String,
        controller: &TransformStreamDefaultController<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk.to_uppercase()))
    }
}

#[tokio::test]
async fn source_through_transform_into_sink() {
    let source =
        ReadableStream::from_vec(vec!["one".to_string(), "two".to_string()]).spawn(tokio::spawn);
    let transform = TransformStream::builder(Uppercase).spawn(tokio::spawn);

    let sink = RecordingSink::default();
    let destination = WritableStream::builder(sink.clone())
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn);

    let transformed = source.pipe_through(transform, None).spawn(tokio::spawn);
    transformed.pipe_to(&destination, None).await.unwrap();

    assert_eq!(sink.log(), vec!["write:ONE", "write:TWO", "close"]);
}

#[tokio::test]
async fn chained_transforms_compose() {
    struct Exclaim;
    impl Transformer<String, String> for Exclaim {
        fn transform(
            &mut self,
            chunk: String,
            controller: &TransformStreamDefaultController<String>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.enqueue(format!("{chunk}!")))
        }
    }

    let source = ReadableStream::from_vec(vec!["a".to_string(), "b".to_string()])
        .spawn(tokio::spawn);
    let upper = TransformStream::builder(Uppercase).spawn(tokio::spawn);
    let exclaim = TransformStream::builder(Exclaim).spawn(tokio::spawn);

    let readable = source
        .pipe_through(upper, None)
        .spawn(tokio::spawn)
        .pipe_through(exclaim, None)
        .spawn(tokio::spawn);

    let (_, reader) = readable.get_reader().unwrap();
    assert_eq!(reader.read().await.unwrap().as_deref(), Some("A!"));
    assert_eq!(reader.read().await.unwrap().as_deref(), Some("B!"));
    assert_eq!(reader.read().await.unwrap(), None);
}

#[tokio::test]
async fn readable_stream_works_with_stream_combinators() {
    let stream = ReadableStream::from_iter(1u32..=5).spawn(tokio::spawn);

    let doubled: Vec<u32> = stream.map(|chunk| chunk.unwrap() * 2).collect().await;
    assert_eq!(doubled, vec![2, 4, 6, 8, 10]);
}

#[tokio::test]
async fn from_stream_adapts_a_futures_stream() {
    let upstream = futures::stream::iter(vec!["x", "y", "z"]);
    let stream = ReadableStream::from_stream(upstream).spawn(tokio::spawn);
    let (_, reader) = stream.get_reader().unwrap();

    assert_eq!(reader.read().await.unwrap(), Some("x"));
    assert_eq!(reader.read().await.unwrap(), Some("y"));
    assert_eq!(reader.read().await.unwrap(), Some("z"));
    assert_eq!(reader.read().await.unwrap(), None);
}

#[tokio::test]
async fn writable_stream_works_as_a_futures_sink() {
    let sink = RecordingSink::default();
    let mut destination = WritableStream::builder(sink.clone())
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn);

    futures::stream::iter(vec!["p".to_string(), "q".to_string()])
        .map(Ok::<_, StreamError>)
        .forward(&mut destination)
        .await
        .unwrap();

    assert_eq!(sink.log(), vec!["write:p", "write:q", "close"]);
}

#[tokio::test]
async fn transform_errors_reach_the_far_ends_of_the_pipeline() {
    struct Brittle;
    impl Transformer<String, String> for Brittle {
        fn transform(
            &mut self,
            chunk: String,
            controller: &TransformStreamDefaultController<String>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            let result = if chunk == "bad" {
                Err(StreamError::from("bad chunk"))
            } else {
                controller.enqueue(chunk)
            };
            future::ready(result)
        }
    }

    let source = ReadableStream::from_vec(vec!["ok".to_string(), "bad".to_string()])
        .spawn(tokio::spawn);
    let transform = TransformStream::builder(Brittle).spawn(tokio::spawn);

    let sink = RecordingSink::default();
    let destination = WritableStream::builder(sink.clone())
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn);

    let readable = source.pipe_through(transform, None).spawn(tokio::spawn);
    let outcome = readable.pipe_to(&destination, None).await;

    assert!(outcome.is_err());
    let log = sink.log();
    assert!(log.contains(&"write:ok".to_string()));
    assert!(
        log.iter().any(|e| e.starts_with("abort:")),
        "destination was not aborted: {log:?}"
    );
}
