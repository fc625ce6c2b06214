//! Feature-flag coverage: the `send` build must hand out `Send` task futures
//! and `Send + Sync` handles; the `local` build must accept `!Send` sources
//! on a single-threaded spawner. Most of this fails at compile time, not at
//! run time.
//!
//! Run with:
//!   cargo test                                        (send, default)
//!   cargo test --no-default-features --features local

use weir::StreamError;

#[cfg(feature = "send")]
mod send_feature {
    use super::*;
    use weir::{
        IteratorSource, ReadableStream, WritableSink, WritableStream,
        WritableStreamDefaultController,
    };

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    struct NullSink;

    impl WritableSink<String> for NullSink {
        async fn write(
            &mut self,
            _chunk: String,
            _controller: &WritableStreamDefaultController,
        ) -> Result<(), StreamError> {
            Ok(())
        }
    }

    #[test]
    fn handles_are_send_and_sync() {
        assert_send::<ReadableStream<u32, IteratorSource<std::vec::IntoIter<u32>>>>();
        assert_sync::<ReadableStream<u32, IteratorSource<std::vec::IntoIter<u32>>>>();
        assert_send::<WritableStream<String, NullSink>>();
        assert_sync::<WritableStream<String, NullSink>>();
        assert_send::<StreamError>();
        assert_sync::<StreamError>();
    }

    // tokio::spawn requires Send, so this does not compile if the task
    // future loses it.
    #[tokio::test]
    async fn task_futures_spawn_on_a_multi_threaded_runtime() {
        let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn);
        let (_, reader) = stream.get_reader().unwrap();

        let mut collected = Vec::new();
        while let Some(value) = reader.read().await.unwrap() {
            collected.push(value);
        }
        assert_eq!(collected, vec![1, 2, 3]);
    }
}

#[cfg(feature = "local")]
mod local_feature {
    use super::*;
    use std::rc::Rc;
    use tokio::task::LocalSet;
    use weir::{ReadableSource, ReadableStream, ReadableStreamDefaultController};

    // Rc makes this source !Send; only the local build accepts it.
    struct RcSource {
        items: Rc<Vec<u32>>,
        index: usize,
    }

    impl ReadableSource<u32> for RcSource {
        async fn pull(
            &mut self,
            controller: &ReadableStreamDefaultController<u32>,
        ) -> Result<(), StreamError> {
            match self.items.get(self.index) {
                Some(value) => {
                    self.index += 1;
                    controller.enqueue(*value)?;
                }
                None => controller.close()?,
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn non_send_sources_run_on_a_local_spawner() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let stream = ReadableStream::builder(RcSource {
                    items: Rc::new(vec![4, 5, 6]),
                    index: 0,
                })
                .spawn(tokio::task::spawn_local);
                let (_, reader) = stream.get_reader().unwrap();

                let mut collected = Vec::new();
                while let Some(value) = reader.read().await.unwrap() {
                    collected.push(value);
                }
                assert_eq!(collected, vec![4, 5, 6]);
            })
            .await;
    }
}
