use anyhow::{anyhow, Result};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;

use crate::chunker::WordChunker;
use crate::config::SamplingParams;
use crate::model::TextGenerator;
use crate::prompt::ChatMessage;

/// Words buffered between the generation thread and the HTTP response.
pub const CHUNK_BUFFER: usize = 100;

/// The one model instance every request goes through.
pub type SharedGenerator = Arc<Mutex<Box<dyn TextGenerator>>>;

/// Runs one generation in the background and streams its words.
///
/// The engine lock is awaited on the async side, so queued requests wait in
/// FIFO order without tying up blocking threads. Once acquired, the guard
/// moves to a blocking thread that drives the generator and pushes words
/// into a bounded channel. A generation error or panic arrives as the last
/// item. Dropping the stream stops generation at the next word.
pub fn spawn_generation(
    engine: SharedGenerator,
    messages: Vec<ChatMessage>,
    params: SamplingParams,
) -> ReceiverStream<Result<String>> {
    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);

    tokio::spawn(async move {
        let guard = engine.lock_owned().await;
        if tx.is_closed() {
            tracing::debug!("Client left before generation started, skipping");
            return;
        }
        tracing::debug!("Acquired model for generation");

        let error_tx = tx.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_generation(guard, &messages, &params, &tx)
        })
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_err) => Some(anyhow!("Generation thread panicked: {}", join_err)),
        };
        if let Some(e) = failure {
            tracing::error!(error = %e, "Error generating response");
            let _ = error_tx.send(Err(e)).await;
        }
    });

    ReceiverStream::new(rx)
}

fn run_generation(
    mut engine: OwnedMutexGuard<Box<dyn TextGenerator>>,
    messages: &[ChatMessage],
    params: &SamplingParams,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let mut chunker = WordChunker::new();

    engine.generate(messages, params, &mut |text: &str| {
        for word in chunker.push(text) {
            if tx.blocking_send(Ok(word)).is_err() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    })?;

    if let Some(word) = chunker.finish() {
        let _ = tx.blocking_send(Ok(word));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGenerator, Step};
    use futures::StreamExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn shared(generator: ScriptedGenerator) -> SharedGenerator {
        let generator: Box<dyn TextGenerator> = Box::new(generator);
        Arc::new(Mutex::new(generator))
    }

    async fn collect(stream: ReceiverStream<Result<String>>) -> Vec<std::result::Result<String, String>> {
        stream
            .map(|item| item.map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn fragments_arrive_as_words() {
        let engine = shared(ScriptedGenerator::new(vec![
            Step::emit("Super"),
            Step::emit("position is "),
            Step::emit("neat"),
        ]));

        let items = collect(spawn_generation(engine, vec![], SamplingParams::default())).await;
        assert_eq!(
            items,
            vec![
                Ok("Superposition ".to_string()),
                Ok("is ".to_string()),
                Ok("neat ".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failure_is_the_last_item() {
        let engine = shared(ScriptedGenerator::new(vec![
            Step::emit("partial answer "),
            Step::fail("device lost"),
            Step::emit("never sent"),
        ]));

        let items = collect(spawn_generation(engine, vec![], SamplingParams::default())).await;
        assert_eq!(
            items,
            vec![
                Ok("partial ".to_string()),
                Ok("answer ".to_string()),
                Err("device lost".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn panic_is_reported_as_error() {
        let engine = shared(ScriptedGenerator::new(vec![Step::Panic]));

        let items = collect(spawn_generation(engine, vec![], SamplingParams::default())).await;
        assert_eq!(items.len(), 1);
        let err = items[0].clone().unwrap_err();
        assert!(err.contains("panicked"), "{}", err);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn generations_never_overlap() {
        let generator = ScriptedGenerator::new(vec![
            Step::emit("one "),
            Step::Sleep(Duration::from_millis(50)),
            Step::emit("two "),
        ]);
        let max_active = generator.max_active.clone();
        let engine = shared(generator);

        let streams: Vec<_> = (0..3)
            .map(|_| spawn_generation(engine.clone(), vec![], SamplingParams::default()))
            .collect();
        for stream in streams {
            assert_eq!(collect(stream).await.len(), 2);
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_stream_stops_generation() {
        let generator = ScriptedGenerator::new(
            std::iter::repeat_with(|| Step::emit("word "))
                .take(10_000)
                .collect(),
        );
        let stopped = generator.stopped_early.clone();
        let engine = shared(generator);

        let mut stream = spawn_generation(engine.clone(), vec![], SamplingParams::default());
        assert!(stream.next().await.is_some());
        drop(stream);

        // The lock frees up once the generator noticed and returned.
        let guard = tokio::time::timeout(Duration::from_secs(5), engine.lock())
            .await
            .expect("generator kept running after the client left");
        drop(guard);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_request_is_skipped_when_its_client_left() {
        let generator = ScriptedGenerator::new(vec![
            Step::Sleep(Duration::from_millis(200)),
            Step::emit("answer "),
        ]);
        let seen = generator.seen.clone();
        let engine = shared(generator);

        let first = spawn_generation(engine.clone(), vec![], SamplingParams::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = spawn_generation(engine.clone(), vec![], SamplingParams::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(second);

        assert_eq!(collect(first).await, vec![Ok("answer ".to_string())]);

        // FIFO lock: once this is acquired the queued request has had its turn.
        drop(engine.lock().await);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
