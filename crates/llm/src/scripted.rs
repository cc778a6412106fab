use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyPromptSnafu, ProviderResult, ProviderStreamHandle, ProviderWorker, ReplyRequest,
    ScriptedSnafu, StreamEventMapped, StreamEventPayload, StreamTarget, TokenSource,
    make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// How a scripted reply ends once its chunks are exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Complete,
    Fail(String),
    /// The source refuses the request before any stream exists.
    RefuseToOpen(String),
    /// The stream closes without a terminal event.
    Truncate,
}

/// Offline token source that replays a fixed list of fragments.
///
/// Every request receives the same script, so it doubles as a deterministic
/// stand-in for a real provider.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    chunks: Vec<String>,
    outcome: ScriptOutcome,
    chunk_delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new<I, S>(chunks: I, outcome: ScriptOutcome) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            outcome,
            chunk_delay: None,
        }
    }

    pub fn completing<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(chunks, ScriptOutcome::Complete)
    }

    /// Streams `text` word by word, as an offline stand-in for a real model.
    pub fn from_text(text: &str) -> Self {
        Self::completing(text.split_inclusive(' '))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(Vec::<String>::new(), ScriptOutcome::Fail(message.into()))
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    async fn run_worker(
        chunks: Vec<String>,
        outcome: ScriptOutcome,
        chunk_delay: Option<Duration>,
        target: StreamTarget,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for chunk in chunks {
            if let Some(delay) = chunk_delay {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        tracing::debug!(target = ?target, "scripted stream cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if cancel_rx.try_recv().is_ok() {
                tracing::debug!(target = ?target, "scripted stream cancelled");
                return;
            }

            let event = StreamEventMapped {
                target: target.clone(),
                payload: StreamEventPayload::Delta(chunk),
            };
            if event_tx.send(event).is_err() {
                return;
            }
        }

        let payload = match outcome {
            ScriptOutcome::Complete => StreamEventPayload::Done,
            ScriptOutcome::Fail(message) | ScriptOutcome::RefuseToOpen(message) => {
                StreamEventPayload::Error(message)
            }
            ScriptOutcome::Truncate => return,
        };
        let _ = event_tx.send(StreamEventMapped { target, payload });
    }
}

impl TokenSource for ScriptedSource {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn stream_reply(&self, request: ReplyRequest) -> ProviderResult<ProviderStreamHandle> {
        if !request.has_content() {
            return EmptyPromptSnafu {
                stage: "scripted-stream-reply",
                target: request.target,
            }
            .fail();
        }

        if let ScriptOutcome::RefuseToOpen(message) = &self.outcome {
            return ScriptedSnafu {
                stage: "scripted-open",
                message: message.clone(),
            }
            .fail();
        }

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_worker(
            self.chunks.clone(),
            self.outcome.clone(),
            self.chunk_delay,
            request.target,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderError;

    fn request() -> ReplyRequest {
        ReplyRequest::new(StreamTarget::new("ai-tutor", 1), "model", Vec::new(), "hi")
    }

    async fn drain(source: &ScriptedSource) -> Vec<StreamEventPayload> {
        let handle = source.stream_reply(request()).unwrap();
        let ProviderStreamHandle { mut stream, worker } = handle;
        tokio::spawn(worker);

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn completing_script_emits_chunks_in_order_then_done() {
        let payloads = drain(&ScriptedSource::completing(["He", "llo!"])).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("He".to_string()),
                StreamEventPayload::Delta("llo!".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test]
    async fn failing_script_emits_only_the_error() {
        let payloads = drain(&ScriptedSource::failing("offline")).await;
        assert_eq!(
            payloads,
            vec![StreamEventPayload::Error("offline".to_string())]
        );
    }

    #[tokio::test]
    async fn truncated_script_closes_without_terminal_event() {
        let source = ScriptedSource::new(["partial"], ScriptOutcome::Truncate);
        let payloads = drain(&source).await;
        assert_eq!(
            payloads,
            vec![StreamEventPayload::Delta("partial".to_string())]
        );
    }

    #[tokio::test]
    async fn text_script_is_split_on_word_boundaries() {
        let payloads = drain(&ScriptedSource::from_text("no key set")).await;
        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("no ".to_string()),
                StreamEventPayload::Delta("key ".to_string()),
                StreamEventPayload::Delta("set".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[test]
    fn refusing_script_fails_at_open() {
        let source = ScriptedSource::new(["x"], ScriptOutcome::RefuseToOpen("no".to_string()));
        assert!(matches!(
            source.stream_reply(request()),
            Err(ProviderError::Scripted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_stream_stops_delayed_worker() {
        let source =
            ScriptedSource::completing(["a", "b", "c"]).with_chunk_delay(Duration::from_millis(50));
        let ProviderStreamHandle { mut stream, worker } = source.stream_reply(request()).unwrap();
        let worker = tokio::spawn(worker);

        let first = stream.recv().await.map(|event| event.payload);
        assert_eq!(first, Some(StreamEventPayload::Delta("a".to_string())));

        stream.cancel();
        worker.await.unwrap();
        assert_eq!(stream.recv().await, None);
    }
}
