use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Routing key for one reply stream.
///
/// The session id changes on every request so stale events can be rejected
/// by whoever consumes the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: String,
    pub session_id: u64,
}

impl StreamTarget {
    pub fn new(conversation_id: impl Into<String>, session_id: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            session_id,
        }
    }
}

/// Speaker role at the provider boundary, decoupled from the engine's sender model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One attachment normalized for transport: a MIME type and its base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAttachment {
    pub mime_type: String,
    pub data_base64: String,
}

/// Everything a token source needs to produce one reply.
///
/// `history` holds the turns that precede `prompt`; the prompt itself is never
/// part of the history.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyRequest {
    pub target: StreamTarget,
    pub model_id: String,
    pub history: Vec<ProviderMessage>,
    pub instruction: Option<String>,
    pub prompt: String,
    pub attachment: Option<InlineAttachment>,
    pub max_tokens: Option<u64>,
}

impl ReplyRequest {
    pub fn new(
        target: StreamTarget,
        model_id: impl Into<String>,
        history: Vec<ProviderMessage>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            target,
            model_id: model_id.into(),
            history,
            instruction: None,
            prompt: prompt.into(),
            attachment: None,
            max_tokens: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_attachment(mut self, attachment: InlineAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn has_content(&self) -> bool {
        !self.prompt.trim().is_empty() || self.attachment.is_some()
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("reply request for {target:?} has neither text nor attachment"))]
    EmptyPrompt {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("scripted stream failed: {message}"))]
    Scripted {
        stage: &'static str,
        message: String,
    },
}

/// Receiving half of a reply stream.
///
/// Dropping it (or calling [`ProviderEventStream::cancel`]) tells the worker to stop.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// External producer of reply text fragments.
///
/// Each call yields a fresh, finite, non-restartable stream.
pub trait TokenSource: Send + Sync {
    fn id(&self) -> &str;
    fn stream_reply(&self, request: ReplyRequest) -> ProviderResult<ProviderStreamHandle>;
}

pub(crate) fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
