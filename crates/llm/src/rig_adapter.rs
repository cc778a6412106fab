use futures::StreamExt;
use rig::OneOrMany;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::message::{ImageMediaType, MimeType, UserContent};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle,
    ProviderWorker, ReplyRequest, Role, StreamEventMapped, StreamEventPayload, StreamTarget,
    TokenSource, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Token source backed by rig's OpenAI-compatible streaming completions.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    /// Rig carries the instruction as the preamble; blank ones are not sent.
    fn preamble(request: &ReplyRequest) -> Option<String> {
        request
            .instruction
            .as_deref()
            .map(str::trim)
            .filter(|instruction| !instruction.is_empty())
            .map(str::to_string)
    }

    fn prompt_message(request: &ReplyRequest) -> RigMessage {
        let mut content = OneOrMany::one(UserContent::text(request.prompt.clone()));
        if let Some(attachment) = &request.attachment {
            content.push(UserContent::image_base64(
                attachment.data_base64.clone(),
                ImageMediaType::from_mime_type(&attachment.mime_type),
                None,
            ));
        }
        RigMessage::User { content }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &ReplyRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let history = request
            .history
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        tracing::debug!(
            target = ?request.target,
            model_id = %request.model_id,
            history_len = history.len(),
            has_attachment = request.attachment.is_some(),
            "opening provider stream"
        );

        let mut builder = model
            .completion_request(Self::prompt_message(request))
            .messages(history);

        if let Some(instruction) = Self::preamble(request) {
            builder = builder.preamble(instruction);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: &StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target: target.clone(),
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        target: &StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                StreamEventPayload::Delta(text.text)
            }
            StreamedAssistantContent::Text(_)
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(StreamEventMapped {
            target: target.clone(),
            payload,
        })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: ReplyRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target.clone();
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, &target, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(&target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, &target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }
}

impl TokenSource for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn stream_reply(&self, request: ReplyRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request.has_content(),
            EmptyPromptSnafu {
                stage: "stream-reply",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InlineAttachment;

    fn request() -> ReplyRequest {
        ReplyRequest::new(
            StreamTarget::new("ai-assistant", 3),
            DEFAULT_OPENAI_MODEL,
            vec![
                ProviderMessage::new(Role::User, "hello"),
                ProviderMessage::new(Role::Assistant, "hi there"),
            ],
            "what is rust?",
        )
    }

    #[test]
    fn instruction_becomes_the_trimmed_preamble() {
        let preamble = RigProviderAdapter::preamble(&request().with_instruction(" Be helpful. "));
        assert_eq!(preamble.as_deref(), Some("Be helpful."));
    }

    #[test]
    fn blank_instruction_sends_no_preamble() {
        assert_eq!(RigProviderAdapter::preamble(&request()), None);
        let blank = request().with_instruction("   ");
        assert_eq!(RigProviderAdapter::preamble(&blank), None);
    }

    #[test]
    fn empty_request_is_rejected_before_spawning() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("openai", "sk-test", "")).unwrap();
        let mut request = request();
        request.prompt.clear();
        let result = adapter.stream_reply(request);
        assert!(matches!(result, Err(ProviderError::EmptyPrompt { .. })));
    }

    #[test]
    fn attachment_only_request_is_accepted() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("openai", "sk-test", "")).unwrap();
        let mut request = request().with_attachment(InlineAttachment {
            mime_type: "image/png".to_string(),
            data_base64: "iVBORw0KGgo=".to_string(),
        });
        request.prompt.clear();
        assert!(adapter.stream_reply(request).is_ok());
    }
}
