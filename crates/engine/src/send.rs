use courier_llm::{ProviderMessage, ReplyRequest, Role};
use snafu::ensure;

use super::config::EngineConfig;
use super::error::{EngineResult, ReplyInFlightSnafu};
use super::ids::{ConversationId, MessageId};
use super::model::{Attachment, Conversation, Message, Sender};
use super::store::Mutation;
use super::stream::{SessionTicket, StreamIntegrator};

/// Content the user is about to send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }
}

/// A reply session opened by a send, together with the request that should feed it.
#[derive(Debug, Clone)]
pub struct PendingReply {
    pub ticket: SessionTicket,
    pub request: ReplyRequest,
}

#[derive(Debug, Clone)]
pub struct CommittedSend {
    pub message_id: MessageId,
    pub reply: Option<PendingReply>,
}

/// Commits a user message to the store and, for generated conversations, opens the
/// reply session in the same critical section.
///
/// Returns `Ok(None)` when the conversation no longer exists or there is nothing to send.
pub fn commit_send(
    integrator: &StreamIntegrator,
    config: &EngineConfig,
    conversation_id: &ConversationId,
    outgoing: OutgoingMessage,
) -> EngineResult<Option<CommittedSend>> {
    if outgoing.is_empty() {
        tracing::debug!(conversation_id = %conversation_id, "ignoring empty send");
        return Ok(None);
    }

    let store = integrator.store();
    let snapshot = store.snapshot();
    let Some(conversation) = snapshot.conversation(conversation_id) else {
        tracing::debug!(conversation_id = %conversation_id, "send target is gone");
        return Ok(None);
    };
    ensure!(
        !conversation.awaiting_reply,
        ReplyInFlightSnafu {
            stage: "send",
            conversation_id: conversation_id.to_string(),
        }
    );

    let now = integrator.clock().now();
    let message = Message::outgoing(MessageId::new_v7(), outgoing.text, now, outgoing.attachment);
    let message_id = message.id;

    if !conversation.is_remote_generated() {
        let mutation = Mutation::Send {
            conversation_id: conversation_id.clone(),
            message,
            reply_placeholder: None,
        };
        return match store.try_apply(&mutation) {
            Ok(_) => Ok(Some(CommittedSend {
                message_id,
                reply: None,
            })),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        };
    }

    let placeholder = Message::reply_placeholder(MessageId::new_v7(), conversation_id.clone(), now);
    let ticket = match integrator.open(conversation_id, message.clone(), placeholder) {
        Ok(ticket) => ticket,
        Err(error) if error.is_not_found() => return Ok(None),
        Err(error) => return Err(error),
    };
    // History comes from the snapshot read before the send was committed.
    let request = build_reply_request(conversation, &ticket, config, &message);
    Ok(Some(CommittedSend {
        message_id,
        reply: Some(PendingReply { ticket, request }),
    }))
}

/// Builds the token source request from the history that precedes `message`.
pub fn build_reply_request(
    conversation: &Conversation,
    ticket: &SessionTicket,
    config: &EngineConfig,
    message: &Message,
) -> ReplyRequest {
    let history = conversation
        .messages
        .iter()
        .filter(|prior| !prior.text.trim().is_empty())
        .map(|prior| {
            let role = match prior.sender {
                Sender::LocalUser => Role::User,
                Sender::Conversation(_) => Role::Assistant,
            };
            ProviderMessage::new(role, prior.text.clone())
        })
        .collect();

    let mut request = ReplyRequest::new(
        ticket.target(),
        config.model_id.clone(),
        history,
        message.text.clone(),
    )
    .with_instruction(config.instruction_for(conversation.instruction()));

    if let Some(payload) = message.attachment.as_ref().and_then(Attachment::inline_payload) {
        request = request.with_attachment(payload);
    }
    if let Some(max_tokens) = config.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }
    request
}
