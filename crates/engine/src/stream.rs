use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_llm::{ProviderEventStream, StreamEventPayload, StreamTarget};
use parking_lot::Mutex;
use snafu::ensure;
use tokio::task::AbortHandle;

use super::error::{EngineResult, ReplyInFlightSnafu};
use super::ids::{Clock, ConversationId, MessageId, SessionId};
use super::model::Message;
use super::store::{Mutation, Snapshot, Store};

const TRUNCATED_STREAM_ERROR: &str = "provider stream ended before a terminal event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Active,
    Closed,
}

/// One in-flight reply being folded into its placeholder message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    pub reply_message_id: MessageId,
    /// Everything received so far; each fold writes this whole buffer.
    pub buffer: String,
    pub state: SessionState,
}

/// Handle naming one session; stale tickets are rejected rather than applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTicket {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub reply_message_id: MessageId,
}

impl SessionTicket {
    pub fn target(&self) -> StreamTarget {
        StreamTarget::new(self.conversation_id.as_str(), self.session_id.0)
    }

    fn matches(&self, target: &StreamTarget) -> bool {
        target.session_id == self.session_id.0
            && target.conversation_id == self.conversation_id.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied,
    /// The session was closed or its target disappeared; nothing changed.
    Dropped,
}

struct SessionSlot {
    session: StreamSession,
    driver: Option<AbortHandle>,
}

/// Owns every open stream session and is the only writer of reply text.
///
/// At most one session is active per conversation. Closing a session removes
/// it, so any late callback holding its ticket becomes a no-op.
pub struct StreamIntegrator {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    failure_notice: String,
    sessions: Mutex<HashMap<ConversationId, SessionSlot>>,
    next_session_id: AtomicU64,
}

impl StreamIntegrator {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, failure_notice: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            failure_notice: failure_notice.into(),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Commits a send with its reply placeholder and reserves the conversation's
    /// single session slot for that placeholder.
    ///
    /// The store write and the reservation happen under the session lock, so a
    /// concurrent [`cancel`](Self::cancel) sees both or neither.
    pub fn open(
        &self,
        conversation_id: &ConversationId,
        message: Message,
        placeholder: Message,
    ) -> EngineResult<SessionTicket> {
        let mut sessions = self.sessions.lock();
        ensure!(
            !sessions.contains_key(conversation_id),
            ReplyInFlightSnafu {
                stage: "open-session",
                conversation_id: conversation_id.to_string(),
            }
        );

        let reply_message_id = placeholder.id;
        self.store.try_apply(&Mutation::Send {
            conversation_id: conversation_id.clone(),
            message,
            reply_placeholder: Some(placeholder),
        })?;

        let session_id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let session = StreamSession {
            id: session_id,
            conversation_id: conversation_id.clone(),
            reply_message_id,
            buffer: String::new(),
            state: SessionState::Active,
        };
        sessions.insert(
            conversation_id.clone(),
            SessionSlot {
                session,
                driver: None,
            },
        );

        tracing::info!(
            conversation_id = %conversation_id,
            session_id = %session_id,
            message_id = %reply_message_id,
            "stream session opened"
        );

        Ok(SessionTicket {
            session_id,
            conversation_id: conversation_id.clone(),
            reply_message_id,
        })
    }

    /// Registers the task feeding this session so cancellation can stop it.
    pub fn attach_driver(&self, ticket: &SessionTicket, driver: AbortHandle) {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&ticket.conversation_id) {
            Some(slot) if slot.session.id == ticket.session_id => slot.driver = Some(driver),
            _ => driver.abort(),
        }
    }

    /// Current state of the conversation's session, if one is open.
    pub fn session(&self, conversation_id: &ConversationId) -> Option<StreamSession> {
        self.sessions
            .lock()
            .get(conversation_id)
            .map(|slot| slot.session.clone())
    }

    pub fn is_active(&self, ticket: &SessionTicket) -> bool {
        self.sessions
            .lock()
            .get(&ticket.conversation_id)
            .is_some_and(|slot| {
                slot.session.id == ticket.session_id && slot.session.state == SessionState::Active
            })
    }

    /// Appends a fragment and writes the full accumulated text into the reply.
    pub fn on_chunk(&self, ticket: &SessionTicket, chunk: &str) -> FoldOutcome {
        let mut sessions = self.sessions.lock();
        let Some(slot) = sessions.get_mut(&ticket.conversation_id) else {
            tracing::debug!(
                conversation_id = %ticket.conversation_id,
                session_id = %ticket.session_id,
                "dropping chunk for closed session"
            );
            return FoldOutcome::Dropped;
        };
        if slot.session.id != ticket.session_id || slot.session.state != SessionState::Active {
            tracing::debug!(
                conversation_id = %ticket.conversation_id,
                session_id = %ticket.session_id,
                "dropping chunk for stale session"
            );
            return FoldOutcome::Dropped;
        }

        slot.session.buffer.push_str(chunk);
        let mutation = Mutation::ReplaceReplyText {
            conversation_id: ticket.conversation_id.clone(),
            message_id: ticket.reply_message_id,
            text: slot.session.buffer.clone(),
        };

        match self.store.try_apply(&mutation) {
            Ok(_) => {
                tracing::debug!(
                    conversation_id = %ticket.conversation_id,
                    session_id = %ticket.session_id,
                    chunk_len = chunk.len(),
                    "folded chunk"
                );
                FoldOutcome::Applied
            }
            Err(error) => {
                // The placeholder or its conversation is gone; nothing can be folded any more.
                sessions.remove(&ticket.conversation_id);
                tracing::debug!(
                    conversation_id = %ticket.conversation_id,
                    session_id = %ticket.session_id,
                    error = %error,
                    "reply target vanished; session closed"
                );
                FoldOutcome::Dropped
            }
        }
    }

    /// Closes the session after a successful stream. Returns false for stale tickets.
    pub fn on_complete(&self, ticket: &SessionTicket) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = take_session(&mut sessions, ticket) else {
            return false;
        };

        self.store.apply(Mutation::FinishReply {
            conversation_id: ticket.conversation_id.clone(),
            failure_notice: None,
        });

        tracing::info!(
            conversation_id = %ticket.conversation_id,
            session_id = %ticket.session_id,
            reply_len = session.buffer.len(),
            "stream session completed"
        );
        true
    }

    /// Closes the session and appends a separate failure notice; partial text is kept.
    pub fn on_error(&self, ticket: &SessionTicket, error: &str) -> bool {
        let mut sessions = self.sessions.lock();
        if take_session(&mut sessions, ticket).is_none() {
            return false;
        }

        let notice = Message::incoming(
            MessageId::new_v7(),
            ticket.conversation_id.clone(),
            self.failure_notice.clone(),
            self.clock.now(),
        );
        self.store.apply(Mutation::FinishReply {
            conversation_id: ticket.conversation_id.clone(),
            failure_notice: Some(notice),
        });

        tracing::warn!(
            conversation_id = %ticket.conversation_id,
            session_id = %ticket.session_id,
            error,
            "stream session failed"
        );
        true
    }

    /// Closes the conversation's session, stops its driver, and applies the
    /// mutation that made the session obsolete before another session can open.
    ///
    /// Returns the closed session, if there was one, and the resulting snapshot.
    pub fn cancel(
        &self,
        conversation_id: &ConversationId,
        mutation: Mutation,
    ) -> (Option<StreamSession>, Arc<Snapshot>) {
        let mut sessions = self.sessions.lock();
        let session = close_slot(&mut sessions, conversation_id);
        (session, self.store.apply(mutation))
    }

    /// Cancels the session and finishes the reply with whatever text has arrived.
    pub fn stop(&self, conversation_id: &ConversationId) -> Option<Arc<Snapshot>> {
        let mut sessions = self.sessions.lock();
        close_slot(&mut sessions, conversation_id)?;
        Some(self.store.apply(Mutation::FinishReply {
            conversation_id: conversation_id.clone(),
            failure_notice: None,
        }))
    }
}

fn close_slot(
    sessions: &mut HashMap<ConversationId, SessionSlot>,
    conversation_id: &ConversationId,
) -> Option<StreamSession> {
    let slot = sessions.remove(conversation_id)?;
    if let Some(driver) = slot.driver {
        driver.abort();
    }

    let mut session = slot.session;
    session.state = SessionState::Closed;
    tracing::info!(
        conversation_id = %conversation_id,
        session_id = %session.id,
        "stream session cancelled"
    );
    Some(session)
}

fn take_session(
    sessions: &mut HashMap<ConversationId, SessionSlot>,
    ticket: &SessionTicket,
) -> Option<StreamSession> {
    let matches = sessions
        .get(&ticket.conversation_id)
        .is_some_and(|slot| slot.session.id == ticket.session_id);
    if !matches {
        return None;
    }

    let mut session = sessions.remove(&ticket.conversation_id)?.session;
    session.state = SessionState::Closed;
    Some(session)
}

/// Feeds one provider stream into its session until a terminal event.
///
/// A stream that closes without `Done` or `Error` is finalized as a failure.
pub async fn drive_reply(
    integrator: Arc<StreamIntegrator>,
    ticket: SessionTicket,
    mut stream: ProviderEventStream,
) {
    while let Some(event) = stream.recv().await {
        if !ticket.matches(&event.target) {
            continue;
        }

        match event.payload {
            StreamEventPayload::Delta(chunk) => {
                if integrator.on_chunk(&ticket, &chunk) == FoldOutcome::Dropped {
                    // Dropping the stream tells the worker to stop producing.
                    return;
                }
            }
            StreamEventPayload::Done => {
                integrator.on_complete(&ticket);
                return;
            }
            StreamEventPayload::Error(message) => {
                integrator.on_error(&ticket, &message);
                return;
            }
        }
    }

    integrator.on_error(&ticket, TRUNCATED_STREAM_ERROR);
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ids::SystemClock;
    use crate::model::{Conversation, ConversationKind, UserProfile};

    fn integrator() -> StreamIntegrator {
        let conversation = Conversation::new(
            ConversationId::new("ai"),
            "Assistant",
            ConversationKind::Generated { instruction: None },
        );
        let store = Arc::new(Store::new(Snapshot::new(
            vec![conversation],
            UserProfile::default(),
        )));
        StreamIntegrator::new(store, Arc::new(SystemClock), "failed")
    }

    fn open_with_placeholder(integrator: &StreamIntegrator) -> SessionTicket {
        let id = ConversationId::new("ai");
        integrator
            .open(
                &id,
                Message::outgoing(MessageId::new_v7(), "hi", Utc::now(), None),
                Message::reply_placeholder(MessageId::new_v7(), id.clone(), Utc::now()),
            )
            .unwrap()
    }

    #[test]
    fn second_open_for_same_conversation_is_rejected() {
        let integrator = integrator();
        let _ticket = open_with_placeholder(&integrator);
        let id = ConversationId::new("ai");
        let result = integrator.open(
            &id,
            Message::outgoing(MessageId::new_v7(), "again", Utc::now(), None),
            Message::reply_placeholder(MessageId::new_v7(), id.clone(), Utc::now()),
        );
        assert!(result.is_err());

        let snapshot = integrator.store().snapshot();
        assert_eq!(snapshot.conversation(&id).unwrap().messages.len(), 2);
    }

    #[test]
    fn open_on_missing_conversation_reserves_nothing() {
        let integrator = integrator();
        let id = ConversationId::new("gone");
        let result = integrator.open(
            &id,
            Message::outgoing(MessageId::new_v7(), "hi", Utc::now(), None),
            Message::reply_placeholder(MessageId::new_v7(), id.clone(), Utc::now()),
        );
        assert!(result.is_err_and(|error| error.is_not_found()));
        assert!(integrator.session(&id).is_none());
    }

    #[test]
    fn session_ids_are_never_reused() {
        let integrator = integrator();
        let first = open_with_placeholder(&integrator);
        assert!(integrator.on_complete(&first));
        let second = open_with_placeholder(&integrator);
        assert_ne!(first.session_id, second.session_id);
    }

    #[test]
    fn chunk_after_completion_is_dropped() {
        let integrator = integrator();
        let ticket = open_with_placeholder(&integrator);
        assert_eq!(integrator.on_chunk(&ticket, "Hel"), FoldOutcome::Applied);
        assert!(integrator.on_complete(&ticket));
        assert_eq!(integrator.on_chunk(&ticket, "lo"), FoldOutcome::Dropped);
        assert!(!integrator.on_complete(&ticket));

        let snapshot = integrator.store().snapshot();
        let conversation = snapshot.conversation(&"ai".into()).unwrap();
        assert_eq!(conversation.messages[1].text, "Hel");
    }

    #[test]
    fn cancel_reports_closed_session_with_buffer() {
        let integrator = integrator();
        let ticket = open_with_placeholder(&integrator);
        integrator.on_chunk(&ticket, "partial");

        let (session, snapshot) = integrator.cancel(
            &ticket.conversation_id,
            Mutation::ClearHistory { id: "ai".into() },
        );
        let session = session.unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.buffer, "partial");
        assert!(!integrator.is_active(&ticket));
        assert!(!snapshot.conversation(&"ai".into()).unwrap().awaiting_reply);
    }

    #[test]
    fn terminal_events_after_cancel_leave_the_conversation_free() {
        let integrator = integrator();
        let ticket = open_with_placeholder(&integrator);
        integrator.cancel(&ticket.conversation_id, Mutation::ClearHistory { id: "ai".into() });

        assert!(!integrator.on_error(&ticket, "boom"));
        let snapshot = integrator.store().snapshot();
        let conversation = snapshot.conversation(&"ai".into()).unwrap();
        assert!(!conversation.awaiting_reply);
        assert!(conversation.messages.is_empty());

        let next = open_with_placeholder(&integrator);
        assert!(integrator.is_active(&next));
    }

    #[test]
    fn stop_keeps_partial_text_and_clears_awaiting() {
        let integrator = integrator();
        let ticket = open_with_placeholder(&integrator);
        integrator.on_chunk(&ticket, "half an ans");

        let snapshot = integrator.stop(&ticket.conversation_id).unwrap();
        let conversation = snapshot.conversation(&"ai".into()).unwrap();
        assert!(!conversation.awaiting_reply);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].text, "half an ans");
    }

    #[test]
    fn vanished_placeholder_closes_the_session() {
        let integrator = integrator();
        let ticket = open_with_placeholder(&integrator);
        integrator.store().apply(Mutation::ClearHistory { id: "ai".into() });

        assert_eq!(integrator.on_chunk(&ticket, "late"), FoldOutcome::Dropped);
        assert!(integrator.session(&ticket.conversation_id).is_none());
    }
}
