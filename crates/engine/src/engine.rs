use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use courier_llm::TokenSource;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::config::EngineConfig;
use super::error::EngineResult;
use super::ids::{Clock, ConversationId, MessageId, SystemClock};
use super::model::{Conversation, ConversationKind, ProfilePatch};
use super::projector::{ViewModel, project};
use super::send::{OutgoingMessage, PendingReply, commit_send};
use super::store::{Mutation, Snapshot, Store};
use super::stream::{StreamIntegrator, StreamSession, drive_reply};

const NO_SOURCE_ERROR: &str = "no token source configured";
const NO_RUNTIME_ERROR: &str = "no async runtime available to drive the reply";

pub struct EngineBuilder {
    initial: Snapshot,
    config: EngineConfig,
    token_source: Option<Arc<dyn TokenSource>>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(token_source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Engine {
        let store = Arc::new(Store::new(self.initial));
        let integrator = Arc::new(StreamIntegrator::new(
            Arc::clone(&store),
            Arc::clone(&self.clock),
            self.config.failure_notice.clone(),
        ));
        Engine {
            inner: Arc::new(EngineInner {
                store,
                integrator,
                token_source: self.token_source,
                config: self.config,
            }),
        }
    }
}

struct EngineInner {
    store: Arc<Store>,
    integrator: Arc<StreamIntegrator>,
    token_source: Option<Arc<dyn TokenSource>>,
    config: EngineConfig,
}

/// Conversation state engine handle; clones share the same state.
///
/// Presentation code only calls the operations here and reads [`ViewModel`]s.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(initial: Snapshot) -> EngineBuilder {
        EngineBuilder {
            initial,
            config: EngineConfig::default(),
            token_source: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.store.subscribe()
    }

    pub fn project<Tz: TimeZone>(&self, filter: &str, now: &DateTime<Tz>) -> ViewModel {
        let snapshot = self.snapshot();
        project(&snapshot, snapshot.active_id(), filter, now)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn integrator(&self) -> &Arc<StreamIntegrator> {
        &self.inner.integrator
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<StreamSession> {
        self.inner.integrator.session(conversation_id)
    }

    pub fn select(&self, conversation_id: &ConversationId) -> Arc<Snapshot> {
        self.inner.store.apply(Mutation::Select {
            id: Some(conversation_id.clone()),
        })
    }

    /// Leaves the active conversation.
    pub fn back(&self) -> Arc<Snapshot> {
        self.inner.store.apply(Mutation::Select { id: None })
    }

    /// Sends a user message and, for generated conversations, starts the reply.
    ///
    /// Returns `Ok(None)` when the conversation is gone or the message is empty,
    /// and `ReplyInFlight` while the previous reply is still streaming.
    pub fn send_message(
        &self,
        conversation_id: &ConversationId,
        outgoing: OutgoingMessage,
    ) -> EngineResult<Option<MessageId>> {
        let committed = commit_send(
            &self.inner.integrator,
            &self.inner.config,
            conversation_id,
            outgoing,
        )
        .inspect_err(|error| {
            tracing::warn!(conversation_id = %conversation_id, error = %error, "send rejected");
        })?;

        let Some(committed) = committed else {
            return Ok(None);
        };
        if let Some(reply) = committed.reply {
            self.start_reply(reply);
        }
        Ok(Some(committed.message_id))
    }

    fn start_reply(&self, reply: PendingReply) {
        let PendingReply { ticket, request } = reply;
        let integrator = &self.inner.integrator;

        let Some(source) = &self.inner.token_source else {
            integrator.on_error(&ticket, NO_SOURCE_ERROR);
            return;
        };

        let handle = match source.stream_reply(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(
                    conversation_id = %ticket.conversation_id,
                    provider_id = source.id(),
                    error = %error,
                    "failed to open reply stream"
                );
                integrator.on_error(&ticket, &error.to_string());
                return;
            }
        };

        let Ok(runtime) = Handle::try_current() else {
            integrator.on_error(&ticket, NO_RUNTIME_ERROR);
            return;
        };

        runtime.spawn(handle.worker);
        let driver = runtime.spawn(drive_reply(
            Arc::clone(integrator),
            ticket.clone(),
            handle.stream,
        ));
        integrator.attach_driver(&ticket, driver.abort_handle());
    }

    /// Stops a streaming reply, keeping the text received so far.
    pub fn stop_reply(&self, conversation_id: &ConversationId) -> bool {
        self.inner.integrator.stop(conversation_id).is_some()
    }

    pub fn clear_history(&self, conversation_id: &ConversationId) -> Arc<Snapshot> {
        let (_, snapshot) = self.inner.integrator.cancel(
            conversation_id,
            Mutation::ClearHistory {
                id: conversation_id.clone(),
            },
        );
        snapshot
    }

    pub fn delete_conversation(&self, conversation_id: &ConversationId) -> Arc<Snapshot> {
        let (_, snapshot) = self.inner.integrator.cancel(
            conversation_id,
            Mutation::DeleteConversation {
                id: conversation_id.clone(),
            },
        );
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");
        snapshot
    }

    pub fn toggle_mute(&self, conversation_id: &ConversationId) -> Arc<Snapshot> {
        self.inner.store.apply(Mutation::ToggleMute {
            id: conversation_id.clone(),
        })
    }

    /// Creates a group, places it first and makes it active. Blank names are ignored.
    pub fn create_group(&self, name: &str) -> EngineResult<Option<ConversationId>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        let conversation = Conversation::new(ConversationId::new_group(), name, ConversationKind::Group)
            .with_presence("2 members");
        let id = conversation.id.clone();
        self.inner.store.try_apply(&Mutation::CreateConversation {
            conversation,
            activate: true,
        })?;
        tracing::info!(conversation_id = %id, "group created");
        Ok(Some(id))
    }

    pub fn update_profile(&self, patch: ProfilePatch) -> Arc<Snapshot> {
        self.inner.store.apply(Mutation::UpdateProfile(patch))
    }
}
