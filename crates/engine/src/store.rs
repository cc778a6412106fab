use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use snafu::{OptionExt, ensure};
use tokio::sync::watch;

use super::error::{
    DuplicateConversationSnafu, EngineResult, InvariantViolationSnafu, NotFoundSnafu,
    ReplyInFlightSnafu,
};
use super::ids::{ConversationId, MessageId};
use super::model::{Conversation, Message, ProfilePatch, UserProfile};

/// A state change expressed as data so it can be replayed against any snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateConversation {
        conversation: Conversation,
        activate: bool,
    },
    DeleteConversation {
        id: ConversationId,
    },
    /// `None` leaves the active conversation and returns to the list.
    Select {
        id: Option<ConversationId>,
    },
    /// Appends a user message and, for generated conversations, the reply placeholder
    /// in the same step.
    Send {
        conversation_id: ConversationId,
        message: Message,
        reply_placeholder: Option<Message>,
    },
    ReplaceReplyText {
        conversation_id: ConversationId,
        message_id: MessageId,
        text: String,
    },
    FinishReply {
        conversation_id: ConversationId,
        failure_notice: Option<Message>,
    },
    ClearHistory {
        id: ConversationId,
    },
    ToggleMute {
        id: ConversationId,
    },
    UpdateProfile(ProfilePatch),
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateConversation { .. } => "create-conversation",
            Self::DeleteConversation { .. } => "delete-conversation",
            Self::Select { .. } => "select",
            Self::Send { .. } => "send",
            Self::ReplaceReplyText { .. } => "replace-reply-text",
            Self::FinishReply { .. } => "finish-reply",
            Self::ClearHistory { .. } => "clear-history",
            Self::ToggleMute { .. } => "toggle-mute",
            Self::UpdateProfile(_) => "update-profile",
        }
    }
}

/// Immutable view of every conversation at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    conversations: Vec<Arc<Conversation>>,
    active: Option<ConversationId>,
    profile: Arc<UserProfile>,
}

impl Snapshot {
    pub fn new(conversations: Vec<Conversation>, profile: UserProfile) -> Self {
        Self {
            version: 0,
            conversations: conversations.into_iter().map(Arc::new).collect(),
            active: None,
            profile: Arc::new(profile),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter().map(AsRef::as_ref)
    }

    /// Never fails: a missing id yields `None`.
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == id)
            .map(AsRef::as_ref)
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.conversation(id))
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Pure reducer: the receiver is never modified and nothing outside it is read.
    pub fn apply(&self, mutation: &Mutation) -> EngineResult<Snapshot> {
        let mut next = self.clone();
        match mutation {
            Mutation::CreateConversation {
                conversation,
                activate,
            } => {
                ensure!(
                    self.conversation(&conversation.id).is_none(),
                    DuplicateConversationSnafu {
                        stage: "create-conversation",
                        id: conversation.id.to_string(),
                    }
                );
                next.conversations.insert(0, Arc::new(conversation.clone()));
                if *activate {
                    next.active = Some(conversation.id.clone());
                }
            }
            Mutation::DeleteConversation { id } => {
                let index = self.position(id, "delete-conversation")?;
                next.conversations.remove(index);
                if next.active.as_ref() == Some(id) {
                    next.active = None;
                }
            }
            Mutation::Select { id: None } => {
                next.active = None;
            }
            Mutation::Select { id: Some(id) } => {
                next.update_conversation(id, "select", |conversation| {
                    conversation.unread_count = 0;
                    Ok(())
                })?;
                next.active = Some(id.clone());
            }
            Mutation::Send {
                conversation_id,
                message,
                reply_placeholder,
            } => {
                next.update_conversation(conversation_id, "send", |conversation| {
                    if reply_placeholder.is_some() {
                        ensure!(
                            !conversation.awaiting_reply,
                            ReplyInFlightSnafu {
                                stage: "send",
                                conversation_id: conversation.id.to_string(),
                            }
                        );
                        ensure!(
                            conversation.is_remote_generated(),
                            InvariantViolationSnafu {
                                stage: "send",
                                details: format!(
                                    "conversation '{}' does not accept generated replies",
                                    conversation.id
                                ),
                            }
                        );
                    }

                    conversation.messages.push(message.clone());
                    conversation.last_message = Some(message.id);
                    conversation.unread_count = 0;

                    if let Some(placeholder) = reply_placeholder {
                        conversation.messages.push(placeholder.clone());
                        conversation.awaiting_reply = true;
                    }
                    Ok(())
                })?;
            }
            Mutation::ReplaceReplyText {
                conversation_id,
                message_id,
                text,
            } => {
                next.update_conversation(conversation_id, "replace-reply-text", |conversation| {
                    let reply = conversation
                        .messages
                        .iter_mut()
                        .find(|message| message.id == *message_id)
                        .context(NotFoundSnafu {
                            stage: "replace-reply-text",
                            entity: "message",
                            id: message_id.to_string(),
                        })?;
                    reply.text.clone_from(text);
                    conversation.last_message = Some(*message_id);
                    Ok(())
                })?;
            }
            Mutation::FinishReply {
                conversation_id,
                failure_notice,
            } => {
                next.update_conversation(conversation_id, "finish-reply", |conversation| {
                    conversation.awaiting_reply = false;
                    if let Some(notice) = failure_notice {
                        conversation.messages.push(notice.clone());
                    }
                    Ok(())
                })?;
            }
            Mutation::ClearHistory { id } => {
                next.update_conversation(id, "clear-history", |conversation| {
                    conversation.messages.clear();
                    conversation.last_message = None;
                    conversation.awaiting_reply = false;
                    Ok(())
                })?;
            }
            Mutation::ToggleMute { id } => {
                next.update_conversation(id, "toggle-mute", |conversation| {
                    conversation.muted = !conversation.muted;
                    Ok(())
                })?;
            }
            Mutation::UpdateProfile(patch) => {
                next.profile = Arc::new(self.profile.patched(patch));
            }
        }

        next.version = self.version.saturating_add(1);
        Ok(next)
    }

    fn position(&self, id: &ConversationId, stage: &'static str) -> EngineResult<usize> {
        self.conversations
            .iter()
            .position(|conversation| &conversation.id == id)
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: id.to_string(),
            })
    }

    // Copy-on-write: only the touched conversation is cloned, the rest stay shared.
    fn update_conversation<F>(
        &mut self,
        id: &ConversationId,
        stage: &'static str,
        update: F,
    ) -> EngineResult<()>
    where
        F: FnOnce(&mut Conversation) -> EngineResult<()>,
    {
        let index = self.position(id, stage)?;
        let mut conversation = Conversation::clone(&self.conversations[index]);
        update(&mut conversation)?;
        self.conversations[index] = Arc::new(conversation);
        Ok(())
    }
}

/// Single source of truth for conversation state.
///
/// Readers load the current snapshot lock-free and never see a half-applied
/// mutation; writers are serialized so each mutation sees its predecessor.
pub struct Store {
    current: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    version_tx: watch::Sender<u64>,
}

impl Store {
    pub fn new(initial: Snapshot) -> Self {
        let (version_tx, _) = watch::channel(initial.version());
        Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            version_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Receives the latest version after each applied mutation; bursts may coalesce.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Applies a mutation and surfaces every rejection to the caller.
    pub fn try_apply(&self, mutation: &Mutation) -> EngineResult<Arc<Snapshot>> {
        let _writer = self.writer.lock();
        let current = self.current.load_full();
        let next = Arc::new(current.apply(mutation)?);
        self.current.store(Arc::clone(&next));
        self.version_tx.send_replace(next.version());
        Ok(next)
    }

    /// Applies a mutation, treating a rejected one as a no-op.
    ///
    /// Returns the snapshot that is current afterwards.
    pub fn apply(&self, mutation: Mutation) -> Arc<Snapshot> {
        match self.try_apply(&mutation) {
            Ok(next) => next,
            Err(error) if error.is_not_found() => {
                tracing::debug!(
                    mutation = mutation.name(),
                    error = %error,
                    "mutation target is gone; skipping"
                );
                self.snapshot()
            }
            Err(error) => {
                tracing::warn!(
                    mutation = mutation.name(),
                    error = %error,
                    "mutation rejected"
                );
                self.snapshot()
            }
        }
    }
}
