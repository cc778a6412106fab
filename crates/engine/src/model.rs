use chrono::{DateTime, Utc};
use courier_llm::InlineAttachment;

use super::ids::{ConversationId, MessageId};

/// Sender id reserved for the local user.
pub const LOCAL_USER_ID: &str = "me";
/// Conversation id of the personal notes thread.
pub const SELF_NOTES_ID: &str = "saved";

const FALLBACK_PHOTO_MIME: &str = "image/jpeg";

/// Who authored a message.
///
/// Remote replies are attributed to the conversation they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    LocalUser,
    Conversation(ConversationId),
}

impl Sender {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LocalUser => LOCAL_USER_ID,
            Self::Conversation(id) => id.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Sent,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Photo,
    Video,
    Audio,
    File,
}

/// Content attached to a message; `source` is an opaque reference such as a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Photo {
        source: String,
        mime_type: Option<String>,
    },
    Video {
        source: String,
        mime_type: Option<String>,
    },
    Audio {
        source: String,
        mime_type: Option<String>,
    },
    File {
        source: String,
        name: Option<String>,
        mime_type: Option<String>,
    },
}

impl Attachment {
    /// Builds an attachment whose kind is inferred from the MIME prefix.
    pub fn from_mime(
        mime_type: Option<&str>,
        source: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        let source = source.into();
        let mime = mime_type
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .map(str::to_string);

        match mime.as_deref() {
            Some(value) if value.starts_with("image/") => Self::Photo {
                source,
                mime_type: mime,
            },
            Some(value) if value.starts_with("video/") => Self::Video {
                source,
                mime_type: mime,
            },
            Some(value) if value.starts_with("audio/") => Self::Audio {
                source,
                mime_type: mime,
            },
            _ => Self::File {
                source,
                name,
                mime_type: mime,
            },
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        match self {
            Self::Photo { .. } => AttachmentKind::Photo,
            Self::Video { .. } => AttachmentKind::Video,
            Self::Audio { .. } => AttachmentKind::Audio,
            Self::File { .. } => AttachmentKind::File,
        }
    }

    /// Short human label used in list previews.
    pub fn label(&self) -> &str {
        match self {
            Self::Photo { .. } => "Photo",
            Self::Video { .. } => "Video",
            Self::Audio { .. } => "Audio",
            Self::File { name, .. } => name.as_deref().unwrap_or("File"),
        }
    }

    /// Transport payload for the token source.
    ///
    /// Only photos carried as `data:` URIs are forwarded; everything else yields `None`.
    pub fn inline_payload(&self) -> Option<InlineAttachment> {
        let Self::Photo { source, mime_type } = self else {
            return None;
        };

        let rest = source.strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        if data.is_empty() {
            return None;
        }

        let header_mime = header
            .split(';')
            .next()
            .map(str::trim)
            .filter(|mime| !mime.is_empty());

        let mime = header_mime
            .or(mime_type.as_deref())
            .unwrap_or(FALLBACK_PHOTO_MIME);

        Some(InlineAttachment {
            mime_type: mime.to_string(),
            data_base64: data.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub attachment: Option<Attachment>,
}

impl Message {
    /// A locally authored message, not yet seen by anyone.
    pub fn outgoing(
        id: MessageId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id,
            sender: Sender::LocalUser,
            text: text.into(),
            timestamp,
            delivery: DeliveryState::Sent,
            attachment,
        }
    }

    /// A message authored on behalf of the conversation itself.
    pub fn incoming(
        id: MessageId,
        conversation_id: ConversationId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender: Sender::Conversation(conversation_id),
            text: text.into(),
            timestamp,
            delivery: DeliveryState::Read,
            attachment: None,
        }
    }

    /// Empty reply that a stream session fills in place.
    pub fn reply_placeholder(
        id: MessageId,
        conversation_id: ConversationId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::incoming(id, conversation_id, String::new(), timestamp)
    }

    pub fn is_outgoing(&self) -> bool {
        self.sender == Sender::LocalUser
    }

    /// Text for list previews: the message text, or the attachment label when empty.
    pub fn preview(&self) -> &str {
        if !self.text.is_empty() {
            return &self.text;
        }
        self.attachment
            .as_ref()
            .map(Attachment::label)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    SelfNotes,
    Direct,
    Group,
    /// Replies are produced by the remote text generator.
    Generated {
        instruction: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub presence: Option<String>,
    pub kind: ConversationKind,
    pub messages: Vec<Message>,
    pub last_message: Option<MessageId>,
    pub unread_count: u32,
    pub awaiting_reply: bool,
    pub muted: bool,
}

impl Conversation {
    pub fn new(id: ConversationId, name: impl Into<String>, kind: ConversationKind) -> Self {
        Self {
            id,
            name: name.into(),
            username: None,
            bio: None,
            presence: None,
            kind,
            messages: Vec::new(),
            last_message: None,
            unread_count: 0,
            awaiting_reply: false,
            muted: false,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = Some(bio.into());
        self
    }

    pub fn with_presence(mut self, presence: impl Into<String>) -> Self {
        self.presence = Some(presence.into());
        self
    }

    pub fn with_unread(mut self, unread_count: u32) -> Self {
        self.unread_count = unread_count;
        self
    }

    /// Appends history and points `last_message` at the newest entry.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.last_message = messages.last().map(|message| message.id);
        self.messages = messages;
        self
    }

    pub fn is_remote_generated(&self) -> bool {
        matches!(self.kind, ConversationKind::Generated { .. })
    }

    pub fn is_self_notes(&self) -> bool {
        matches!(self.kind, ConversationKind::SelfNotes)
    }

    pub fn instruction(&self) -> Option<&str> {
        match &self.kind {
            ConversationKind::Generated { instruction } => instruction.as_deref(),
            _ => None,
        }
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.last_message.and_then(|id| self.message(id))
    }

    /// Ordering key for the conversation list; conversations without one sort last.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message().map(|message| message.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub phone: Option<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: "You".to_string(),
            username: None,
            bio: None,
            phone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub phone: Option<String>,
}

impl UserProfile {
    pub fn patched(&self, patch: &ProfilePatch) -> Self {
        let mut next = self.clone();
        if let Some(name) = patch.name.as_deref().map(str::trim)
            && !name.is_empty()
        {
            next.name = name.to_string();
        }
        if let Some(username) = &patch.username {
            next.username = Some(username.clone());
        }
        if let Some(bio) = &patch.bio {
            next.bio = Some(bio.clone());
        }
        if let Some(phone) = &patch.phone {
            next.phone = Some(phone.clone());
        }
        next
    }
}
