//! Conversation state engine: a copy-on-write store of conversations, an optimistic
//! send pipeline, and an integrator that folds streamed replies into the store.

mod config;
mod engine;
mod error;
mod ids;
mod model;
mod projector;
mod seed;
mod send;
mod store;
mod stream;

pub use config::{DEFAULT_FAILURE_NOTICE, DEFAULT_INSTRUCTION, EngineConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use ids::{Clock, ConversationId, ManualClock, MessageId, SessionId, SystemClock};
pub use model::{
    Attachment, AttachmentKind, Conversation, ConversationKind, DeliveryState, LOCAL_USER_ID,
    Message, ProfilePatch, SELF_NOTES_ID, Sender, UserProfile,
};
pub use projector::{
    ConversationRow, ConversationView, DayGroup, DayLabel, MessageView, ViewModel, project,
};
pub use seed::{ALICE_ID, ASSISTANT_ID, TUTOR_ID, seed_conversations, seed_profile, seed_snapshot};
pub use send::{CommittedSend, OutgoingMessage, PendingReply, build_reply_request, commit_send};
pub use store::{Mutation, Snapshot, Store};
pub use stream::{
    FoldOutcome, SessionState, SessionTicket, StreamIntegrator, StreamSession, drive_reply,
};
