use chrono::{DateTime, Duration, Utc};

use super::ids::{ConversationId, MessageId};
use super::model::{
    Conversation, ConversationKind, DeliveryState, Message, SELF_NOTES_ID, UserProfile,
};
use super::store::Snapshot;

pub const ASSISTANT_ID: &str = "ai-assistant";
pub const TUTOR_ID: &str = "ai-tutor";
pub const ALICE_ID: &str = "user-alice";

/// Profile of the local user shown before any edits.
pub fn seed_profile() -> UserProfile {
    UserProfile {
        name: "You".to_string(),
        username: Some("@gemini_user".to_string()),
        bio: Some("Digital explorer.".to_string()),
        phone: Some("+1 (555) 012-3456".to_string()),
    }
}

fn own(text: &str, timestamp: DateTime<Utc>) -> Message {
    let mut message = Message::outgoing(MessageId::new_v7(), text, timestamp, None);
    message.delivery = DeliveryState::Read;
    message
}

/// Startup conversations, with timestamps relative to `now`.
///
/// Message ids are minted in construction order, which follows timestamp order
/// within each conversation but not across conversations.
pub fn seed_conversations(now: DateTime<Utc>) -> Vec<Conversation> {
    let saved_id = ConversationId::new(SELF_NOTES_ID);
    let saved = Conversation::new(saved_id, "Saved Messages", ConversationKind::SelfNotes)
        .with_messages(vec![
            own("Important: Buy milk", now - Duration::days(2)),
            own(
                "# Todo\n- [ ] Finish project\n- [ ] Call Mom",
                now - Duration::hours(1),
            ),
        ]);

    let assistant_id = ConversationId::new(ASSISTANT_ID);
    let assistant = Conversation::new(
        assistant_id.clone(),
        "Gemini Pro",
        ConversationKind::Generated {
            instruction: Some(
                "You are a helpful, intelligent assistant. You can format your responses using \
                 Markdown. You can analyze images if sent."
                    .to_string(),
            ),
        },
    )
    .with_username("@gemini_pro")
    .with_presence("bot")
    .with_messages(vec![Message::incoming(
        MessageId::new_v7(),
        assistant_id,
        "Hello! I am Gemini. I can help you with coding, writing, and analysis. Send me text or a photo!",
        now - Duration::seconds(100),
    )]);

    let tutor_id = ConversationId::new(TUTOR_ID);
    let tutor = Conversation::new(
        tutor_id.clone(),
        "English Tutor",
        ConversationKind::Generated {
            instruction: Some(
                "You are an English language tutor. Correct grammar mistakes and explain rules simply."
                    .to_string(),
            ),
        },
    )
    .with_username("@eng_tutor")
    .with_presence("bot")
    .with_unread(1)
    .with_messages(vec![Message::incoming(
        MessageId::new_v7(),
        tutor_id,
        "Hello! Ready to practice English today?",
        now - Duration::seconds(50),
    )]);

    let alice_id = ConversationId::new(ALICE_ID);
    let alice = Conversation::new(alice_id.clone(), "Alice Smith", ConversationKind::Direct)
        .with_username("@alicesmith")
        .with_bio("Designer at TechCorp")
        .with_presence("last seen recently")
        .with_messages(vec![
            Message::incoming(
                MessageId::new_v7(),
                alice_id,
                "Are we still on for the meeting?",
                now - Duration::milliseconds(1_000_000),
            ),
            own("Yes, 3 PM.", now - Duration::milliseconds(900_000)),
        ]);

    vec![saved, assistant, tutor, alice]
}

pub fn seed_snapshot(now: DateTime<Utc>, profile: UserProfile) -> Snapshot {
    Snapshot::new(seed_conversations(now), profile)
}
