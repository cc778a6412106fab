use std::cmp::Reverse;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use super::ids::{ConversationId, MessageId};
use super::model::{Attachment, Conversation, DeliveryState, Message};
use super::store::Snapshot;

const TYPING_STATUS: &str = "printing...";
const FALLBACK_STATUS: &str = "last seen recently";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub name: String,
    pub preview: String,
    pub time_label: Option<String>,
    pub unread_count: u32,
    pub muted: bool,
    pub typing: bool,
    pub is_self_notes: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
}

impl DayLabel {
    fn classify(date: NaiveDate, today: NaiveDate) -> Self {
        if date == today {
            Self::Today
        } else if today.pred_opt() == Some(date) {
            Self::Yesterday
        } else {
            Self::Date(date)
        }
    }

    /// Header text; the year is shown only when it differs from `today`'s.
    pub fn header(&self, today: NaiveDate) -> String {
        match self {
            Self::Today => "Today".to_string(),
            Self::Yesterday => "Yesterday".to_string(),
            Self::Date(date) if date.year() == today.year() => date.format("%-d %B").to_string(),
            Self::Date(date) => date.format("%-d %B %Y").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub outgoing: bool,
    pub text: String,
    pub time_label: String,
    pub delivery: DeliveryState,
    pub attachment: Option<Attachment>,
}

/// Consecutive messages sharing one calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup {
    pub label: DayLabel,
    pub header: String,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub id: ConversationId,
    pub name: String,
    pub status_line: String,
    pub muted: bool,
    pub typing: bool,
    pub is_remote_generated: bool,
    pub groups: Vec<DayGroup>,
}

/// Everything the presentation layer may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewModel {
    pub version: u64,
    pub profile_name: String,
    pub conversations: Vec<ConversationRow>,
    pub active: Option<ConversationView>,
}

/// Derives the render model from one snapshot.
///
/// Calendar decisions use `now`'s time zone, so callers pass `Local::now()` in
/// production and a fixed offset in tests.
pub fn project<Tz: TimeZone>(
    snapshot: &Snapshot,
    active: Option<&ConversationId>,
    filter: &str,
    now: &DateTime<Tz>,
) -> ViewModel {
    let timezone = now.timezone();
    let today = now.date_naive();
    let now_local = now.naive_local();
    let local = |timestamp: &DateTime<Utc>| timestamp.with_timezone(&timezone).naive_local();

    let needle = filter.trim().to_lowercase();
    let mut rows = snapshot
        .conversations()
        .filter(|conversation| matches_filter(conversation, &needle))
        .collect::<Vec<_>>();
    rows.sort_by_key(|conversation| {
        (
            !conversation.is_self_notes(),
            Reverse(conversation.last_activity().map(|at| at.timestamp_millis()).unwrap_or(0)),
        )
    });

    let conversations = rows
        .into_iter()
        .map(|conversation| {
            let last = conversation.last_message();
            ConversationRow {
                id: conversation.id.clone(),
                name: conversation.name.clone(),
                preview: last.map(Message::preview).unwrap_or_default().to_string(),
                time_label: last.map(|message| list_time_label(local(&message.timestamp), now_local)),
                unread_count: conversation.unread_count,
                muted: conversation.muted,
                typing: conversation.awaiting_reply,
                is_self_notes: conversation.is_self_notes(),
                is_active: active == Some(&conversation.id),
            }
        })
        .collect();

    let active = active
        .and_then(|id| snapshot.conversation(id))
        .map(|conversation| ConversationView {
            id: conversation.id.clone(),
            name: conversation.name.clone(),
            status_line: status_line(conversation),
            muted: conversation.muted,
            typing: conversation.awaiting_reply,
            is_remote_generated: conversation.is_remote_generated(),
            groups: group_by_day(&conversation.messages, today, &local),
        });

    ViewModel {
        version: snapshot.version(),
        profile_name: snapshot.profile().name.clone(),
        conversations,
        active,
    }
}

fn matches_filter(conversation: &Conversation, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    conversation.name.to_lowercase().contains(needle)
        || conversation
            .username
            .as_deref()
            .is_some_and(|username| username.to_lowercase().contains(needle))
}

fn status_line(conversation: &Conversation) -> String {
    if conversation.awaiting_reply {
        return TYPING_STATUS.to_string();
    }
    conversation
        .presence
        .clone()
        .unwrap_or_else(|| FALLBACK_STATUS.to_string())
}

/// Same-day messages show a clock time; anything under a week old its weekday.
fn list_time_label(at: NaiveDateTime, now: NaiveDateTime) -> String {
    if at.date() == now.date() {
        at.format("%H:%M").to_string()
    } else if now - at < Duration::days(7) {
        at.format("%a").to_string()
    } else {
        at.format("%-d %b").to_string()
    }
}

fn group_by_day<F>(messages: &[Message], today: NaiveDate, local: &F) -> Vec<DayGroup>
where
    F: Fn(&DateTime<Utc>) -> NaiveDateTime,
{
    let mut groups: Vec<DayGroup> = Vec::new();
    for message in messages {
        let at = local(&message.timestamp);
        let label = DayLabel::classify(at.date(), today);
        let view = MessageView {
            id: message.id,
            outgoing: message.is_outgoing(),
            text: message.text.clone(),
            time_label: at.format("%H:%M").to_string(),
            delivery: message.delivery,
            attachment: message.attachment.clone(),
        };

        match groups.last_mut() {
            Some(group) if group.label == label => group.messages.push(view),
            _ => groups.push(DayGroup {
                label,
                header: label.header(today),
                messages: vec![view],
            }),
        }
    }
    groups
}
