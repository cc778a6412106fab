use std::collections::HashMap;
use std::fmt::Write as _;

use courier_engine::{
    AttachmentKind, ConversationId, ConversationRow, ConversationView, DayGroup, DayLabel,
    DeliveryState, MessageId, MessageView, ViewModel,
};

/// Renders the conversation list as numbered rows.
pub fn render_list(rows: &[ConversationRow]) -> String {
    if rows.is_empty() {
        return "no conversations\n".to_string();
    }

    let mut out = String::new();
    for (index, row) in rows.iter().enumerate() {
        let mut flags = String::new();
        if row.is_active {
            flags.push('*');
        }
        if row.muted {
            flags.push_str(" [muted]");
        }
        if row.unread_count > 0 {
            let _ = write!(flags, " ({})", row.unread_count);
        }
        let preview = if row.typing {
            "printing...".to_string()
        } else {
            first_line(&row.preview)
        };
        let _ = writeln!(
            out,
            "{:>2}. {}{}  {}  {}",
            index + 1,
            row.name,
            flags,
            row.time_label.as_deref().unwrap_or(""),
            preview,
        );
    }
    out
}

/// Incremental transcript of the active conversation.
///
/// Each call prints only what changed since the previous view: new day headers,
/// new messages, and the growing tail of a streaming reply.
#[derive(Debug, Default)]
pub struct Transcript {
    conversation: Option<ConversationId>,
    printed: HashMap<MessageId, String>,
    last_label: Option<DayLabel>,
    open_line: Option<MessageId>,
    status: Option<String>,
}

impl Transcript {
    pub fn render(&mut self, view: &ViewModel) -> String {
        let Some(active) = &view.active else {
            let mut out = self.close_line();
            if self.conversation.take().is_some() {
                self.reset();
                out.push_str(&render_list(&view.conversations));
            }
            return out;
        };

        let mut out = String::new();
        if self.conversation.as_ref() != Some(&active.id) {
            out.push_str(&self.close_line());
            self.reset();
            self.conversation = Some(active.id.clone());
            let _ = writeln!(out, "== {} ({}) ==", active.name, active.status_line);
            self.status = Some(active.status_line.clone());
        } else if self.status.as_deref() != Some(active.status_line.as_str()) {
            if active.typing {
                out.push_str(&self.close_line());
                let _ = writeln!(out, "   {} is {}", active.name, active.status_line);
            }
            self.status = Some(active.status_line.clone());
        }

        let cleared = active.groups.iter().all(|group| group.messages.is_empty());
        if cleared && !self.printed.is_empty() {
            out.push_str(&self.close_line());
            out.push_str("   (history cleared)\n");
            self.printed.clear();
            self.last_label = None;
        }

        let newest = active
            .groups
            .last()
            .and_then(|group| group.messages.last())
            .map(|message| message.id);
        for group in &active.groups {
            for message in &group.messages {
                let streaming =
                    active.typing && !message.outgoing && newest == Some(message.id);
                self.render_message(&mut out, active, view, group, message, streaming);
            }
        }

        if !active.typing {
            out.push_str(&self.close_line());
        }
        out
    }

    fn render_message(
        &mut self,
        out: &mut String,
        active: &ConversationView,
        view: &ViewModel,
        group: &DayGroup,
        message: &MessageView,
        streaming: bool,
    ) {
        if let Some(previous) = self.printed.get(&message.id) {
            if self.open_line == Some(message.id)
                && message.text.len() > previous.len()
                && message.text.starts_with(previous.as_str())
            {
                out.push_str(&message.text[previous.len()..]);
                self.printed.insert(message.id, message.text.clone());
            }
            return;
        }

        out.push_str(&self.close_line());
        if self.last_label != Some(group.label) {
            let _ = writeln!(out, "-- {} --", group.header);
            self.last_label = Some(group.label);
        }

        let author = if message.outgoing {
            view.profile_name.as_str()
        } else {
            active.name.as_str()
        };
        let _ = write!(out, "[{}] {author}: ", message.time_label);
        if let Some(attachment) = &message.attachment {
            let _ = write!(out, "<{}> ", attachment_label(attachment.kind()));
        }
        out.push_str(&message.text);

        if streaming {
            self.open_line = Some(message.id);
        } else {
            if message.outgoing && message.delivery == DeliveryState::Read {
                out.push_str(" ✓✓");
            }
            out.push('\n');
        }
        self.printed.insert(message.id, message.text.clone());
    }

    fn close_line(&mut self) -> String {
        if self.open_line.take().is_some() {
            "\n".to_string()
        } else {
            String::new()
        }
    }

    fn reset(&mut self) {
        self.printed.clear();
        self.last_label = None;
        self.open_line = None;
        self.status = None;
    }
}

fn attachment_label(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Photo => "photo",
        AttachmentKind::Video => "video",
        AttachmentKind::Audio => "audio",
        AttachmentKind::File => "file",
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}
