use chrono::Local;
use courier_engine::{Attachment, ConversationId, Engine, OutgoingMessage, ProfilePatch};
use tokio::sync::mpsc;

use crate::commands::{Command, ConversationRef, HELP, data_uri_mime};
use crate::render::render_list;
use crate::settings::{Settings, SettingsStore};

/// Applies parsed commands to the engine.
///
/// Transcript output comes from the renderer; this only emits listings and notes.
pub struct Session {
    engine: Engine,
    settings: SettingsStore,
    notes: mpsc::UnboundedSender<String>,
    listing: Vec<ConversationId>,
}

impl Session {
    pub fn new(
        engine: Engine,
        settings: SettingsStore,
        notes: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            engine,
            settings,
            notes,
            listing: Vec::new(),
        }
    }

    /// Returns false once the user asked to quit.
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::List { filter } => self.list(&filter),
            Command::Open(target) => self.open(&target),
            Command::Back => {
                self.engine.back();
            }
            Command::Clear => {
                if let Some(id) = self.require_active() {
                    self.engine.clear_history(&id);
                }
            }
            Command::Delete => {
                if let Some(id) = self.require_active() {
                    self.engine.delete_conversation(&id);
                    self.listing.retain(|listed| listed != &id);
                }
            }
            Command::Mute => {
                if let Some(id) = self.require_active() {
                    let snapshot = self.engine.toggle_mute(&id);
                    let muted = snapshot.conversation(&id).is_some_and(|c| c.muted);
                    self.note(if muted { "muted" } else { "unmuted" });
                }
            }
            Command::Stop => {
                if let Some(id) = self.require_active()
                    && !self.engine.stop_reply(&id)
                {
                    self.note("nothing is streaming");
                }
            }
            Command::Group { name } => match self.engine.create_group(&name) {
                Ok(Some(_)) => {}
                Ok(None) => self.note("group name cannot be blank"),
                Err(error) => self.note(&error.to_string()),
            },
            Command::Rename { name } => self.rename(name),
            Command::Photo { source, caption } => {
                let attachment = Attachment::from_mime(data_uri_mime(&source), source.clone(), None);
                self.send(OutgoingMessage::text(caption).with_attachment(attachment));
            }
            Command::Send(text) => self.send(OutgoingMessage::text(text)),
            Command::Help => self.note(HELP),
            Command::Quit => return false,
        }
        true
    }

    pub fn list(&mut self, filter: &str) {
        let view = self.engine.project(filter, &Local::now());
        self.listing = view.conversations.iter().map(|row| row.id.clone()).collect();
        let _ = self.notes.send(render_list(&view.conversations));
    }

    pub fn note(&self, text: &str) {
        let _ = self.notes.send(format!("{text}\n"));
    }

    fn open(&mut self, target: &ConversationRef) {
        let Some(id) = self.resolve(target) else {
            self.note("no such conversation; /list shows what is available");
            return;
        };
        self.engine.select(&id);
    }

    fn resolve(&self, target: &ConversationRef) -> Option<ConversationId> {
        let id = match target {
            ConversationRef::Position(position) => {
                self.listing.get(position.checked_sub(1)?)?.clone()
            }
            ConversationRef::Id(raw) => ConversationId::new(raw),
        };
        self.engine.snapshot().conversation(&id).map(|_| id)
    }

    fn require_active(&self) -> Option<ConversationId> {
        let active = self.engine.snapshot().active_id().cloned();
        if active.is_none() {
            self.note("open a conversation first");
        }
        active
    }

    fn send(&self, outgoing: OutgoingMessage) {
        let Some(id) = self.require_active() else {
            return;
        };
        if let Err(error) = self.engine.send_message(&id, outgoing) {
            self.note(&error.to_string());
        }
    }

    fn rename(&self, name: String) {
        self.engine.update_profile(ProfilePatch {
            name: Some(name.clone()),
            ..ProfilePatch::default()
        });

        let settings = Settings {
            display_name: name,
            ..Settings::clone(&self.settings.settings())
        };
        if let Err(error) = self.settings.update(settings) {
            tracing::warn!(error = %error, "failed to persist display name");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_engine::{seed_profile, seed_snapshot};

    use super::*;

    fn session() -> (Session, mpsc::UnboundedReceiver<String>) {
        let engine = Engine::builder(seed_snapshot(Utc::now(), seed_profile())).build();
        let path = std::env::temp_dir()
            .join(format!("courier-repl-{}", uuid::Uuid::now_v7()))
            .join("settings.json");
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        (Session::new(engine, SettingsStore::new(path), notes_tx), notes_rx)
    }

    #[test]
    fn open_by_position_uses_the_last_listing() {
        let (mut session, mut notes) = session();
        session.list("");
        assert!(notes.try_recv().unwrap().starts_with(" 1. Saved Messages"));

        assert!(session.handle(Command::Open(ConversationRef::Position(1))));
        let active = session.engine.snapshot().active_id().cloned();
        assert_eq!(active.as_ref().map(ConversationId::as_str), Some("saved"));
    }

    #[test]
    fn commands_needing_a_conversation_explain_themselves() {
        let (mut session, mut notes) = session();
        session.handle(Command::Send("hello".to_string()));
        assert_eq!(notes.try_recv().unwrap(), "open a conversation first\n");

        session.handle(Command::Open(ConversationRef::Position(9)));
        assert!(notes.try_recv().unwrap().starts_with("no such conversation"));
    }

    #[test]
    fn quit_stops_the_loop() {
        let (mut session, _notes) = session();
        assert!(!session.handle(Command::Quit));
    }
}
