mod commands;
mod render;
mod repl;
mod settings;

use chrono::{Local, Utc};
use courier_engine::{Engine, seed_profile, seed_snapshot};
use courier_llm::create_provider;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::render::Transcript;
use crate::repl::Session;
use crate::settings::{Settings, SettingsStore};

const DEFAULT_LOG_FILTER: &str = "warn";

#[tokio::main]
async fn main() {
    // Logs go to stderr so the transcript on stdout stays readable.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let engine = build_engine(&settings_store.settings());

    let (notes_tx, notes_rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_loop(engine.clone(), notes_rx));

    let mut session = Session::new(engine, settings_store, notes_tx);
    session.note("courier: /help lists commands");
    session.list("");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(error = %error, "failed to read from stdin");
                break;
            }
        };

        match commands::parse(&line) {
            Ok(Some(command)) => {
                if !session.handle(command) {
                    break;
                }
            }
            Ok(None) => {}
            Err(error) => session.note(&error.to_string()),
        }
    }

    drop(session);
    if let Err(error) = renderer.await {
        tracing::error!(error = %error, "renderer task failed");
    }
}

fn build_engine(settings: &Settings) -> Engine {
    let mut profile = seed_profile();
    profile.name = settings.display_name.clone();

    let mut builder =
        Engine::builder(seed_snapshot(Utc::now(), profile)).config(settings.engine_config());

    match settings.to_provider_config().map(create_provider) {
        Some(Ok(source)) => {
            tracing::info!(provider_id = source.id(), model = %settings.model, "token source ready");
            builder = builder.token_source(source);
        }
        Some(Err(error)) => {
            tracing::warn!(error = %error, "token source unavailable, replies will fail");
        }
        None => {
            tracing::warn!(
                "no API key configured; set COURIER_API_KEY or use provider_id \"scripted\""
            );
        }
    }

    builder.build()
}

/// Single writer for stdout: store changes become transcript updates, notes pass through.
async fn render_loop(engine: Engine, mut notes: mpsc::UnboundedReceiver<String>) {
    let mut versions = engine.subscribe();
    let mut transcript = Transcript::default();
    let mut stdout = tokio::io::stdout();

    loop {
        let output = tokio::select! {
            changed = versions.changed() => {
                if changed.is_err() {
                    break;
                }
                transcript.render(&engine.project("", &Local::now()))
            }
            note = notes.recv() => match note {
                Some(note) => note,
                None => break,
            },
        };

        if output.is_empty() {
            continue;
        }
        if stdout.write_all(output.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}
