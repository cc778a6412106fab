use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_engine::{
    Conversation, ConversationId, ConversationKind, Engine, EngineConfig, EngineError,
    FoldOutcome, ManualClock, Message, MessageId, OutgoingMessage, Snapshot, Store,
    StreamIntegrator, UserProfile, commit_send,
};
use courier_llm::{ScriptOutcome, ScriptedSource};

const BOT: &str = "bot";
const FAILURE: &str = "reply failed";

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn seeded_snapshot() -> Snapshot {
    let bot = Conversation::new(
        ConversationId::new(BOT),
        "Bot",
        ConversationKind::Generated { instruction: None },
    )
    .with_unread(5)
    .with_messages(vec![Message::incoming(
        MessageId::new_v7(),
        BOT.into(),
        "Hello!",
        start(),
    )]);
    let notes = Conversation::new("saved".into(), "Saved Messages", ConversationKind::SelfNotes);
    Snapshot::new(vec![notes, bot], UserProfile::default())
}

/// Integrator without a driver so each callback can be stepped by hand.
fn manual_integrator() -> StreamIntegrator {
    let store = Arc::new(Store::new(seeded_snapshot()));
    StreamIntegrator::new(store, Arc::new(ManualClock::new(start())), FAILURE)
}

fn config() -> EngineConfig {
    EngineConfig {
        failure_notice: FAILURE.to_string(),
        ..EngineConfig::default()
    }
}

fn bot_conversation(store: &Store) -> Conversation {
    store
        .snapshot()
        .conversation(&BOT.into())
        .cloned()
        .unwrap()
}

fn engine_with(source: ScriptedSource) -> Engine {
    Engine::builder(seeded_snapshot())
        .config(config())
        .token_source(Arc::new(source))
        .build()
}

async fn wait_until_idle(engine: &Engine, id: &ConversationId) -> Conversation {
    let mut versions = engine.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(conversation) = engine.snapshot().conversation(id)
                && !conversation.awaiting_reply
            {
                return conversation.clone();
            }
            if versions.changed().await.is_err() {
                panic!("store dropped while waiting");
            }
        }
    })
    .await;
    waited.expect("reply never finished")
}

#[test]
fn ordering_scenario_folds_chunks_in_place() {
    let integrator = manual_integrator();
    let committed = commit_send(&integrator, &config(), &BOT.into(), OutgoingMessage::text("hi"))
        .unwrap()
        .unwrap();
    let reply = committed.reply.unwrap();

    let conversation = bot_conversation(integrator.store());
    assert_eq!(conversation.messages.len(), 3);
    assert_eq!(conversation.messages[1].text, "hi");
    assert_eq!(conversation.messages[2].text, "");
    assert!(conversation.awaiting_reply);

    let mut observed = Vec::new();
    for chunk in ["He", "llo!"] {
        assert_eq!(integrator.on_chunk(&reply.ticket, chunk), FoldOutcome::Applied);
        observed.push(bot_conversation(integrator.store()).messages[2].text.clone());
    }
    assert_eq!(observed, vec!["He", "Hello!"]);

    assert!(integrator.on_complete(&reply.ticket));
    let conversation = bot_conversation(integrator.store());
    assert!(!conversation.awaiting_reply);
    assert_eq!(conversation.messages.len(), 3);
    assert_eq!(
        conversation.last_message().map(|message| message.text.as_str()),
        Some("Hello!")
    );
}

#[test]
fn exactly_once_fold_never_duplicates_or_reorders() {
    let integrator = manual_integrator();
    let reply = commit_send(&integrator, &config(), &BOT.into(), OutgoingMessage::text("hi"))
        .unwrap()
        .and_then(|committed| committed.reply)
        .unwrap();

    integrator.on_chunk(&reply.ticket, "Hel");
    assert_eq!(bot_conversation(integrator.store()).messages[2].text, "Hel");
    integrator.on_chunk(&reply.ticket, "lo");
    assert_eq!(bot_conversation(integrator.store()).messages[2].text, "Hello");
    integrator.on_complete(&reply.ticket);
    assert_eq!(integrator.on_chunk(&reply.ticket, "lo"), FoldOutcome::Dropped);
    assert_eq!(bot_conversation(integrator.store()).messages[2].text, "Hello");
}

#[test]
fn error_scenario_appends_a_separate_notice() {
    let integrator = manual_integrator();
    let reply = commit_send(&integrator, &config(), &BOT.into(), OutgoingMessage::text("hi"))
        .unwrap()
        .and_then(|committed| committed.reply)
        .unwrap();

    assert!(integrator.on_error(&reply.ticket, "connection refused"));
    let conversation = bot_conversation(integrator.store());
    assert_eq!(conversation.messages.len(), 4);
    assert_eq!(conversation.messages[2].text, "");
    assert_eq!(conversation.messages[3].text, FAILURE);
    assert!(!conversation.awaiting_reply);
    // The notice does not take over the list preview.
    assert_eq!(conversation.last_message, Some(conversation.messages[1].id));
}

#[test]
fn second_send_while_awaiting_is_rejected_without_changes() {
    let integrator = manual_integrator();
    commit_send(&integrator, &config(), &BOT.into(), OutgoingMessage::text("one")).unwrap();
    let version = integrator.store().snapshot().version();

    let second = commit_send(&integrator, &config(), &BOT.into(), OutgoingMessage::text("two"));
    assert!(matches!(second, Err(EngineError::ReplyInFlight { .. })));
    assert_eq!(integrator.store().snapshot().version(), version);
}

#[test]
fn identifiers_stay_distinct_within_one_millisecond() {
    let integrator = manual_integrator();
    let ids = (0..50)
        .map(|index| {
            commit_send(
                &integrator,
                &config(),
                &"saved".into(),
                OutgoingMessage::text(format!("note {index}")),
            )
            .unwrap()
            .unwrap()
            .message_id
        })
        .collect::<Vec<_>>();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
}

#[test]
fn unread_count_resets_on_selection() {
    let engine = Engine::builder(seeded_snapshot()).build();
    let bot = ConversationId::new(BOT);
    assert_eq!(engine.snapshot().conversation(&bot).unwrap().unread_count, 5);

    engine.select(&bot);
    assert_eq!(engine.snapshot().conversation(&bot).unwrap().unread_count, 0);
}

#[tokio::test]
async fn scripted_reply_completes_end_to_end() {
    let engine = engine_with(ScriptedSource::completing(["He", "llo!"]));
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();

    let conversation = wait_until_idle(&engine, &bot).await;
    assert_eq!(conversation.messages.len(), 3);
    assert_eq!(conversation.messages[2].text, "Hello!");
    assert!(engine.session(&bot).is_none());
}

#[tokio::test]
async fn failing_source_finishes_with_notice() {
    let engine = engine_with(ScriptedSource::failing("offline"));
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();

    let conversation = wait_until_idle(&engine, &bot).await;
    assert_eq!(conversation.messages.len(), 4);
    assert_eq!(conversation.messages[3].text, FAILURE);
}

#[tokio::test]
async fn refused_stream_fails_before_any_task_runs() {
    let engine = engine_with(ScriptedSource::new(
        ["never"],
        ScriptOutcome::RefuseToOpen("quota".to_string()),
    ));
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();

    let conversation = engine.snapshot().conversation(&bot).cloned().unwrap();
    assert!(!conversation.awaiting_reply);
    assert_eq!(conversation.messages.len(), 4);
}

#[tokio::test]
async fn truncated_stream_still_releases_the_conversation() {
    let engine = engine_with(ScriptedSource::new(["partial"], ScriptOutcome::Truncate));
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();

    let conversation = wait_until_idle(&engine, &bot).await;
    assert_eq!(conversation.messages[2].text, "partial");
    assert_eq!(conversation.messages[3].text, FAILURE);
}

#[tokio::test(start_paused = true)]
async fn deleting_mid_stream_is_safe_and_final() {
    let source = ScriptedSource::completing(["a", "b", "c"])
        .with_chunk_delay(Duration::from_millis(20));
    let engine = engine_with(source);
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();
    let session = engine.session(&bot).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.delete_conversation(&bot);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(engine.snapshot().conversation(&bot).is_none());
    assert!(engine.session(&bot).is_none());

    let stale = courier_engine::SessionTicket {
        session_id: session.id,
        conversation_id: bot.clone(),
        reply_message_id: session.reply_message_id,
    };
    assert_eq!(engine.integrator().on_chunk(&stale, "late"), FoldOutcome::Dropped);
    assert!(!engine.integrator().on_complete(&stale));
    assert!(engine.snapshot().conversation(&bot).is_none());
}

#[tokio::test(start_paused = true)]
async fn clearing_mid_stream_discards_the_reply_and_cancels() {
    let source = ScriptedSource::completing(["a", "b", "c"])
        .with_chunk_delay(Duration::from_millis(20));
    let engine = engine_with(source);
    let bot = ConversationId::new(BOT);
    engine.send_message(&bot, OutgoingMessage::text("hi")).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.clear_history(&bot);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let conversation = engine.snapshot().conversation(&bot).cloned().unwrap();
    assert!(conversation.messages.is_empty());
    assert!(conversation.last_message.is_none());
    assert!(!conversation.awaiting_reply);
    assert!(engine.session(&bot).is_none());

    // The conversation accepts a fresh exchange afterwards.
    engine.send_message(&bot, OutgoingMessage::text("again")).unwrap();
    assert!(engine.session(&bot).is_some());
}

#[tokio::test]
async fn streams_in_different_conversations_do_not_interfere() {
    let second = Conversation::new(
        ConversationId::new("bot-2"),
        "Second Bot",
        ConversationKind::Generated { instruction: None },
    );
    let initial = seeded_snapshot()
        .apply(&courier_engine::Mutation::CreateConversation {
            conversation: second,
            activate: false,
        })
        .unwrap();
    let engine = Engine::builder(initial)
        .config(config())
        .token_source(Arc::new(ScriptedSource::completing(["ok"])))
        .build();

    let bot = ConversationId::new(BOT);
    let other = ConversationId::new("bot-2");
    engine.send_message(&bot, OutgoingMessage::text("one")).unwrap();
    engine.send_message(&other, OutgoingMessage::text("two")).unwrap();

    assert_eq!(wait_until_idle(&engine, &bot).await.messages[2].text, "ok");
    assert_eq!(wait_until_idle(&engine, &other).await.messages[1].text, "ok");
}

#[test]
fn concurrent_clears_never_strand_a_reply() {
    // No token source: every reply fails on the sending thread, racing the clears.
    let engine = Engine::builder(seeded_snapshot()).config(config()).build();
    let bot = ConversationId::new(BOT);

    std::thread::scope(|scope| {
        let sender = scope.spawn(|| {
            (0..200)
                .map(|turn| engine.send_message(&bot, OutgoingMessage::text(format!("m{turn}"))))
                .filter(|sent| sent.is_err())
                .count()
        });
        scope.spawn(|| {
            for _ in 0..200 {
                engine.clear_history(&bot);
                std::thread::yield_now();
            }
        });
        assert_eq!(sender.join().unwrap(), 0);
    });

    assert!(engine.session(&bot).is_none());
    assert!(!engine.snapshot().conversation(&bot).unwrap().awaiting_reply);
    assert!(engine.send_message(&bot, OutgoingMessage::text("still here")).is_ok());
}
