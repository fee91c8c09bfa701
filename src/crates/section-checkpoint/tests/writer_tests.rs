//! Integration tests for checkpoint writers and the exit flush

mod common;

use common::{counting_engine, memory_engine};
use section_checkpoint::testing::{FakePlayer, RecordingBeacon};
use section_checkpoint::{
    CheckpointKind, FnSource, MediaPosition, PlayerKind, RestoreContext, SamplingPolicy, Snapshot,
    TranscriptMessage, TranscriptSnapshot,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_no_writes_after_stop() {
    let (engine, backend) = counting_engine();
    let ticks = Arc::new(AtomicU64::new(0));
    let source_ticks = ticks.clone();
    let source = Arc::new(FnSource::new(move || {
        let n = source_ticks.fetch_add(1, Ordering::SeqCst);
        Some(Snapshot::Generic(json!({"tick": n})))
    }));

    let writer = engine.start_checkpointing("quiz-3", source, SamplingPolicy::every(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(writer.last_persisted().is_some());

    writer.stop();
    let writes = backend.write_count();
    let sampled = ticks.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.write_count(), writes);
    assert_eq!(ticks.load(Ordering::SeqCst), sampled);
    assert!(writer.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_writer_cancels_timer() {
    let (engine, backend) = counting_engine();
    let source = Arc::new(FnSource::new(|| Some(Snapshot::Generic(json!({"t": 1})))));

    {
        let _writer = engine.start_checkpointing("quiz-3", source, SamplingPolicy::every(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }

    let writes = backend.write_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.write_count(), writes);
    assert_eq!(engine.exit_flusher().registered_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wedged_local_player_stops_writer() {
    let (engine, backend) = counting_engine();
    let player = Arc::new(FakePlayer::new(600.0));
    player.set_ready_delay(Duration::from_secs(3600));

    let writer = engine.start_media_checkpointing("lecture-6", "vid-6", player.clone(), PlayerKind::Local);
    let writes = backend.write_count();

    // Grace, one interval, then the full liveness timeout
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(writer.is_stopped());
    assert_eq!(engine.exit_flusher().registered_count(), 0);

    let calls = player.call_count();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(player.call_count(), calls);
    assert_eq!(backend.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_small_position_changes_are_not_written() {
    let (engine, backend) = counting_engine();
    let player = Arc::new(FakePlayer::new(600.0));
    player.set_position(10.0);

    let writer = engine.start_media_checkpointing("lecture-5", "vid-5", player.clone(), PlayerKind::Local);

    // Grace period plus the first sample
    tokio::time::sleep(Duration::from_millis(4100)).await;
    let writes = backend.write_count();

    player.set_position(10.4);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.write_count(), writes);

    player.set_position(12.0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.write_count(), writes + 1);
    assert_eq!(
        writer.last_persisted(),
        Some(Snapshot::Media(MediaPosition::new("vid-5", 12.0, 600.0)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_exit_flush_writes_last_sample() {
    let (engine, _) = memory_engine();
    let beacon = Arc::new(RecordingBeacon::new());
    engine.set_beacon(beacon.clone());

    let player = Arc::new(FakePlayer::new(600.0));
    player.set_position(100.0);
    let _writer = engine.start_media_checkpointing("lecture-5", "vid-5", player.clone(), PlayerKind::Remote);

    tokio::time::sleep(Duration::from_millis(5100)).await;
    player.set_position(100.5);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(engine.flush_on_exit(), 1);
    let record = engine.saved_section("lecture-5", CheckpointKind::Media).unwrap();
    assert_eq!(record.payload, Snapshot::Media(MediaPosition::new("vid-5", 100.5, 600.0)));
    assert_eq!(beacon.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_welcome_only_transcript_never_overwrites() {
    let (engine, _) = memory_engine();
    let writer = engine.start_reactive("ask-ai-main");

    let welcome = TranscriptMessage::welcome("Hi! Ask me anything about this lesson.");
    assert!(!writer.observe(Snapshot::Transcript(TranscriptSnapshot::new(vec![welcome.clone()]))));
    assert!(engine.saved_section("ask-ai-main", CheckpointKind::Transcript).is_none());

    let conversation = TranscriptSnapshot::new(vec![
        welcome.clone(),
        TranscriptMessage::user("What is a derivative?"),
        TranscriptMessage::ai("The rate of change of a function."),
    ])
    .with_draft("And an integral?");
    assert!(writer.observe(Snapshot::Transcript(conversation.clone())));

    // A remount re-initialises the view with only the welcome entry
    let remounted = engine.start_reactive("ask-ai-main");
    assert!(!remounted.observe(Snapshot::Transcript(TranscriptSnapshot::new(vec![welcome]))));

    let outcome = engine.restore("ask-ai-main", RestoreContext::Transcript).await;
    let record = outcome.record().unwrap();
    assert_eq!(record.payload, Snapshot::Transcript(conversation));
}

#[tokio::test(start_paused = true)]
async fn test_last_active_section_follows_media() {
    let (engine, _) = memory_engine();
    let player = Arc::new(FakePlayer::new(300.0));

    let first = engine.start_media_checkpointing("lecture-1", "vid-1", player.clone(), PlayerKind::Local);
    first.stop();
    let _second = engine.start_media_checkpointing("lecture-2", "vid-2", player, PlayerKind::Local);

    assert_eq!(engine.last_active_section().as_deref(), Some("lecture-2"));
}
