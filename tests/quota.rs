//! Quota Integration Tests
//!
//! Usage is computed from the store (notes, audio bytes and the event log),
//! so these tests seed events directly and check the guard's decision.

mod common;

use common::Harness;
use uuid::Uuid;
use voxnote::core::{Clock, OrchestratorSettings, ProcessResult, QuotaDenial};
use voxnote::domain::{NoteEvent, NoteEventType};
use voxnote::store::NoteStore;

async fn seed_attempts(h: &Harness, owner: &str, note_id: Uuid, count: usize) {
    for _ in 0..count {
        h.store
            .record_event(&NoteEvent::new(
                note_id,
                owner,
                NoteEventType::AttemptStarted,
                "Attempt started",
                h.clock.now(),
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_processing_limit_at_ten_denies() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    seed_attempts(&h, "alice", note.id, 10).await;

    let decision = h.orchestrator.quota("alice").await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("Processing limit"));
    assert_eq!(decision.usage.processing_last_hour, 10);
    assert_eq!(decision.limits.max_processing_per_hour, 10);
}

#[tokio::test]
async fn test_processing_limit_at_nine_allows() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    seed_attempts(&h, "alice", note.id, 9).await;

    let decision = h.orchestrator.quota("alice").await;
    assert!(decision.allowed);
    assert!(decision.reason.is_none());
}

#[tokio::test]
async fn test_attempts_older_than_an_hour_do_not_count() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    seed_attempts(&h, "alice", note.id, 10).await;

    h.clock.advance(std::time::Duration::from_secs(61 * 60));

    assert!(h.orchestrator.quota("alice").await.allowed);
}

#[tokio::test]
async fn test_denied_note_is_left_untouched() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    seed_attempts(&h, "alice", note.id, 10).await;

    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    match &result {
        ProcessResult::QuotaDenied { decision, .. } => {
            assert_eq!(
                decision.denial,
                Some(QuotaDenial::Exceeded {
                    dimension: voxnote::core::QuotaDimension::Processing
                })
            );
        }
        other => panic!("expected quota denial, got {:?}", other),
    }
    assert_eq!(result.status_code(), 429);

    // The quota check never writes
    let stored = h.note(note.id).await;
    assert_eq!(stored.processing_attempts, 0);
    assert!(stored.processing_started_at.is_none());
    assert_eq!(h.transcriber.calls(), 0);
}

#[tokio::test]
async fn test_token_limit_counts_analysis_usage() {
    let mut settings = OrchestratorSettings::default();
    settings.quota.max_tokens_per_day = 1_000;
    let h = Harness::with_settings(settings);

    let first = h.add_note("alice", b"a").await;
    let second = h.add_note("alice", b"b").await;
    h.analyzer.set_fallback(Ok(common::completion(common::VALID_ANALYSIS, 1_000)));

    assert!(h.orchestrator.process_note(first.id, "alice", false).await.is_completed());

    let decision = h.orchestrator.quota("alice").await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("Token limit"));
    assert!(matches!(
        h.orchestrator.process_note(second.id, "alice", false).await,
        ProcessResult::QuotaDenied { .. }
    ));
}

#[tokio::test]
async fn test_unusable_analysis_still_counts_tokens() {
    let mut settings = OrchestratorSettings::default();
    settings.quota.max_tokens_per_day = 1_000;
    let h = Harness::with_settings(settings);

    let note = h.add_note("alice", b"a").await;
    h.analyzer
        .set_fallback(Ok(common::completion("not json at all", 5_000)));

    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    assert!(matches!(
        result,
        ProcessResult::Failed {
            error: voxnote::domain::NoteError::Processing { transient: true, .. },
            ..
        }
    ));

    let events = h.store.events_for(note.id).await.unwrap();
    let failed = events
        .iter()
        .find(|e| e.event_type == NoteEventType::AttemptFailed)
        .unwrap();
    assert_eq!(failed.tokens, Some(5_000));

    let decision = h.orchestrator.quota("alice").await;
    assert_eq!(decision.usage.tokens_last_day, 5_000);
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("Token limit"));
}

#[tokio::test]
async fn test_unknown_owner_fails_closed() {
    let h = Harness::new();

    let decision = h.orchestrator.quota("nobody").await;
    assert!(!decision.allowed);
    assert_eq!(decision.denial, Some(QuotaDenial::UnknownOwner));
    assert_eq!(decision.denial.unwrap().status_code(), 404);
}

#[tokio::test]
async fn test_first_violation_is_reported() {
    let mut settings = OrchestratorSettings::default();
    settings.quota.max_notes = 1;
    settings.quota.max_processing_per_hour = 1;
    let h = Harness::with_settings(settings);

    let note = h.add_note("alice", b"a").await;
    h.add_note("alice", b"b").await;
    seed_attempts(&h, "alice", note.id, 1).await;

    // Both dimensions are over; only the first one checked is named
    let decision = h.orchestrator.quota("alice").await;
    assert_eq!(decision.reason.as_deref(), Some("Note limit exceeded"));
}
