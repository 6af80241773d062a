//! Analysis Salvage Integration Tests
//!
//! How much of an invalid model response is kept, under the default and a
//! stricter salvage policy.

mod common;

use common::{completion, Harness};
use voxnote::core::{OrchestratorSettings, ProcessResult};
use voxnote::domain::{AnalysisField, AnalysisResult, NoteError, NoteStatus};
use voxnote::stages::SalvagePolicy;

const TITLE_AND_SUMMARY_BAD_MOOD: &str = r#"{
  "title": "Weekend plans",
  "summary": "Hiking on Saturday, groceries on Sunday.",
  "sentiment": {"mood": "thrilled", "score": 0.9},
  "tasks": [
    {"description": "Buy groceries", "urgency": "low"},
    {"description": "Pack boots", "urgency": "whenever"}
  ]
}"#;

fn strict_settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    settings.salvage = SalvagePolicy {
        required: vec![AnalysisField::Title, AnalysisField::Summary],
        min_fields: 4,
    };
    settings
}

#[tokio::test]
async fn test_default_policy_keeps_valid_fields() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    h.analyzer
        .set_fallback(Ok(completion(TITLE_AND_SUMMARY_BAD_MOOD, 300)));

    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    let ProcessResult::Completed {
        analysis, warning, ..
    } = result
    else {
        panic!("expected completion, got {:?}", result);
    };

    let AnalysisResult::Partial(partial) = analysis else {
        panic!("expected a partial analysis");
    };
    assert_eq!(partial.title.as_deref(), Some("Weekend plans"));
    assert!(partial.sentiment.is_none());
    // The task with an unknown urgency is dropped, the other kept
    assert_eq!(partial.tasks.len(), 1);
    assert_eq!(partial.tasks[0].description, "Buy groceries");
    assert!(warning.is_some());
}

#[tokio::test]
async fn test_missing_summary_is_not_salvageable() {
    let h = Harness::new();
    let note = h.add_note("alice", b"audio").await;
    h.analyzer.set_fallback(Ok(completion(
        r#"{"title": "Only a title", "key_ideas": ["one", "two"]}"#,
        50,
    )));

    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    assert!(matches!(
        result,
        ProcessResult::Failed {
            error: NoteError::Processing { transient: true, .. },
            ..
        }
    ));
    assert_eq!(h.note(note.id).await.status(), NoteStatus::Failed);
}

#[tokio::test]
async fn test_strict_policy_rejects_thin_salvage() {
    let h = Harness::with_settings(strict_settings());
    let note = h.add_note("alice", b"audio").await;
    h.analyzer
        .set_fallback(Ok(completion(TITLE_AND_SUMMARY_BAD_MOOD, 300)));

    // Title, summary and tasks recovered: one short of the minimum
    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    assert!(!result.is_completed());
}

#[tokio::test]
async fn test_strict_policy_accepts_rich_salvage() {
    let h = Harness::with_settings(strict_settings());
    let note = h.add_note("alice", b"audio").await;
    h.analyzer.set_fallback(Ok(completion(
        r#"{
  "title": "Weekend plans",
  "summary": "Hiking on Saturday.",
  "sentiment": {"mood": "thrilled"},
  "topics": {"primary": "outdoors", "domain": "personal"},
  "key_ideas": ["Start early to avoid the heat"],
  "tasks": [{"description": "Pack boots", "urgency": "medium"}]
}"#,
        300,
    )));

    let result = h.orchestrator.process_note(note.id, "alice", false).await;
    match result {
        ProcessResult::Completed { analysis, .. } => {
            assert!(analysis.is_partial());
            assert_eq!(analysis.summary(), Some("Hiking on Saturday."));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}
