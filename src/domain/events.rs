//! Processing events recorded per note.
//!
//! Every transition appends an immutable event. The log backs the quota's
//! trailing-window counters and gives an audit trail per note.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a note's processing log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The note this event belongs to
    pub note_id: Uuid,

    /// Owner of the note (denormalized for per-owner usage queries)
    pub owner_id: String,

    /// Type of event
    pub event_type: NoteEventType,

    /// Human-readable summary (no transcript content)
    pub summary: String,

    /// LLM tokens consumed (completed or failed analysis)
    pub tokens: Option<u64>,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl NoteEvent {
    /// Create a new event at the given time
    pub fn new(
        note_id: Uuid,
        owner_id: impl Into<String>,
        event_type: NoteEventType,
        summary: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            note_id,
            owner_id: owner_id.into(),
            event_type,
            summary: summary.into(),
            tokens: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of note processing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteEventType {
    /// A worker claimed the note (counts toward the hourly quota)
    AttemptStarted,

    /// Transcription persisted as a checkpoint
    TranscriptionSaved,

    /// Analysis persisted, note completed
    AnalysisCompleted,

    /// The attempt failed
    AttemptFailed,

    /// A stale claim was cleared by the stuck-job sweep
    StuckReset,
}

impl NoteEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AttemptStarted => "attempt_started",
            Self::TranscriptionSaved => "transcription_saved",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AttemptFailed => "attempt_failed",
            Self::StuckReset => "stuck_reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "attempt_started" => Some(Self::AttemptStarted),
            "transcription_saved" => Some(Self::TranscriptionSaved),
            "analysis_completed" => Some(Self::AnalysisCompleted),
            "attempt_failed" => Some(Self::AttemptFailed),
            "stuck_reset" => Some(Self::StuckReset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builders() {
        let event = NoteEvent::new(
            Uuid::new_v4(),
            "owner",
            NoteEventType::AnalysisCompleted,
            "done",
            Utc::now(),
        )
        .with_tokens(812)
        .with_duration(1500);

        assert_eq!(event.tokens, Some(812));
        assert_eq!(event.duration_ms, Some(1500));
        assert!(event.error.is_none());
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for ty in [
            NoteEventType::AttemptStarted,
            NoteEventType::TranscriptionSaved,
            NoteEventType::AnalysisCompleted,
            NoteEventType::AttemptFailed,
            NoteEventType::StuckReset,
        ] {
            assert_eq!(NoteEventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(NoteEventType::parse("bogus"), None);
    }
}
