//! Note model and derived processing status.
//!
//! The nullable timestamp fields are the durable source of truth (the stuck
//! job sweep reads them directly). Internal logic works with the derived
//! [`NoteStatus`] instead of re-checking field combinations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::AnalysisResult;

/// Opaque handle resolvable by the blob store into audio bytes + MIME type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(pub String);

impl AudioRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A recorded voice note, the unit of work for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier
    pub id: Uuid,

    /// Owning user (held by value, never dereferenced)
    pub owner_id: String,

    /// Where the raw audio lives
    pub audio_ref: AudioRef,

    /// Size of the audio payload in bytes (storage quota)
    pub audio_bytes: u64,

    /// When the note was recorded (immutable)
    pub recorded_at: DateTime<Utc>,

    /// Transcribed text, checkpointed before analysis runs
    pub transcription: Option<String>,

    /// Structured analysis of the transcription
    pub analysis: Option<AnalysisResult>,

    /// Set while a worker holds the claim
    pub processing_started_at: Option<DateTime<Utc>>,

    /// Set only on terminal success
    pub processed_at: Option<DateTime<Utc>>,

    /// Number of claims ever taken on this note
    pub processing_attempts: u32,

    /// Last failure message (cleared on success)
    pub error_message: Option<String>,

    /// When the last failure happened
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Note {
    /// Create a fresh, unprocessed note
    pub fn new(
        owner_id: impl Into<String>,
        audio_ref: AudioRef,
        audio_bytes: u64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            audio_ref,
            audio_bytes,
            recorded_at,
            transcription: None,
            analysis: None,
            processing_started_at: None,
            processed_at: None,
            processing_attempts: 0,
            error_message: None,
            last_error_at: None,
        }
    }

    /// Derive the lifecycle status from the timestamp fields
    pub fn status(&self) -> NoteStatus {
        if self.processing_started_at.is_some() {
            NoteStatus::InProgress
        } else if self.processed_at.is_some() {
            NoteStatus::Completed
        } else if self.error_message.is_some() {
            NoteStatus::Failed
        } else if self.transcription.is_some() {
            NoteStatus::AnalyzingOnly
        } else {
            NoteStatus::Unprocessed
        }
    }
}

/// Lifecycle status of a note, recomputed from its fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    /// Never attempted
    Unprocessed,

    /// Claimed by a worker
    InProgress,

    /// Transcribed but not yet analyzed (resumable)
    AnalyzingOnly,

    /// Transcription and analysis persisted
    Completed,

    /// Last attempt failed
    Failed,
}

/// Stage of the per-note processing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Unclaimed,
    Claimed,
    Transcribing,
    Analyzing,
    Completed,
    Failed,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unclaimed => "unclaimed",
            Self::Claimed => "claimed",
            Self::Transcribing => "transcribing",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pending change to the error fields of a note
#[derive(Debug, Clone, Default)]
pub enum ErrorPatch {
    #[default]
    Keep,
    Set {
        message: String,
        at: DateTime<Utc>,
    },
    Clear,
}

/// Partial update applied by a worker holding the claim
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub transcription: Option<String>,
    pub analysis: Option<AnalysisResult>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Clear `processed_at`; a forced reprocess leaves the completed state
    pub clear_processed: bool,
    pub error: ErrorPatch,
    /// Clear `processing_started_at` (and the claim token)
    pub release_claim: bool,
}

impl NoteUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcription(mut self, text: impl Into<String>) -> Self {
        self.transcription = Some(text.into());
        self
    }

    pub fn analysis(mut self, analysis: AnalysisResult) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn clear_processed(mut self) -> Self {
        self.clear_processed = true;
        self
    }

    pub fn set_error(mut self, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.error = ErrorPatch::Set {
            message: message.into(),
            at,
        };
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = ErrorPatch::Clear;
        self
    }

    pub fn release_claim(mut self) -> Self {
        self.release_claim = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> Note {
        Note::new("owner-1", AudioRef::new("abc.webm"), 1024, Utc::now())
    }

    #[test]
    fn test_status_derivation() {
        let mut n = note();
        assert_eq!(n.status(), NoteStatus::Unprocessed);

        n.transcription = Some("hello".to_string());
        assert_eq!(n.status(), NoteStatus::AnalyzingOnly);

        n.error_message = Some("boom".to_string());
        assert_eq!(n.status(), NoteStatus::Failed);

        n.processing_started_at = Some(Utc::now());
        assert_eq!(n.status(), NoteStatus::InProgress);

        n.processing_started_at = None;
        n.processed_at = Some(Utc::now());
        assert_eq!(n.status(), NoteStatus::Completed);
    }

    #[test]
    fn test_update_builder() {
        let at = Utc::now();
        let update = NoteUpdate::new()
            .transcription("text")
            .set_error("failed", at)
            .release_claim();

        assert_eq!(update.transcription.as_deref(), Some("text"));
        assert!(matches!(update.error, ErrorPatch::Set { .. }));
        assert!(update.release_claim);
        assert!(update.processed_at.is_none());
    }
}
