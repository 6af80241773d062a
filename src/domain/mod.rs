//! Domain types for the voxnote orchestrator.
//!
//! This module contains the core data structures:
//! - Note: the unit of work and its derived status
//! - Analysis: the structured LLM output (full or salvaged)
//! - Events: per-note processing log entries
//! - Error: the caller-facing error taxonomy

pub mod analysis;
pub mod error;
pub mod events;
pub mod note;

// Re-export commonly used types
pub use analysis::{
    Analysis, AnalysisField, AnalysisResult, Channel, CrossReference, Domain, DraftMessage, Mood,
    PartialAnalysis, Relation, Sentiment, Task, Topics, Urgency,
};
pub use error::{sanitize_message, NoteError};
pub use events::{NoteEvent, NoteEventType};
pub use note::{AudioRef, ErrorPatch, Note, NoteStatus, NoteUpdate, ProcessingStage};
