//! voxnote - Voice note processing orchestrator
//!
//! Turns recorded voice notes into a transcription and a structured
//! analysis, tolerating flaky providers along the way.
//!
//! # Architecture
//!
//! Each note moves through two checkpointed stages:
//! - Transcription is persisted as soon as it succeeds
//! - Analysis runs against the saved transcription, so a retry after an
//!   analysis failure never re-transcribes
//! - A claim on the note (`processing_started_at`) keeps at most one worker
//!   on it; stale claims are swept by recovery
//!
//! # Modules
//!
//! - `adapters`: Provider and blob integrations (OpenAI-compatible HTTP, filesystem)
//! - `core`: Orchestration logic (circuit breakers, retry, quota, processor, batches)
//! - `stages`: Transcription and analysis stage logic
//! - `store`: Note persistence (SQLite)
//! - `domain`: Data structures (Note, Analysis, NoteEvent, NoteError)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a recording
//! voxnote add memo.m4a --owner alice
//!
//! # Process it
//! voxnote process <note-id> --owner alice
//!
//! # Process the backlog every minute
//! voxnote run --interval 60
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{BatchResult, Orchestrator, OrchestratorSettings, ProcessResult, QuotaDecision};
pub use domain::{Note, NoteError, NoteEvent, NoteStatus};
pub use store::{NoteStore, SqliteNoteStore};
