//! Persistence seam for notes and their processing events.
//!
//! The orchestrator only talks to [`NoteStore`]. Two operations carry the
//! whole lock discipline of the system: [`NoteStore::claim_note`] and
//! [`NoteStore::reset_stuck`] are single atomic conditional updates.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Note, NoteError, NoteEvent, NoteUpdate};

pub use sqlite::SqliteNoteStore;

/// Errors raised by a note store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Note not found: {0}")]
    NotFound(Uuid),

    /// The claim this write was made under is no longer held
    #[error("Concurrent modification of note {0}")]
    ConcurrentModification(Uuid),

    #[error("Unknown owner: {0}")]
    UnknownOwner(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

impl From<StoreError> for NoteError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(note_id) => NoteError::NotFound { note_id },
            StoreError::ConcurrentModification(_) => NoteError::Busy,
            other => NoteError::storage(other.to_string()),
        }
    }
}

/// Proof of an exclusive processing claim on a note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub note_id: Uuid,

    /// Fresh per claim; guards every write made under it
    pub token: Uuid,

    pub started_at: DateTime<Utc>,
}

/// Parameters of an atomic claim attempt
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub note_id: Uuid,
    pub now: DateTime<Utc>,

    /// Claims started before this instant are stale and may be taken over
    pub stale_before: DateTime<Utc>,

    /// Claim a completed note again. `processed_at` stays set until the
    /// worker clears it with [`NoteUpdate::clear_processed`].
    pub reopen: bool,
}

/// Selection rules for batch candidates
#[derive(Debug, Clone, Default)]
pub struct EligibilityFilter {
    /// Also include notes whose claim started before this instant.
    /// `None` selects unclaimed notes only.
    pub stale_before: Option<DateTime<Utc>>,

    /// Skip notes whose attempt counter reached this cap
    pub max_attempts: Option<u32>,

    /// Skip notes recorded before this instant
    pub recorded_after: Option<DateTime<Utc>>,
}

/// Persisted usage figures for one owner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerUsage {
    pub note_count: u64,
    pub storage_bytes: u64,

    /// Attempts started in the trailing hour
    pub processing_last_hour: u64,

    /// Provider tokens consumed in the trailing day, failed attempts included
    pub tokens_last_day: u64,
}

/// Title and summary of an earlier completed note
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorNote {
    pub note_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub title: Option<String>,
    pub summary: Option<String>,
}

/// Note persistence
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn insert_note(&self, note: &Note) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] for unknown ids
    async fn get_note(&self, note_id: Uuid) -> Result<Note, StoreError>;

    /// Atomically claim a note for processing.
    ///
    /// Succeeds only if the note is unclaimed (or its claim is stale) and
    /// either not yet processed or `reopen` is set. Increments the attempt
    /// counter and records an `attempt_started` event. Returns `None` when
    /// another worker holds the claim or the note is already processed.
    async fn claim_note(&self, request: ClaimRequest) -> Result<Option<Claim>, StoreError>;

    /// Apply an update made under `claim`.
    ///
    /// Fails with [`StoreError::ConcurrentModification`] if the claim was
    /// reset or taken over in the meantime.
    async fn update_note(&self, claim: &Claim, update: NoteUpdate) -> Result<Note, StoreError>;

    /// Unprocessed candidates, oldest `recorded_at` first
    async fn list_eligible_notes(
        &self,
        filter: &EligibilityFilter,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError>;

    /// Notes whose claim started before `stale_before` and is still held
    async fn list_stuck(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Note>, StoreError>;

    /// Clear a stale claim, keeping partial progress. Returns false if the
    /// claim was released or taken over since the note was listed.
    async fn reset_stuck(
        &self,
        note_id: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::UnknownOwner`] if the owner has no notes
    async fn owner_usage(&self, owner_id: &str, now: DateTime<Utc>)
        -> Result<OwnerUsage, StoreError>;

    async fn record_event(&self, event: &NoteEvent) -> Result<(), StoreError>;

    /// Events for a note, oldest first
    async fn events_for(&self, note_id: Uuid) -> Result<Vec<NoteEvent>, StoreError>;

    /// The owner's most recently completed notes, excluding `exclude`
    async fn recent_completed(
        &self,
        owner_id: &str,
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<PriorNote>, StoreError>;
}
