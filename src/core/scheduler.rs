//! Batch selection and bounded parallel dispatch.
//!
//! A batch picks the oldest eligible notes, caps how many come from a
//! single owner, and runs them on at most `max_concurrency` workers. One
//! note's failure (or panic) never aborts its siblings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::clock::{to_chrono, Clock};
use super::processor::{NoteProcessor, ProcessResult};
use crate::domain::Note;
use crate::store::{EligibilityFilter, NoteStore, StoreError};

/// Most errors kept in a [`BatchResult`]
pub const MAX_BATCH_ERRORS: usize = 20;

/// Candidates fetched per batch slot, so the per-owner cap does not
/// shrink the batch while other owners have work
const OVERFETCH_FACTOR: usize = 4;

/// Batch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Notes per batch when the caller does not say (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Parallel workers per batch (default: 5)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Notes per owner within one batch, 0 for no cap (default: 2)
    #[serde(default = "default_max_per_owner")]
    pub max_per_owner: usize,

    /// Notes at or past this many attempts are left alone, 0 for no cap (default: 5)
    #[serde(default = "default_max_note_attempts")]
    pub max_note_attempts: u32,
}

fn default_batch_size() -> usize {
    10
}
fn default_max_concurrency() -> usize {
    5
}
fn default_max_per_owner() -> usize {
    2
}
fn default_max_note_attempts() -> u32 {
    5
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_per_owner: default_max_per_owner(),
            max_note_attempts: default_max_note_attempts(),
        }
    }
}

/// One failed (or refused) note in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    pub note_id: Uuid,
    pub message: String,
}

/// Summary of one batch run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed_count: usize,
    pub failed_count: usize,

    /// Already processed, busy, or refused by quota
    pub skipped_count: usize,

    /// At most [`MAX_BATCH_ERRORS`] entries
    pub errors: Vec<BatchError>,
}

impl BatchResult {
    fn push_error(&mut self, note_id: Uuid, message: impl Into<String>) {
        if self.errors.len() < MAX_BATCH_ERRORS {
            self.errors.push(BatchError {
                note_id,
                message: message.into(),
            });
        }
    }

    fn tally(&mut self, result: &ProcessResult) {
        match result {
            ProcessResult::Completed { .. } => self.processed_count += 1,
            ProcessResult::AlreadyProcessed { .. } | ProcessResult::Busy { .. } => {
                self.skipped_count += 1
            }
            ProcessResult::QuotaDenied { note_id, decision } => {
                self.skipped_count += 1;
                let reason = decision.reason.as_deref().unwrap_or("Quota denied");
                self.push_error(*note_id, reason);
            }
            ProcessResult::Failed { note_id, error, .. } => {
                self.failed_count += 1;
                self.push_error(*note_id, error.to_string());
            }
        }
    }
}

/// Keep notes in order, at most `max_per_owner` per owner (0 = no cap)
pub fn apply_owner_cap(notes: Vec<Note>, max_per_owner: usize, limit: usize) -> Vec<Note> {
    let mut per_owner: HashMap<String, usize> = HashMap::new();
    let mut selected = Vec::with_capacity(limit.min(notes.len()));

    for note in notes {
        if selected.len() >= limit {
            break;
        }
        let count = per_owner.entry(note.owner_id.clone()).or_insert(0);
        if max_per_owner > 0 && *count >= max_per_owner {
            continue;
        }
        *count += 1;
        selected.push(note);
    }

    selected
}

/// Picks eligible notes and dispatches them to the processor
pub struct BatchScheduler {
    processor: Arc<NoteProcessor>,
    store: Arc<dyn NoteStore>,
    clock: Arc<dyn Clock>,
    settings: BatchSettings,
    stuck_threshold: Duration,
}

impl BatchScheduler {
    pub fn new(
        processor: Arc<NoteProcessor>,
        store: Arc<dyn NoteStore>,
        clock: Arc<dyn Clock>,
        settings: BatchSettings,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            processor,
            store,
            clock,
            settings,
            stuck_threshold,
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Oldest eligible notes for the next batch
    pub async fn select(&self, batch_size: usize) -> Result<Vec<Note>, StoreError> {
        let now = self.clock.now();
        let filter = EligibilityFilter {
            stale_before: Some(now - to_chrono(self.stuck_threshold)),
            max_attempts: (self.settings.max_note_attempts > 0)
                .then_some(self.settings.max_note_attempts),
            recorded_after: None,
        };

        let fetch = if self.settings.max_per_owner > 0 {
            batch_size.saturating_mul(OVERFETCH_FACTOR)
        } else {
            batch_size
        };

        let candidates = self.store.list_eligible_notes(&filter, fetch).await?;
        Ok(apply_owner_cap(
            candidates,
            self.settings.max_per_owner,
            batch_size,
        ))
    }

    /// Process up to `batch_size` notes.
    ///
    /// Fails only when the batch cannot be selected; per-note failures are
    /// counted in the result.
    #[instrument(skip(self))]
    pub async fn process_next_batch(&self, batch_size: usize) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();
        if batch_size == 0 {
            return Ok(result);
        }

        let notes = self.select(batch_size).await.map_err(|e| {
            error!(error = %e, "Failed to select batch");
            e
        })?;

        if notes.is_empty() {
            info!("No eligible notes");
            return Ok(result);
        }

        let workers = batch_size.min(self.settings.max_concurrency).max(1);
        info!(selected = notes.len(), workers, "Dispatching batch");

        let permits = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(notes.len());

        for note in notes {
            let processor = Arc::clone(&self.processor);
            let permits = Arc::clone(&permits);
            let note_id = note.id;

            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                processor.process(note.id, &note.owner_id, false).await
            });
            handles.push((note_id, handle));
        }

        for (note_id, handle) in handles {
            match handle.await {
                Ok(outcome) => result.tally(&outcome),
                Err(e) => {
                    warn!(%note_id, error = %e, "Worker task failed");
                    result.failed_count += 1;
                    result.push_error(note_id, format!("Worker task failed: {}", e));
                }
            }
        }

        info!(
            processed = result.processed_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            "Batch complete"
        );

        Ok(result)
    }
}
