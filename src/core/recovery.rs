//! Stuck-claim recovery.
//!
//! A worker that crashes mid-note leaves `processing_started_at` set. Once
//! that claim is older than the threshold it is cleared, and the note
//! becomes eligible again with its checkpointed transcription and attempt
//! counter intact. A completed note whose forced reprocess died before the
//! new transcription was saved goes back to completed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::clock::{to_chrono, Clock};
use crate::store::{NoteStore, StoreError};

/// Recovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Age after which a claim counts as stuck, in minutes (default: 15)
    #[serde(default = "default_threshold_minutes")]
    pub threshold_minutes: u64,

    /// Most notes reset per sweep (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_threshold_minutes() -> u64 {
    15
}
fn default_batch_size() -> usize {
    50
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            threshold_minutes: default_threshold_minutes(),
            batch_size: default_batch_size(),
        }
    }
}

impl RecoverySettings {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_minutes.saturating_mul(60))
    }
}

/// Notes released by one sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub reset: usize,
    pub note_ids: Vec<Uuid>,
}

pub struct StuckJobRecovery {
    store: Arc<dyn NoteStore>,
    clock: Arc<dyn Clock>,
}

impl StuckJobRecovery {
    pub fn new(store: Arc<dyn NoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Clear claims older than `threshold`, up to `batch_size` notes
    #[instrument(skip(self))]
    pub async fn reset_stuck(
        &self,
        threshold: Duration,
        batch_size: usize,
    ) -> Result<RecoveryReport, StoreError> {
        let now = self.clock.now();
        let stale_before = now - to_chrono(threshold);
        let stuck = self.store.list_stuck(stale_before, batch_size).await?;

        let mut report = RecoveryReport::default();
        for note in stuck {
            let age_minutes = note
                .processing_started_at
                .map(|started| (now - started).num_minutes())
                .unwrap_or_default();

            // The note may have finished or been re-claimed since it was listed
            if self.store.reset_stuck(note.id, stale_before, now).await? {
                info!(
                    note_id = %note.id,
                    attempts = note.processing_attempts,
                    age_minutes,
                    has_transcription = note.transcription.is_some(),
                    "Reset stuck note"
                );
                report.reset += 1;
                report.note_ids.push(note.id);
            } else {
                warn!(note_id = %note.id, "Stuck note changed before reset, skipped");
            }
        }

        if report.reset > 0 {
            info!(reset = report.reset, "Stuck recovery complete");
        }
        Ok(report)
    }
}
