//! Per-note processing state machine.
//!
//! `Unclaimed → Claimed → Transcribing → Analyzing → Completed`, with
//! `Failed` reachable from every stage after the claim. Side effects are
//! strictly ordered: the quota check never writes, the claim precedes any
//! external call, and the transcription is checkpointed before analysis so
//! a later attempt can resume from the analyzing-only state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::clock::{to_chrono, Clock};
use super::quota::{QuotaDecision, QuotaGuard};
use super::retry::RetryExecutor;
use crate::adapters::{AudioPayload, BlobStore};
use crate::domain::{
    AnalysisResult, AudioRef, Note, NoteError, NoteEvent, NoteEventType, NoteStatus, NoteUpdate,
    ProcessingStage,
};
use crate::stages::{
    AnalysisInput, AnalysisStage, StageError, TranscriptionStage, STORAGE_SERVICE,
};
use crate::store::{Claim, ClaimRequest, NoteStore, PriorNote, StoreError};

/// Outcome of processing one note
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessResult {
    Completed {
        note_id: Uuid,
        analysis: AnalysisResult,
        /// Set when the analysis was salvaged
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
        /// The checkpointed transcription was used instead of a new call
        transcription_reused: bool,
        transcription_attempts: u32,
        analysis_attempts: u32,
        tokens_used: u64,
    },

    AlreadyProcessed {
        note_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        analysis: Option<AnalysisResult>,
    },

    QuotaDenied {
        note_id: Uuid,
        decision: QuotaDecision,
    },

    Busy {
        note_id: Uuid,
    },

    Failed {
        note_id: Uuid,
        stage: ProcessingStage,
        error: NoteError,
    },
}

impl ProcessResult {
    pub fn note_id(&self) -> Uuid {
        match self {
            Self::Completed { note_id, .. }
            | Self::AlreadyProcessed { note_id, .. }
            | Self::QuotaDenied { note_id, .. }
            | Self::Busy { note_id }
            | Self::Failed { note_id, .. } => *note_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// HTTP-equivalent status for the trigger surface
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Completed { .. } | Self::AlreadyProcessed { .. } => 200,
            Self::QuotaDenied { decision, .. } => decision
                .denial
                .as_ref()
                .map(|d| d.status_code())
                .unwrap_or(429),
            Self::Busy { .. } => 409,
            Self::Failed { error, .. } => error.status_code(),
        }
    }
}

/// Processor tuning
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Claims older than this may be taken over
    pub stuck_threshold: Duration,

    /// Completed notes passed to the analysis as prior context
    pub prior_context_limit: usize,

    /// Per-attempt timeout for blob fetches
    pub storage_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(15 * 60),
            prior_context_limit: 5,
            storage_timeout: Duration::from_secs(30),
        }
    }
}

/// A stage failure with the stage it happened in
struct StageFailure {
    stage: ProcessingStage,
    error: NoteError,
    /// Provider tokens already spent in the failed attempt
    tokens_used: Option<u64>,
}

impl StageFailure {
    fn from_stage(stage: ProcessingStage, err: StageError) -> Self {
        Self {
            stage,
            error: err.to_note_error(stage),
            tokens_used: err.tokens_used(),
        }
    }

    fn from_store(stage: ProcessingStage, err: StoreError) -> Self {
        Self {
            stage,
            error: err.into(),
            tokens_used: None,
        }
    }

    fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Drives one note through transcription and analysis
pub struct NoteProcessor {
    store: Arc<dyn NoteStore>,
    blobs: Arc<dyn BlobStore>,
    quota: QuotaGuard,
    retry: Arc<RetryExecutor>,
    transcription: TranscriptionStage,
    analysis: AnalysisStage,
    clock: Arc<dyn Clock>,
    settings: ProcessorSettings,
}

impl NoteProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn NoteStore>,
        blobs: Arc<dyn BlobStore>,
        quota: QuotaGuard,
        retry: Arc<RetryExecutor>,
        transcription: TranscriptionStage,
        analysis: AnalysisStage,
        clock: Arc<dyn Clock>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            quota,
            retry,
            transcription,
            analysis,
            clock,
            settings,
        }
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    /// Process a note on behalf of its owner. Never returns an error:
    /// every outcome, including failure, is a [`ProcessResult`].
    ///
    /// A forced reprocess of a completed note keeps it completed until the
    /// new transcription is checkpointed. If the forced run fails before
    /// that, the note keeps its previous transcription and analysis and is
    /// not put back in the batch queue.
    #[instrument(skip(self))]
    pub async fn process(
        &self,
        note_id: Uuid,
        owner_id: &str,
        force_reprocess: bool,
    ) -> ProcessResult {
        let note = match self.store.get_note(note_id).await {
            Ok(note) if note.owner_id == owner_id => note,
            // Another owner's note is reported as missing
            Ok(_) => {
                return ProcessResult::Failed {
                    note_id,
                    stage: ProcessingStage::Unclaimed,
                    error: NoteError::NotFound { note_id },
                }
            }
            Err(e) => {
                return ProcessResult::Failed {
                    note_id,
                    stage: ProcessingStage::Unclaimed,
                    error: e.into(),
                }
            }
        };

        if note.status() == NoteStatus::Completed && !force_reprocess {
            debug!("Note already processed");
            return ProcessResult::AlreadyProcessed {
                note_id,
                analysis: note.analysis,
            };
        }

        let decision = self.quota.check(owner_id).await;
        if !decision.allowed {
            info!(reason = ?decision.reason, "Processing denied by quota");
            return ProcessResult::QuotaDenied { note_id, decision };
        }

        let now = self.clock.now();
        let request = ClaimRequest {
            note_id,
            now,
            stale_before: now - to_chrono(self.settings.stuck_threshold),
            reopen: force_reprocess,
        };

        let claim = match self.store.claim_note(request).await {
            Ok(Some(claim)) => claim,
            Ok(None) => return self.claim_refused(note_id, force_reprocess).await,
            Err(e) => {
                return ProcessResult::Failed {
                    note_id,
                    stage: ProcessingStage::Claimed,
                    error: e.into(),
                }
            }
        };

        info!(attempt = note.processing_attempts + 1, force_reprocess, "Note claimed");

        match self.run_claimed(&note, &claim, force_reprocess).await {
            Ok(result) => result,
            Err(failure) => self.fail(&note, &claim, failure).await,
        }
    }

    /// The claim was refused: either another worker holds it, or the note
    /// completed between our read and the claim
    async fn claim_refused(&self, note_id: Uuid, force_reprocess: bool) -> ProcessResult {
        if !force_reprocess {
            if let Ok(current) = self.store.get_note(note_id).await {
                if current.status() == NoteStatus::Completed {
                    return ProcessResult::AlreadyProcessed {
                        note_id,
                        analysis: current.analysis,
                    };
                }
            }
        }

        debug!("Note is claimed by another worker");
        ProcessResult::Busy { note_id }
    }

    async fn run_claimed(
        &self,
        note: &Note,
        claim: &Claim,
        force_reprocess: bool,
    ) -> Result<ProcessResult, StageFailure> {
        // Transcribing
        let stage = ProcessingStage::Transcribing;
        let (transcription, transcription_reused, transcription_attempts) =
            match (&note.transcription, force_reprocess) {
                (Some(existing), false) => {
                    debug!("Resuming from checkpointed transcription");
                    (existing.clone(), true, 0)
                }
                _ => {
                    let started = Instant::now();
                    let audio = self
                        .fetch_audio(&note.audio_ref)
                        .await
                        .map_err(|e| StageFailure::from_stage(stage, e))?;
                    let retried = self
                        .transcription
                        .run(&audio)
                        .await
                        .map_err(|e| StageFailure::from_stage(stage, e))?;

                    // A forced run leaves the completed state only here
                    let mut update = NoteUpdate::new().transcription(retried.value.clone());
                    if force_reprocess {
                        update = update.clear_processed();
                    }
                    self.store
                        .update_note(claim, update)
                        .await
                        .map_err(|e| StageFailure::from_store(stage, e))?;

                    self.record(
                        NoteEvent::new(
                            note.id,
                            &note.owner_id,
                            NoteEventType::TranscriptionSaved,
                            format!("Transcribed {} chars", retried.value.len()),
                            self.clock.now(),
                        )
                        .with_duration(started.elapsed().as_millis() as u64),
                    )
                    .await;

                    (retried.value, false, retried.attempts)
                }
            };

        // Analyzing
        let stage = ProcessingStage::Analyzing;
        let started = Instant::now();
        let prior_context = self.prior_context(note).await;

        let outcome = self
            .analysis
            .run(&AnalysisInput {
                transcription,
                prior_context,
                recorded_at: note.recorded_at,
            })
            .await
            .map_err(|e| StageFailure::from_stage(stage, e))?;

        let completed_at = self.clock.now();
        self.store
            .update_note(
                claim,
                NoteUpdate::new()
                    .analysis(outcome.result.clone())
                    .processed_at(completed_at)
                    .clear_error()
                    .release_claim(),
            )
            .await
            .map_err(|e| StageFailure::from_store(stage, e).with_tokens(outcome.tokens_used))?;

        self.record(
            NoteEvent::new(
                note.id,
                &note.owner_id,
                NoteEventType::AnalysisCompleted,
                if outcome.result.is_partial() {
                    "Analysis completed (partial)"
                } else {
                    "Analysis completed"
                },
                completed_at,
            )
            .with_tokens(outcome.tokens_used)
            .with_duration(started.elapsed().as_millis() as u64),
        )
        .await;

        info!(
            partial = outcome.result.is_partial(),
            tokens = outcome.tokens_used,
            transcription_reused,
            "Note completed"
        );

        Ok(ProcessResult::Completed {
            note_id: note.id,
            warning: outcome.result.warning().map(str::to_string),
            analysis: outcome.result,
            transcription_reused,
            transcription_attempts,
            analysis_attempts: outcome.attempts,
            tokens_used: outcome.tokens_used,
        })
    }

    /// Record the failure on the note and release the claim. Tokens spent
    /// in the attempt are logged either way so they count toward the quota.
    async fn fail(&self, note: &Note, claim: &Claim, failure: StageFailure) -> ProcessResult {
        let StageFailure {
            stage,
            error,
            tokens_used,
        } = failure;
        let now = self.clock.now();

        if error == NoteError::Busy {
            warn!(%stage, "Claim lost to another worker");
            if let Some(tokens) = tokens_used {
                self.record(
                    NoteEvent::new(
                        note.id,
                        &note.owner_id,
                        NoteEventType::AttemptFailed,
                        format!("Claim lost while {}", stage),
                        now,
                    )
                    .with_tokens(tokens),
                )
                .await;
            }
            return ProcessResult::Busy { note_id: note.id };
        }

        let message = error.to_string();
        error!(%stage, error = %message, "Note processing failed");

        match self
            .store
            .update_note(claim, NoteUpdate::new().set_error(message.clone(), now).release_claim())
            .await
        {
            Ok(_) => {}
            Err(StoreError::ConcurrentModification(_)) => {
                warn!("Claim lost before the failure could be recorded");
            }
            Err(e) => error!(error = %e, "Failed to record processing failure"),
        }

        let mut event = NoteEvent::new(
            note.id,
            &note.owner_id,
            NoteEventType::AttemptFailed,
            format!("Failed while {}", stage),
            now,
        )
        .with_error(message);
        if let Some(tokens) = tokens_used {
            event = event.with_tokens(tokens);
        }
        self.record(event).await;

        ProcessResult::Failed {
            note_id: note.id,
            stage,
            error,
        }
    }

    async fn fetch_audio(&self, audio_ref: &AudioRef) -> Result<AudioPayload, StageError> {
        let blobs = &self.blobs;
        let retried = self
            .retry
            .execute(STORAGE_SERVICE, self.settings.storage_timeout, |_| {
                blobs.fetch_audio(audio_ref)
            })
            .await?;
        Ok(retried.value)
    }

    /// Earlier completed notes of the same owner; best effort
    async fn prior_context(&self, note: &Note) -> Vec<PriorNote> {
        if self.settings.prior_context_limit == 0 {
            return Vec::new();
        }

        match self
            .store
            .recent_completed(&note.owner_id, note.id, self.settings.prior_context_limit)
            .await
        {
            Ok(prior) => prior,
            Err(e) => {
                warn!(error = %e, "Prior context unavailable, analyzing without it");
                Vec::new()
            }
        }
    }

    async fn record(&self, event: NoteEvent) {
        if let Err(e) = self.store.record_event(&event).await {
            warn!(error = %e, event_type = event.event_type.as_str(), "Failed to record note event");
        }
    }
}
