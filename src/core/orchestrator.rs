//! Main orchestrator for note processing.
//!
//! Owns the process-wide pieces (circuit breaker registry, retry executor,
//! quota guard) and wires them into the processor, batch scheduler and
//! stuck-job recovery. Both trigger surfaces go through here: a single-note
//! call and the recurring batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::circuit::{CircuitBreaker, CircuitConfig, CircuitPhase, CircuitSnapshot};
use super::clock::{Clock, Jitter, RandomJitter, SystemClock};
use super::processor::{NoteProcessor, ProcessResult, ProcessorSettings};
use super::quota::{QuotaDecision, QuotaGuard, QuotaLimits};
use super::recovery::{RecoveryReport, RecoverySettings, StuckJobRecovery};
use super::retry::{RetryExecutor, RetryPolicy};
use super::scheduler::{BatchResult, BatchScheduler, BatchSettings};
use crate::adapters::{
    AnalysisProvider, BlobStore, CompletionOptions, TranscribeOptions, TranscriptionProvider,
};
use crate::stages::{AnalysisStage, SalvagePolicy, TranscriptionStage};
use crate::store::{NoteStore, StoreError};

/// Per-attempt timeouts for external calls
#[derive(Debug, Clone)]
pub struct CallTimeouts {
    pub transcription: Duration,
    pub analysis: Duration,
    pub storage: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            transcription: Duration::from_secs(60),
            analysis: Duration::from_secs(30),
            storage: Duration::from_secs(30),
        }
    }
}

/// Everything tunable about the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub quota: QuotaLimits,
    pub circuit: CircuitConfig,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
    pub recovery: RecoverySettings,
    pub salvage: SalvagePolicy,
    pub timeouts: CallTimeouts,

    /// Completed notes passed to the analysis as prior context
    pub prior_context_limit: usize,

    /// Language hint for transcription
    pub language: Option<String>,

    pub completion: CompletionOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            quota: QuotaLimits::default(),
            circuit: CircuitConfig::default(),
            retry: RetryPolicy::default(),
            batch: BatchSettings::default(),
            recovery: RecoverySettings::default(),
            salvage: SalvagePolicy::default(),
            timeouts: CallTimeouts::default(),
            prior_context_limit: 5,
            language: None,
            completion: CompletionOptions::default(),
        }
    }
}

/// Totals across the passes of [`Orchestrator::run_forever`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub passes: u64,
    pub processed: usize,
    pub failed: usize,
    pub reset: usize,
    /// Passes abandoned because the store could not be read
    pub failed_passes: u64,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<dyn NoteStore>,
    blobs: Arc<dyn BlobStore>,
    transcriber: Arc<dyn TranscriptionProvider>,
    analyzer: Arc<dyn AnalysisProvider>,
    settings: OrchestratorSettings,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn build(self) -> Orchestrator {
        let settings = self.settings;
        let clock = self.clock;

        let breaker = Arc::new(CircuitBreaker::new(settings.circuit.clone(), Arc::clone(&clock)));
        let retry = Arc::new(RetryExecutor::new(
            settings.retry.clone(),
            Arc::clone(&breaker),
            Arc::clone(&clock),
            self.jitter,
        ));

        let quota = QuotaGuard::new(
            settings.quota.clone(),
            Arc::clone(&self.store),
            Arc::clone(&clock),
        );

        let transcription = TranscriptionStage::new(
            self.transcriber,
            Arc::clone(&retry),
            settings.timeouts.transcription,
        )
        .with_options(TranscribeOptions {
            language: settings.language.clone(),
        });

        let analysis = AnalysisStage::new(
            self.analyzer,
            Arc::clone(&retry),
            settings.timeouts.analysis,
        )
        .with_salvage_policy(settings.salvage.clone())
        .with_options(settings.completion.clone());

        let stuck_threshold = settings.recovery.threshold();
        let processor = Arc::new(NoteProcessor::new(
            Arc::clone(&self.store),
            self.blobs,
            quota,
            retry,
            transcription,
            analysis,
            Arc::clone(&clock),
            ProcessorSettings {
                stuck_threshold,
                prior_context_limit: settings.prior_context_limit,
                storage_timeout: settings.timeouts.storage,
            },
        ));

        let scheduler = BatchScheduler::new(
            Arc::clone(&processor),
            Arc::clone(&self.store),
            Arc::clone(&clock),
            settings.batch.clone(),
            stuck_threshold,
        );

        let recovery = StuckJobRecovery::new(Arc::clone(&self.store), Arc::clone(&clock));

        Orchestrator {
            store: self.store,
            processor,
            scheduler,
            recovery,
            breaker,
            clock,
            settings,
        }
    }
}

/// Main note processing orchestrator
pub struct Orchestrator {
    store: Arc<dyn NoteStore>,
    processor: Arc<NoteProcessor>,
    scheduler: BatchScheduler,
    recovery: StuckJobRecovery,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Start building an orchestrator over the given collaborators
    pub fn builder(
        store: Arc<dyn NoteStore>,
        blobs: Arc<dyn BlobStore>,
        transcriber: Arc<dyn TranscriptionProvider>,
        analyzer: Arc<dyn AnalysisProvider>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            blobs,
            transcriber,
            analyzer,
            settings: OrchestratorSettings::default(),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn NoteStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Process a single note
    pub async fn process_note(
        &self,
        note_id: Uuid,
        owner_id: &str,
        force_reprocess: bool,
    ) -> ProcessResult {
        self.processor.process(note_id, owner_id, force_reprocess).await
    }

    /// Process up to `batch_size` eligible notes
    pub async fn process_next_batch(&self, batch_size: usize) -> Result<BatchResult, StoreError> {
        self.scheduler.process_next_batch(batch_size).await
    }

    /// Sweep stuck claims with the configured threshold
    pub async fn reset_stuck(&self) -> Result<RecoveryReport, StoreError> {
        self.reset_stuck_with(
            self.settings.recovery.threshold(),
            self.settings.recovery.batch_size,
        )
        .await
    }

    pub async fn reset_stuck_with(
        &self,
        threshold: Duration,
        batch_size: usize,
    ) -> Result<RecoveryReport, StoreError> {
        self.recovery.reset_stuck(threshold, batch_size).await
    }

    /// Current quota decision for an owner
    pub async fn quota(&self, owner_id: &str) -> QuotaDecision {
        self.processor.quota().check(owner_id).await
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.breaker.snapshot()
    }

    /// One recurring pass: stuck sweep, then a batch
    pub async fn run_pass(
        &self,
        batch_size: usize,
    ) -> Result<(RecoveryReport, BatchResult), StoreError> {
        let report = self.reset_stuck().await?;
        let batch = self.process_next_batch(batch_size).await?;
        Ok((report, batch))
    }

    /// Run passes every `interval` until `shutdown` resolves.
    ///
    /// A pass in progress is finished before returning.
    #[instrument(skip(self, shutdown))]
    pub async fn run_forever<F>(
        &self,
        interval: Duration,
        batch_size: usize,
        shutdown: F,
    ) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();

        info!("Recurring runner started");

        loop {
            summary.passes += 1;
            match self.run_pass(batch_size).await {
                Ok((report, batch)) => {
                    summary.processed += batch.processed_count;
                    summary.failed += batch.failed_count;
                    summary.reset += report.reset;
                }
                Err(e) => {
                    error!(error = %e, "Pass abandoned, store unavailable");
                    summary.failed_passes += 1;
                }
            }

            self.log_circuits();

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.clock.sleep(interval) => {}
            }
        }

        info!(
            passes = summary.passes,
            processed = summary.processed,
            failed = summary.failed,
            failed_passes = summary.failed_passes,
            "Recurring runner stopped"
        );
        summary
    }

    fn log_circuits(&self) {
        for snapshot in self.breaker.snapshot() {
            match snapshot.phase {
                CircuitPhase::Closed => info!(
                    service = %snapshot.service,
                    failures = snapshot.failure_count,
                    "Circuit closed"
                ),
                CircuitPhase::Open | CircuitPhase::HalfOpen => warn!(
                    service = %snapshot.service,
                    phase = ?snapshot.phase,
                    failures = snapshot.failure_count,
                    histogram = ?snapshot.error_histogram,
                    "Circuit not closed"
                ),
            }
        }
    }
}
