//! Core orchestration logic.
//!
//! This module contains:
//! - Circuit: Per-service circuit breakers
//! - Retry: Backoff and retry around provider calls
//! - Quota: Per-owner usage limits
//! - Processor: The single-note workflow
//! - Scheduler: Batch selection and bounded dispatch
//! - Recovery: Stuck-claim sweeps
//! - Orchestrator: Wires everything together

pub mod circuit;
pub mod clock;
pub mod orchestrator;
pub mod processor;
pub mod quota;
pub mod recovery;
pub mod retry;
pub mod scheduler;

// Re-export commonly used types
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitPhase, CircuitSnapshot};
pub use clock::{Clock, Jitter, ManualClock, NoJitter, RandomJitter, SystemClock};
pub use orchestrator::{
    CallTimeouts, Orchestrator, OrchestratorBuilder, OrchestratorSettings, RunSummary,
};
pub use processor::{NoteProcessor, ProcessResult, ProcessorSettings};
pub use quota::{QuotaDecision, QuotaDenial, QuotaDimension, QuotaGuard, QuotaLimits, QuotaUsage};
pub use recovery::{RecoveryReport, RecoverySettings, StuckJobRecovery};
pub use retry::{Retried, RetryError, RetryExecutor, RetryPolicy};
pub use scheduler::{BatchError, BatchResult, BatchScheduler, BatchSettings};
