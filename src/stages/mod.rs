//! Processing stages: stateless wrappers that call a provider through the
//! retry executor and normalize what comes back.

pub mod analysis;
pub mod transcription;

use thiserror::Error;

use crate::adapters::ErrorKind;
use crate::core::retry::RetryError;
use crate::domain::{sanitize_message, NoteError, ProcessingStage};

pub use analysis::{AnalysisInput, AnalysisOutcome, AnalysisStage, SalvagePolicy};
pub use transcription::TranscriptionStage;

/// Circuit breaker key for the speech-to-text provider
pub const TRANSCRIPTION_SERVICE: &str = "transcription";

/// Circuit breaker key for the LLM provider
pub const ANALYSIS_SERVICE: &str = "analysis";

/// Circuit breaker key for the blob store
pub const STORAGE_SERVICE: &str = "storage";

/// Errors a stage can end with
#[derive(Debug, Error)]
pub enum StageError {
    /// Rejected before any provider call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transcription was empty")]
    EmptyTranscription,

    /// Model output was empty, unparseable or not salvageable
    #[error("Invalid analysis: {message}")]
    InvalidAnalysis {
        message: String,
        /// Tokens the rejected completion consumed
        tokens_used: u64,
    },

    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl StageError {
    pub fn invalid_analysis(message: impl Into<String>) -> Self {
        Self::InvalidAnalysis {
            message: message.into(),
            tokens_used: 0,
        }
    }

    /// Attach the token cost of the completion that produced this error
    pub fn with_tokens(self, tokens: u64) -> Self {
        match self {
            Self::InvalidAnalysis { message, .. } => Self::InvalidAnalysis {
                message,
                tokens_used: tokens,
            },
            other => other,
        }
    }

    /// Provider tokens spent before the stage failed, if any
    pub fn tokens_used(&self) -> Option<u64> {
        match self {
            Self::InvalidAnalysis { tokens_used, .. } if *tokens_used > 0 => Some(*tokens_used),
            _ => None,
        }
    }

    /// Attempts spent on the provider before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retry(e) => e.attempts(),
            _ => 0,
        }
    }

    /// Classify into the caller-facing taxonomy
    pub fn to_note_error(&self, stage: ProcessingStage) -> NoteError {
        match self {
            Self::InvalidInput(message) => NoteError::Validation {
                message: sanitize_message(message),
            },
            Self::EmptyTranscription | Self::InvalidAnalysis { .. } => NoteError::Processing {
                stage,
                message: sanitize_message(&self.to_string()),
                transient: matches!(self, Self::InvalidAnalysis { .. }),
            },
            Self::Retry(RetryError::CircuitOpen { service, .. }) => NoteError::ExternalService {
                service: service.clone(),
                message: "Circuit open, service temporarily disabled".to_string(),
            },
            Self::Retry(RetryError::Failed {
                service,
                source,
                attempts,
            }) => match source.kind {
                ErrorKind::Auth | ErrorKind::Upstream => NoteError::ExternalService {
                    service: service.clone(),
                    message: sanitize_message(&source.message),
                },
                ErrorKind::RateLimit => NoteError::RateLimitExceeded {
                    service: service.clone(),
                    retry_after_secs: source.retry_after.map(|d| d.as_secs().max(1)),
                },
                ErrorKind::Storage => NoteError::storage(&source.message),
                ErrorKind::Validation | ErrorKind::InvalidFile => NoteError::Processing {
                    stage,
                    message: attempt_message(&source.message, *attempts),
                    transient: false,
                },
                ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Server | ErrorKind::Unknown => {
                    NoteError::Processing {
                        stage,
                        message: attempt_message(&source.message, *attempts),
                        transient: true,
                    }
                }
            },
        }
    }
}

fn attempt_message(message: &str, attempts: u32) -> String {
    format!("{} (after {} attempt(s))", sanitize_message(message), attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProviderError;
    use std::time::Duration;

    fn failed(source: ProviderError) -> StageError {
        StageError::Retry(RetryError::Failed {
            service: ANALYSIS_SERVICE.to_string(),
            attempts: 3,
            source,
        })
    }

    #[test]
    fn test_data_problem_is_not_transient() {
        let err = failed(ProviderError::invalid_file("corrupt audio"));
        match err.to_note_error(ProcessingStage::Transcribing) {
            NoteError::Processing {
                transient, message, ..
            } => {
                assert!(!transient);
                assert!(message.ends_with("(after 3 attempt(s))"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(err.attempts(), 3);
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = failed(ProviderError::timeout("slow"));
        assert_eq!(
            err.to_note_error(ProcessingStage::Analyzing).status_code(),
            500
        );
    }

    #[test]
    fn test_rate_limit_carries_hint() {
        let err = failed(ProviderError::rate_limited(
            "slow down",
            Some(Duration::from_secs(30)),
        ));
        assert_eq!(
            err.to_note_error(ProcessingStage::Analyzing),
            NoteError::RateLimitExceeded {
                service: "analysis".into(),
                retry_after_secs: Some(30)
            }
        );
    }

    #[test]
    fn test_circuit_open_is_external() {
        let err = StageError::Retry(RetryError::CircuitOpen {
            service: TRANSCRIPTION_SERVICE.into(),
            attempts: 0,
            retry_after: None,
        });
        assert!(matches!(
            err.to_note_error(ProcessingStage::Transcribing),
            NoteError::ExternalService { .. }
        ));
    }

    #[test]
    fn test_invalid_analysis_keeps_token_cost() {
        let err = StageError::invalid_analysis("unparseable JSON").with_tokens(640);
        assert_eq!(err.tokens_used(), Some(640));
        assert_eq!(err.to_string(), "Invalid analysis: unparseable JSON");

        assert_eq!(StageError::invalid_analysis("empty").tokens_used(), None);
        assert_eq!(StageError::EmptyTranscription.with_tokens(5).tokens_used(), None);
    }

    #[test]
    fn test_empty_transcription_is_data_problem() {
        match StageError::EmptyTranscription.to_note_error(ProcessingStage::Transcribing) {
            NoteError::Processing {
                stage, transient, ..
            } => {
                assert_eq!(stage, ProcessingStage::Transcribing);
                assert!(!transient);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
