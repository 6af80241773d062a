//! Caller-facing error taxonomy.
//!
//! These values cross the trigger surface (CLI output, a thin HTTP layer),
//! so they serialize with a `kind` tag and carry only sanitized messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::note::ProcessingStage;

/// Longest provider message surfaced to callers
const MAX_SURFACED_MESSAGE_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Note not found: {note_id}")]
    NotFound { note_id: Uuid },

    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("Note is already being processed")]
    Busy,

    /// Stage-level failure after retries. `transient` separates a provider
    /// hiccup from a data problem such as unusable audio.
    #[error("Processing failed while {stage}: {message}")]
    Processing {
        stage: ProcessingStage,
        message: String,
        transient: bool,
    },

    #[error("External service '{service}' unavailable: {message}")]
    ExternalService { service: String, message: String },

    #[error("Rate limit exceeded for '{service}'")]
    RateLimitExceeded {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl NoteError {
    pub fn internal(message: impl AsRef<str>) -> Self {
        Self::Internal {
            message: sanitize_message(message.as_ref()),
        }
    }

    pub fn storage(message: impl AsRef<str>) -> Self {
        Self::Storage {
            message: sanitize_message(message.as_ref()),
        }
    }

    /// HTTP-equivalent status for the trigger surface
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthRequired => 401,
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::QuotaExceeded { .. } => 429,
            Self::Busy => 409,
            Self::Processing {
                transient: false, ..
            } => 422,
            Self::Processing { .. } => 500,
            Self::ExternalService { .. } => 502,
            Self::RateLimitExceeded { .. } => 429,
            Self::Storage { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether trying again later could succeed without user action
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Processing { transient, .. } => *transient,
            Self::ExternalService { .. }
            | Self::RateLimitExceeded { .. }
            | Self::Storage { .. }
            | Self::Busy
            | Self::QuotaExceeded { .. } => true,
            Self::AuthRequired
            | Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Keep the first line of a message and cap its length
pub fn sanitize_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_SURFACED_MESSAGE_CHARS {
        return first_line.to_string();
    }

    let mut out: String = first_line.chars().take(MAX_SURFACED_MESSAGE_CHARS).collect();
    out.push_str("...");
    out
}
