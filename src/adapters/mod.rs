//! Adapter interfaces for external systems.
//!
//! The orchestrator consumes three black boxes: a blob store holding the
//! raw audio, a speech-to-text provider and an LLM completion provider.
//! Every failure they report is a [`ProviderError`] whose [`ErrorKind`]
//! decides whether the retry layer tries again.

pub mod blob;
pub mod openai;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::AudioRef;

pub use blob::FsBlobStore;
pub use openai::{OpenAiCompleter, OpenAiTranscriber};

/// Classification of an external failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Auth,
    Validation,
    InvalidFile,
    Network,
    Server,
    /// Provider-side systemic fault (exhausted billing quota, account disabled)
    Upstream,
    Storage,
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout
            | Self::RateLimit
            | Self::Network
            | Self::Server
            | Self::Storage
            | Self::Unknown => true,
            Self::Auth | Self::Validation | Self::InvalidFile | Self::Upstream => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::InvalidFile => "invalid_file",
            Self::Network => "network",
            Self::Server => "server",
            Self::Upstream => "upstream",
            Self::Storage => "storage",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure reported by an external collaborator
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from an HTTP response
    pub status: Option<u16>,
    /// Server-suggested wait before retrying
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFile, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimit, message)
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let lowered = body.to_ascii_lowercase();
        let systemic = lowered.contains("insufficient_quota")
            || lowered.contains("billing")
            || lowered.contains("account_deactivated");

        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            400 | 422 => ErrorKind::Validation,
            413 | 415 => ErrorKind::InvalidFile,
            408 | 504 => ErrorKind::Timeout,
            429 | 503 if systemic => ErrorKind::Upstream,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };

        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body.trim())
        };

        Self {
            kind,
            message,
            status: Some(status),
            retry_after: if kind == ErrorKind::RateLimit {
                retry_after
            } else {
                None
            },
        }
    }
}

/// Raw audio plus its declared MIME type
#[derive(Debug, Clone)]
pub struct AudioPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioPayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }
}

/// Blob storage holding note audio
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Resolve an audio reference into bytes and declared MIME type
    async fn fetch_audio(&self, audio_ref: &AudioRef) -> Result<AudioPayload, ProviderError>;
}

/// Options forwarded to the speech-to-text provider
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// ISO-639-1 language hint
    pub language: Option<String>,
}

/// Speech-to-text provider
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &AudioPayload,
        options: &TranscribeOptions,
    ) -> Result<String, ProviderError>;
}

/// Prompt sent to the completion provider
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Options forwarded to the completion provider
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response
    pub json_mode: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.2,
            json_mode: true,
        }
    }
}

/// Output from a completion call
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw model output
    pub text: String,

    /// Tokens used (if reported)
    pub tokens_used: Option<u64>,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_used: None,
        }
    }
}

/// LLM completion provider
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(401, "", None).kind, ErrorKind::Auth);
        assert_eq!(ProviderError::from_status(422, "bad", None).kind, ErrorKind::Validation);
        assert_eq!(ProviderError::from_status(415, "", None).kind, ErrorKind::InvalidFile);
        assert_eq!(ProviderError::from_status(504, "", None).kind, ErrorKind::Timeout);
        assert_eq!(ProviderError::from_status(502, "", None).kind, ErrorKind::Server);
        assert_eq!(ProviderError::from_status(418, "", None).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let err = ProviderError::from_status(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_systemic_quota_is_not_retryable() {
        let body = r#"{"error":{"code":"insufficient_quota"}}"#;
        let err = ProviderError::from_status(429, body, Some(Duration::from_secs(7)));
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.retry_after.is_none());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Storage.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::InvalidFile.is_retryable());
    }
}
