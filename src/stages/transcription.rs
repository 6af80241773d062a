//! Speech-to-text stage.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use super::{StageError, TRANSCRIPTION_SERVICE};
use crate::adapters::{AudioPayload, TranscribeOptions, TranscriptionProvider};
use crate::core::retry::{Retried, RetryExecutor};

/// Audio MIME types the provider accepts
const SUPPORTED_MIME_TYPES: &[&str] = &[
    "audio/webm",
    "audio/mp4",
    "audio/m4a",
    "audio/x-m4a",
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/ogg",
    "audio/flac",
];

/// Whether a declared MIME type (parameters ignored) is supported
pub fn is_supported_mime(mime_type: &str) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    SUPPORTED_MIME_TYPES.contains(&essence.as_str())
}

pub struct TranscriptionStage {
    provider: Arc<dyn TranscriptionProvider>,
    retry: Arc<RetryExecutor>,
    timeout: Duration,
    options: TranscribeOptions,
}

impl TranscriptionStage {
    pub fn new(
        provider: Arc<dyn TranscriptionProvider>,
        retry: Arc<RetryExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            retry,
            timeout,
            options: TranscribeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TranscribeOptions) -> Self {
        self.options = options;
        self
    }

    /// Transcribe audio into trimmed, non-empty text
    #[instrument(skip(self, audio), fields(bytes = audio.bytes.len(), mime = %audio.mime_type))]
    pub async fn run(&self, audio: &AudioPayload) -> Result<Retried<String>, StageError> {
        if audio.bytes.is_empty() {
            return Err(StageError::InvalidInput("Audio payload is empty".to_string()));
        }
        if !is_supported_mime(&audio.mime_type) {
            return Err(StageError::InvalidInput(format!(
                "Unsupported audio type: {}",
                audio.mime_type
            )));
        }

        let provider = &self.provider;
        let options = &self.options;
        let retried = self
            .retry
            .execute(TRANSCRIPTION_SERVICE, self.timeout, |_| {
                provider.transcribe(audio, options)
            })
            .await?;

        let text = retried.value.trim();
        if text.is_empty() {
            return Err(StageError::EmptyTranscription);
        }

        debug!(
            provider = provider.name(),
            chars = text.len(),
            attempts = retried.attempts,
            "Transcription complete"
        );

        Ok(Retried {
            value: text.to_string(),
            attempts: retried.attempts,
        })
    }
}
