//! OpenAI-compatible HTTP providers.
//!
//! `OpenAiTranscriber` uploads audio to `/audio/transcriptions` and
//! `OpenAiCompleter` calls `/chat/completions`. Any server speaking the
//! same wire format (self-hosted gateways, proxies) works through
//! `api_base`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use super::{
    AnalysisProvider, AudioPayload, Completion, CompletionOptions, ErrorKind, Prompt, ProviderError,
    TranscribeOptions, TranscriptionProvider,
};

/// Default API base URL
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Connection settings shared by both providers
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
}

impl OpenAiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }
}

/// Speech-to-text over `/audio/transcriptions`
pub struct OpenAiTranscriber {
    config: OpenAiConfig,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiTranscriber {
    pub fn new(config: OpenAiConfig, model: impl Into<String>) -> Self {
        Self {
            config,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for OpenAiTranscriber {
    fn name(&self) -> &str {
        "openai-transcription"
    }

    async fn transcribe(
        &self,
        audio: &AudioPayload,
        options: &TranscribeOptions,
    ) -> Result<String, ProviderError> {
        let file_name = format!("audio.{}", extension_for_mime(&audio.mime_type));
        let file_part = Part::bytes(audio.bytes.clone())
            .file_name(file_name)
            .mime_str(&audio.mime_type)
            .map_err(|e| ProviderError::validation(format!("Invalid MIME type: {}", e)))?;

        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file_part);

        if let Some(ref language) = options.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(self.config.url("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body, retry_after));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| {
                ProviderError::new(ErrorKind::Server, format!("Malformed transcription response: {}", e))
            })?;

        Ok(parsed.text)
    }
}

/// Chat completion over `/chat/completions`
pub struct OpenAiCompleter {
    config: OpenAiConfig,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

impl OpenAiCompleter {
    pub fn new(config: OpenAiConfig, model: impl Into<String>) -> Self {
        Self {
            config,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiCompleter {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<Completion, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: options.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(self.config.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body, retry_after));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| {
                ProviderError::new(ErrorKind::Server, format!("Malformed completion response: {}", e))
            })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Completion {
            text,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

/// Map a transport-level reqwest failure
fn transport_error(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(error.to_string())
    } else {
        ProviderError::network(error.to_string())
    }
}

/// Parse a `Retry-After` header given in seconds
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "audio/webm" => "webm",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_config_trims_trailing_slash() {
        let config = OpenAiConfig::new("http://localhost:8080/v1/", "key");
        assert_eq!(
            config.url("chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("audio/webm"), "webm");
        assert_eq!(extension_for_mime("audio/x-m4a"), "m4a");
        assert_eq!(extension_for_mime("video/unknown"), "bin");
    }

    #[test]
    fn test_chat_request_json_mode() {
        let request = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![],
            max_tokens: 10,
            temperature: 0.0,
            response_format: true.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}
