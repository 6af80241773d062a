//! LLM analysis stage.
//!
//! The model is asked for a single JSON object. Its response is cleaned of
//! markdown fences, parsed, validated against [`Analysis`], and when that
//! fails, salvaged field by field into a [`PartialAnalysis`] as long as the
//! [`SalvagePolicy`] is met.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::{StageError, ANALYSIS_SERVICE};
use crate::adapters::{AnalysisProvider, CompletionOptions, Prompt};
use crate::core::retry::RetryExecutor;
use crate::domain::{
    Analysis, AnalysisField, AnalysisResult, CrossReference, DraftMessage, PartialAnalysis,
    Sentiment, Task, Topics,
};
use crate::store::PriorNote;

const SYSTEM_PROMPT: &str = r#"You analyze transcribed voice notes. Reply with ONE JSON object and nothing else:
{
  "title": "short title",
  "summary": "2-3 sentence summary",
  "sentiment": {"mood": "positive|neutral|negative|mixed", "score": -1.0..1.0},
  "topics": {"primary": "topic", "secondary": ["topic"], "domain": "work|personal|health|finance|learning|creative|other"},
  "tasks": [{"description": "...", "urgency": "low|medium|high", "due": "optional date"}],
  "key_ideas": ["..."],
  "draft_messages": [{"recipient": "...", "channel": "email|chat|sms", "subject": "optional", "body": "..."}],
  "cross_references": [{"note_id": "id of an earlier note or null", "topic": "...", "relation": "continues|updates|contradicts|related"}]
}
Use only the listed values for mood, domain, urgency, channel and relation. Use empty arrays when nothing applies."#;

/// Minimum content a salvaged analysis must carry to be accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalvagePolicy {
    /// Fields that must be recovered (default: summary)
    #[serde(default = "default_required")]
    pub required: Vec<AnalysisField>,

    /// Minimum number of recovered fields (default: 1)
    #[serde(default = "default_min_fields")]
    pub min_fields: usize,
}

fn default_required() -> Vec<AnalysisField> {
    vec![AnalysisField::Summary]
}
fn default_min_fields() -> usize {
    1
}

impl Default for SalvagePolicy {
    fn default() -> Self {
        Self {
            required: default_required(),
            min_fields: default_min_fields(),
        }
    }
}

impl SalvagePolicy {
    pub fn accepts(&self, partial: &PartialAnalysis) -> bool {
        self.required.iter().all(|f| partial.has(*f))
            && partial.present_count() >= self.min_fields
    }
}

/// What the analysis stage needs to know about a note
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub transcription: String,
    pub prior_context: Vec<PriorNote>,
    pub recorded_at: DateTime<Utc>,
}

/// Parsed analysis plus accounting
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,

    /// Reported by the provider, or estimated from text length
    pub tokens_used: u64,

    pub attempts: u32,
}

pub struct AnalysisStage {
    provider: Arc<dyn AnalysisProvider>,
    retry: Arc<RetryExecutor>,
    timeout: Duration,
    options: CompletionOptions,
    salvage: SalvagePolicy,
}

impl AnalysisStage {
    pub fn new(
        provider: Arc<dyn AnalysisProvider>,
        retry: Arc<RetryExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            retry,
            timeout,
            options: CompletionOptions::default(),
            salvage: SalvagePolicy::default(),
        }
    }

    pub fn with_salvage_policy(mut self, policy: SalvagePolicy) -> Self {
        self.salvage = policy;
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    #[instrument(skip(self, input), fields(chars = input.transcription.len(), prior = input.prior_context.len()))]
    pub async fn run(&self, input: &AnalysisInput) -> Result<AnalysisOutcome, StageError> {
        let prompt = build_prompt(input);
        let provider = &self.provider;
        let options = &self.options;

        let retried = self
            .retry
            .execute(ANALYSIS_SERVICE, self.timeout, |_| {
                provider.complete(&prompt, options)
            })
            .await?;

        let completion = retried.value;
        let tokens_used = completion
            .tokens_used
            .unwrap_or_else(|| estimate_tokens(&prompt, &completion.text));

        // The call was billed even when its output is unusable
        let result = parse_analysis(&completion.text, &self.salvage)
            .map_err(|e| e.with_tokens(tokens_used))?;
        if let AnalysisResult::Partial(ref partial) = result {
            warn!(warning = %partial.warning, "Analysis salvaged partially");
        }

        debug!(
            provider = provider.name(),
            tokens_used,
            attempts = retried.attempts,
            partial = result.is_partial(),
            "Analysis complete"
        );

        Ok(AnalysisOutcome {
            result,
            tokens_used,
            attempts: retried.attempts,
        })
    }
}

/// Build the prompt for one note
pub fn build_prompt(input: &AnalysisInput) -> Prompt {
    let mut user = format!("Recorded at: {}\n", input.recorded_at.to_rfc3339());

    if !input.prior_context.is_empty() {
        user.push_str("\nEarlier notes (reference them by note_id when related):\n");
        for prior in &input.prior_context {
            user.push_str(&format!(
                "- note_id {}: {} | {}\n",
                prior.note_id,
                prior.title.as_deref().unwrap_or("(untitled)"),
                prior.summary.as_deref().unwrap_or("")
            ));
        }
    }

    user.push_str("\nTranscription:\n");
    user.push_str(&input.transcription);

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Rough token count (chars / 4) for providers that do not report usage
pub fn estimate_tokens(prompt: &Prompt, output: &str) -> u64 {
    let chars = prompt.system.chars().count() + prompt.user.chars().count() + output.chars().count();
    (chars / 4) as u64
}

/// Remove a surrounding markdown code fence, if any
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the language tag line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse raw model output into a full or partial analysis
pub fn parse_analysis(raw: &str, policy: &SalvagePolicy) -> Result<AnalysisResult, StageError> {
    let cleaned = strip_code_fences(raw);
    if cleaned.is_empty() {
        return Err(StageError::invalid_analysis("empty response".to_string()));
    }

    let value = parse_json(cleaned)?;
    let Value::Object(object) = value else {
        return Err(StageError::invalid_analysis(
            "response is not a JSON object".to_string(),
        ));
    };

    let issues = match serde_json::from_value::<Analysis>(Value::Object(object.clone())) {
        Ok(analysis) => {
            let issues = analysis.validate();
            if issues.is_empty() {
                return Ok(AnalysisResult::Full(analysis));
            }
            issues
        }
        Err(e) => vec![e.to_string()],
    };

    let partial = salvage(&object, &issues);
    if partial.present_count() == 0 {
        return Err(StageError::invalid_analysis(
            "no recognizable fields".to_string(),
        ));
    }
    if !policy.accepts(&partial) {
        return Err(StageError::invalid_analysis(format!(
            "salvage incomplete: {}",
            partial.warning
        )));
    }

    Ok(AnalysisResult::Partial(partial))
}

fn parse_json(text: &str) -> Result<Value, StageError> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(first) => {
            // Prose around the object: fall back to the outermost braces
            let start = text.find('{');
            let end = text.rfind('}');
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            Err(StageError::invalid_analysis(format!("unparseable JSON: {}", first)))
        }
    }
}

/// Recover every field that validates on its own
fn salvage(object: &Map<String, Value>, issues: &[String]) -> PartialAnalysis {
    let mut notes: Vec<String> = Vec::new();

    let title = salvage_text(object, AnalysisField::Title, &mut notes);
    let summary = salvage_text(object, AnalysisField::Summary, &mut notes);

    let sentiment = salvage_field::<Sentiment>(object, AnalysisField::Sentiment, &mut notes).map(
        |mut sentiment| {
            if let Some(score) = sentiment.score {
                if !(-1.0..=1.0).contains(&score) {
                    notes.push(format!("sentiment.score {} dropped", score));
                    sentiment.score = None;
                }
            }
            sentiment
        },
    );

    let topics = salvage_field::<Topics>(object, AnalysisField::Topics, &mut notes)
        .filter(|topics| {
            let ok = !topics.primary.trim().is_empty();
            if !ok {
                notes.push("topics dropped: empty primary topic".to_string());
            }
            ok
        });

    let tasks = salvage_list::<Task>(object, AnalysisField::Tasks, &mut notes);
    let key_ideas = salvage_list::<String>(object, AnalysisField::KeyIdeas, &mut notes)
        .into_iter()
        .filter(|idea| !idea.trim().is_empty())
        .collect();
    let draft_messages =
        salvage_list::<DraftMessage>(object, AnalysisField::DraftMessages, &mut notes);
    let cross_references =
        salvage_list::<CrossReference>(object, AnalysisField::CrossReferences, &mut notes);

    if notes.is_empty() {
        notes.extend(issues.iter().cloned());
    }

    PartialAnalysis {
        title,
        summary,
        sentiment,
        topics,
        tasks,
        key_ideas,
        draft_messages,
        cross_references,
        warning: format!("Partial analysis: {}", notes.join("; ")),
    }
}

fn salvage_text(
    object: &Map<String, Value>,
    field: AnalysisField,
    notes: &mut Vec<String>,
) -> Option<String> {
    match object.get(field.key()) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        None | Some(Value::Null) => {
            notes.push(format!("{} missing", field.key()));
            None
        }
        Some(_) => {
            notes.push(format!("{} invalid", field.key()));
            None
        }
    }
}

fn salvage_field<T: DeserializeOwned>(
    object: &Map<String, Value>,
    field: AnalysisField,
    notes: &mut Vec<String>,
) -> Option<T> {
    match object.get(field.key()) {
        None | Some(Value::Null) => {
            notes.push(format!("{} missing", field.key()));
            None
        }
        Some(value) => match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                notes.push(format!("{} invalid ({})", field.key(), e));
                None
            }
        },
    }
}

/// Keep the valid elements of a list, noting how many were dropped
fn salvage_list<T: DeserializeOwned>(
    object: &Map<String, Value>,
    field: AnalysisField,
    notes: &mut Vec<String>,
) -> Vec<T> {
    let items = match object.get(field.key()) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            notes.push(format!("{} is not a list", field.key()));
            return Vec::new();
        }
    };

    let mut kept = Vec::with_capacity(items.len());
    let mut dropped = 0usize;
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(parsed) => kept.push(parsed),
            Err(_) => dropped += 1,
        }
    }

    if dropped > 0 {
        let noun = if dropped == 1 { "entry" } else { "entries" };
        notes.push(format!("{} invalid {} {} dropped", dropped, field.key(), noun));
    }
    kept
}
