//! Structured analysis produced by the LLM stage.
//!
//! Enumerated fields are closed sets: deserializing an unknown value fails
//! for that field, which feeds the salvage decision instead of passing
//! through silently.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall emotional tone of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

/// How soon an extracted task needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Life area the note belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Work,
    Personal,
    Health,
    Finance,
    Learning,
    Creative,
    Other,
}

/// Delivery channel for a drafted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Chat,
    Sms,
}

/// How a note relates to earlier knowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Continues,
    Updates,
    Contradicts,
    Related,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub mood: Mood,
    /// Polarity in [-1.0, 1.0]
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topics {
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
    pub domain: Domain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub urgency: Urgency,
    #[serde(default)]
    pub due: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMessage {
    pub recipient: String,
    pub channel: Channel,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReference {
    /// Earlier note this one refers to, when the model could name it
    #[serde(default)]
    pub note_id: Option<Uuid>,
    pub topic: String,
    pub relation: Relation,
}

/// A fully valid analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub title: String,
    pub summary: String,
    pub sentiment: Sentiment,
    pub topics: Topics,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub key_ideas: Vec<String>,
    #[serde(default)]
    pub draft_messages: Vec<DraftMessage>,
    #[serde(default)]
    pub cross_references: Vec<CrossReference>,
}

impl Analysis {
    /// Semantic checks serde cannot express. Returns one message per issue.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.title.trim().is_empty() {
            issues.push("title is empty".to_string());
        }
        if self.summary.trim().is_empty() {
            issues.push("summary is empty".to_string());
        }
        if let Some(score) = self.sentiment.score {
            if !(-1.0..=1.0).contains(&score) {
                issues.push(format!("sentiment.score {} outside [-1, 1]", score));
            }
        }
        if self.topics.primary.trim().is_empty() {
            issues.push("topics.primary is empty".to_string());
        }

        issues
    }
}

/// Whatever could be recovered from an analysis that failed validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialAnalysis {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub topics: Option<Topics>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub key_ideas: Vec<String>,
    #[serde(default)]
    pub draft_messages: Vec<DraftMessage>,
    #[serde(default)]
    pub cross_references: Vec<CrossReference>,

    /// What was dropped and why
    pub warning: String,
}

impl PartialAnalysis {
    /// Whether a given field carries a usable value
    pub fn has(&self, field: AnalysisField) -> bool {
        match field {
            AnalysisField::Title => self.title.is_some(),
            AnalysisField::Summary => self.summary.is_some(),
            AnalysisField::Sentiment => self.sentiment.is_some(),
            AnalysisField::Topics => self.topics.is_some(),
            AnalysisField::Tasks => !self.tasks.is_empty(),
            AnalysisField::KeyIdeas => !self.key_ideas.is_empty(),
            AnalysisField::DraftMessages => !self.draft_messages.is_empty(),
            AnalysisField::CrossReferences => !self.cross_references.is_empty(),
        }
    }

    /// Number of recognized fields that carry a value
    pub fn present_count(&self) -> usize {
        AnalysisField::ALL.iter().filter(|f| self.has(**f)).count()
    }
}

/// Top-level analysis field names, used by the salvage policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisField {
    Title,
    Summary,
    Sentiment,
    Topics,
    Tasks,
    KeyIdeas,
    DraftMessages,
    CrossReferences,
}

impl AnalysisField {
    pub const ALL: [AnalysisField; 8] = [
        Self::Title,
        Self::Summary,
        Self::Sentiment,
        Self::Topics,
        Self::Tasks,
        Self::KeyIdeas,
        Self::DraftMessages,
        Self::CrossReferences,
    ];

    /// JSON key of the field in the model response
    pub fn key(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Summary => "summary",
            Self::Sentiment => "sentiment",
            Self::Topics => "topics",
            Self::Tasks => "tasks",
            Self::KeyIdeas => "key_ideas",
            Self::DraftMessages => "draft_messages",
            Self::CrossReferences => "cross_references",
        }
    }
}

/// Outcome of parsing an LLM response: never a raw JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisResult {
    Full(Analysis),
    Partial(PartialAnalysis),
}

impl AnalysisResult {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Self::Full(a) => Some(&a.title),
            Self::Partial(p) => p.title.as_deref(),
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            Self::Full(a) => Some(&a.summary),
            Self::Partial(p) => p.summary.as_deref(),
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Full(_) => None,
            Self::Partial(p) => Some(&p.warning),
        }
    }
}
