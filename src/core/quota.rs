//! Per-owner quota admission control.
//!
//! Usage is recomputed from persisted state on every decision, so there is
//! no in-memory counter to drift. The guard never mutates anything.
//! Failing to compute usage denies (fail closed) with a denial distinct
//! from an actual quota violation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::clock::Clock;
use crate::store::{NoteStore, OwnerUsage, StoreError};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Per-owner ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Maximum stored notes (default: 500)
    #[serde(default = "default_max_notes")]
    pub max_notes: u64,

    /// Maximum processing attempts started in the trailing hour (default: 10)
    #[serde(default = "default_max_processing_per_hour")]
    pub max_processing_per_hour: u64,

    /// Maximum analysis tokens in the trailing day (default: 100k)
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,

    /// Maximum audio storage in MB (default: 500)
    #[serde(default = "default_max_storage_mb")]
    pub max_storage_mb: u64,
}

fn default_max_notes() -> u64 {
    500
}
fn default_max_processing_per_hour() -> u64 {
    10
}
fn default_max_tokens_per_day() -> u64 {
    100_000
}
fn default_max_storage_mb() -> u64 {
    500
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_notes: default_max_notes(),
            max_processing_per_hour: default_max_processing_per_hour(),
            max_tokens_per_day: default_max_tokens_per_day(),
            max_storage_mb: default_max_storage_mb(),
        }
    }
}

/// Current usage, as compared against [`QuotaLimits`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub notes: u64,
    pub processing_last_hour: u64,
    pub tokens_last_day: u64,
    pub storage_mb: f64,
}

impl From<OwnerUsage> for QuotaUsage {
    fn from(usage: OwnerUsage) -> Self {
        Self {
            notes: usage.note_count,
            processing_last_hour: usage.processing_last_hour,
            tokens_last_day: usage.tokens_last_day,
            storage_mb: usage.storage_bytes as f64 / BYTES_PER_MB,
        }
    }
}

/// A quota dimension, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Notes,
    Processing,
    Tokens,
    Storage,
}

impl QuotaDimension {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Notes => "Note limit exceeded",
            Self::Processing => "Processing limit exceeded",
            Self::Tokens => "Token limit exceeded",
            Self::Storage => "Storage limit exceeded",
        }
    }
}

/// Why admission was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuotaDenial {
    /// Over a ceiling; the caller must wait
    Exceeded { dimension: QuotaDimension },

    /// The owner has no notes at all
    UnknownOwner,

    /// Usage could not be computed
    Unavailable { message: String },
}

impl QuotaDenial {
    /// HTTP-equivalent status for the trigger surface
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Exceeded { .. } => 429,
            Self::UnknownOwner => 404,
            Self::Unavailable { .. } => 503,
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub usage: QuotaUsage,
    pub limits: QuotaLimits,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<QuotaDenial>,
}

impl QuotaLimits {
    /// First violated dimension for the given usage, if any
    pub fn first_violation(&self, usage: &QuotaUsage) -> Option<QuotaDimension> {
        if usage.notes > self.max_notes {
            return Some(QuotaDimension::Notes);
        }
        if usage.processing_last_hour >= self.max_processing_per_hour {
            return Some(QuotaDimension::Processing);
        }
        if usage.tokens_last_day >= self.max_tokens_per_day {
            return Some(QuotaDimension::Tokens);
        }
        if usage.storage_mb > self.max_storage_mb as f64 {
            return Some(QuotaDimension::Storage);
        }
        None
    }

    /// Evaluate usage into a decision
    pub fn decide(&self, usage: QuotaUsage) -> QuotaDecision {
        match self.first_violation(&usage) {
            Some(dimension) => QuotaDecision {
                allowed: false,
                reason: Some(dimension.reason().to_string()),
                usage,
                limits: self.clone(),
                denial: Some(QuotaDenial::Exceeded { dimension }),
            },
            None => QuotaDecision {
                allowed: true,
                reason: None,
                usage,
                limits: self.clone(),
                denial: None,
            },
        }
    }
}

/// Quota admission gate
pub struct QuotaGuard {
    limits: QuotaLimits,
    store: Arc<dyn NoteStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaGuard {
    pub fn new(limits: QuotaLimits, store: Arc<dyn NoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            store,
            clock,
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Decide whether `owner_id` may start another processing attempt
    pub async fn check(&self, owner_id: &str) -> QuotaDecision {
        let now = self.clock.now();

        match self.store.owner_usage(owner_id, now).await {
            Ok(usage) => {
                let decision = self.limits.decide(usage.into());
                if !decision.allowed {
                    debug!(owner_id, reason = ?decision.reason, "Quota denied");
                }
                decision
            }
            Err(StoreError::UnknownOwner(_)) => QuotaDecision {
                allowed: false,
                reason: Some("Unknown owner".to_string()),
                usage: QuotaUsage::default(),
                limits: self.limits.clone(),
                denial: Some(QuotaDenial::UnknownOwner),
            },
            Err(e) => {
                warn!(owner_id, error = %e, "Quota usage unavailable, denying");
                QuotaDecision {
                    allowed: false,
                    reason: Some("Quota check unavailable".to_string()),
                    usage: QuotaUsage::default(),
                    limits: self.limits.clone(),
                    denial: Some(QuotaDenial::Unavailable {
                        message: e.to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(notes: u64, processing: u64, tokens: u64, storage_mb: f64) -> QuotaUsage {
        QuotaUsage {
            notes,
            processing_last_hour: processing,
            tokens_last_day: tokens,
            storage_mb,
        }
    }

    #[test]
    fn test_processing_boundary() {
        let limits = QuotaLimits::default();

        assert!(limits.decide(usage(1, 9, 0, 0.0)).allowed);

        let denied = limits.decide(usage(1, 10, 0, 0.0));
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("Processing limit exceeded"));
    }

    #[test]
    fn test_notes_and_storage_are_strict() {
        let limits = QuotaLimits::default();

        assert!(limits.decide(usage(500, 0, 0, 500.0)).allowed);
        assert_eq!(
            limits.first_violation(&usage(501, 0, 0, 0.0)),
            Some(QuotaDimension::Notes)
        );
        assert_eq!(
            limits.first_violation(&usage(1, 0, 0, 500.5)),
            Some(QuotaDimension::Storage)
        );
    }

    #[test]
    fn test_first_violation_wins() {
        let limits = QuotaLimits::default();
        let decision = limits.decide(usage(1, 10, 100_000, 900.0));
        assert_eq!(
            decision.denial,
            Some(QuotaDenial::Exceeded {
                dimension: QuotaDimension::Processing
            })
        );
        assert_eq!(decision.denial.unwrap().status_code(), 429);
    }

    #[test]
    fn test_usage_from_bytes() {
        let owner = OwnerUsage {
            note_count: 3,
            storage_bytes: 3 * 1024 * 1024,
            processing_last_hour: 2,
            tokens_last_day: 10,
        };
        let usage = QuotaUsage::from(owner);
        assert_eq!(usage.storage_mb, 3.0);
        assert_eq!(usage.notes, 3);
    }
}
