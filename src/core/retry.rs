//! Bounded exponential-backoff retry around a single external call.
//!
//! Before every attempt the shared [`CircuitBreaker`] is consulted; an open
//! circuit fails the call immediately without consuming an attempt. Only
//! retryable [`ErrorKind`]s earn another attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::circuit::CircuitBreaker;
use super::clock::{Clock, Jitter};
use crate::adapters::{ErrorKind, ProviderError};

/// Retry policy for external calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay after a failed attempt (1-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Why a retried call gave up
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("Circuit open for {service} after {attempts} attempt(s)")]
    CircuitOpen {
        service: String,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("{service} failed after {attempts} attempt(s): {source}")]
    Failed {
        service: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            Self::CircuitOpen { service, .. } | Self::Failed { service, .. } => service,
        }
    }

    /// Kind of the last provider error, if an attempt was made
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Failed { source, .. } => Some(source.kind),
        }
    }
}

/// A successful value plus the number of attempts it took
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs external calls under the retry policy and the shared circuit breaker
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl RetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
    ) -> Self {
        Self {
            policy,
            breaker,
            clock,
            jitter,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Execute `op` with retries.
    ///
    /// `op` receives the 1-indexed attempt number. Each attempt is bounded
    /// by `timeout`; an elapsed timeout counts as a retryable failure.
    pub async fn execute<T, F, Fut>(
        &self,
        service: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<Retried<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;

        loop {
            if !self.breaker.before_call(service) {
                warn!(service, attempts = attempt, "Circuit open, call refused");
                return Err(RetryError::CircuitOpen {
                    service: service.to_string(),
                    attempts: attempt,
                    retry_after: self.breaker.retry_after(service),
                });
            }

            attempt += 1;

            let result = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(format!(
                    "{} call timed out after {}s",
                    service,
                    timeout.as_secs()
                ))),
            };

            let error = match result {
                Ok(value) => {
                    self.breaker.record_success(service);
                    debug!(service, attempt, "Call succeeded");
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            self.breaker.record_failure(service, error.kind);

            if !error.is_retryable() || !self.policy.should_retry(attempt) {
                warn!(
                    service,
                    attempt,
                    kind = %error.kind,
                    retryable = error.is_retryable(),
                    "Call failed, giving up"
                );
                return Err(RetryError::Failed {
                    service: service.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.backoff(attempt, &error);
            warn!(
                service,
                attempt,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "Call failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        let base = self.policy.delay_for_attempt(attempt);
        let mut delay = base + self.jitter.jitter(base);

        // Honor a server-suggested wait, within the policy ceiling
        if let Some(hint) = error.retry_after {
            delay = delay.max(hint);
        }

        delay.min(Duration::from_millis(self.policy.max_delay_ms))
    }
}
