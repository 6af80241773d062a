//! Per-service circuit breaker registry.
//!
//! One registry is shared by every note processed in this process (it is
//! owned by the orchestrator and injected into the retry executor). Each
//! service key moves through CLOSED → OPEN → HALF_OPEN → CLOSED. The error
//! kind is kept in a histogram for observability only: every failure counts
//! toward the threshold the same way.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::Clock;
use crate::adapters::ErrorKind;

/// Breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the window that open the circuit (default: 5)
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Sliding window for counting failures, in seconds (default: 300)
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Time an open circuit waits before a trial call, in seconds (default: 60)
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_threshold() -> u32 {
    5
}
fn default_window_seconds() -> u64 {
    300
}
fn default_cooldown_seconds() -> u64 {
    60
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_seconds: default_window_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

/// Externally visible breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: DateTime<Utc> },
    /// `trial_started` is set while the single trial call is outstanding
    HalfOpen { trial_started: Option<DateTime<Utc>> },
}

#[derive(Debug)]
struct CircuitState {
    phase: Phase,
    failures: VecDeque<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    histogram: HashMap<ErrorKind, u64>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failures: VecDeque::new(),
            last_failure_time: None,
            histogram: HashMap::new(),
        }
    }

    fn prune(&mut self, window_start: DateTime<Utc>) {
        while let Some(front) = self.failures.front() {
            if *front < window_start {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of one service's breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub error_histogram: BTreeMap<String, u64>,
}

/// Registry of breakers keyed by service name
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.config.cooldown_seconds as i64)
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_seconds as i64)
    }

    /// Whether a call to `service` may proceed right now.
    ///
    /// An open circuit past its cool-down moves to HALF_OPEN and admits
    /// exactly one trial call; further calls are refused until that trial
    /// reports back. A trial that never reports (its future was dropped)
    /// is considered lost after another cool-down and a new one is admitted.
    pub fn before_call(&self, service: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());

        let Some(state) = circuits.get_mut(service) else {
            return true;
        };

        match state.phase {
            Phase::Closed => true,
            Phase::Open { since } => {
                if now - since >= self.cooldown() {
                    info!(service, "Circuit half-open, admitting trial call");
                    state.phase = Phase::HalfOpen {
                        trial_started: Some(now),
                    };
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen {
                trial_started: Some(started),
            } if now - started < self.cooldown() => false,
            Phase::HalfOpen { trial_started } => {
                if trial_started.is_some() {
                    warn!(service, "Trial call never reported, admitting another");
                }
                state.phase = Phase::HalfOpen {
                    trial_started: Some(now),
                };
                true
            }
        }
    }

    /// Any success closes the circuit and clears the failure count
    pub fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(state) = circuits.get_mut(service) {
            if !matches!(state.phase, Phase::Closed) {
                info!(service, "Circuit closed");
            }
            state.phase = Phase::Closed;
            state.failures.clear();
        }
    }

    pub fn record_failure(&self, service: &str, kind: ErrorKind) {
        let now = self.clock.now();
        let threshold = self.config.threshold.max(1) as usize;
        let window_start = now - self.window();

        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let state = circuits
            .entry(service.to_string())
            .or_insert_with(CircuitState::new);

        *state.histogram.entry(kind).or_insert(0) += 1;
        state.last_failure_time = Some(now);
        state.failures.push_back(now);
        state.prune(window_start);

        match state.phase {
            Phase::Closed => {
                if state.failures.len() >= threshold {
                    warn!(
                        service,
                        failures = state.failures.len(),
                        "Circuit opened"
                    );
                    state.phase = Phase::Open { since: now };
                }
            }
            Phase::HalfOpen { .. } => {
                warn!(service, "Trial call failed, circuit re-opened");
                state.phase = Phase::Open { since: now };
            }
            // Late failure from a call admitted before the circuit opened
            Phase::Open { .. } => {}
        }
    }

    /// Current phase of a service (CLOSED if never seen)
    pub fn phase(&self, service: &str) -> CircuitPhase {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .get(service)
            .map(|s| public_phase(s.phase))
            .unwrap_or(CircuitPhase::Closed)
    }

    /// Remaining cool-down for an open circuit
    pub fn retry_after(&self, service: &str) -> Option<std::time::Duration> {
        let now = self.clock.now();
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        match circuits.get(service)?.phase {
            Phase::Open { since } => (since + self.cooldown() - now).to_std().ok(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(service, state)| CircuitSnapshot {
                service: service.clone(),
                phase: public_phase(state.phase),
                failure_count: state.failures.len() as u32,
                last_failure_time: state.last_failure_time,
                error_histogram: state
                    .histogram
                    .iter()
                    .map(|(kind, count)| (kind.as_str().to_string(), *count))
                    .collect(),
            })
            .collect();

        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

fn public_phase(phase: Phase) -> CircuitPhase {
    match phase {
        Phase::Closed => CircuitPhase::Closed,
        Phase::Open { .. } => CircuitPhase::Open,
        Phase::HalfOpen { .. } => CircuitPhase::HalfOpen,
    }
}
