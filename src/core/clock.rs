//! Time and randomness sources injected into the retry and circuit layers.
//!
//! Production code uses [`SystemClock`] and [`RandomJitter`]; tests swap in
//! [`ManualClock`] and [`NoJitter`] so backoff schedules and cool-downs are
//! observable without real timers.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;

/// Wall clock plus the ability to wait
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Real time, backed by tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test clock: `sleep` returns immediately and advances the current time
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += to_chrono(duration);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// Source of the random component added to backoff delays
pub trait Jitter: Send + Sync {
    /// Extra delay to add on top of `base`
    fn jitter(&self, base: Duration) -> Duration;
}

/// Uniform jitter in `[0, base * ratio]`
#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    pub ratio: f64,
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self { ratio: 0.25 }
    }
}

impl Jitter for RandomJitter {
    fn jitter(&self, base: Duration) -> Duration {
        let max_ms = (base.as_millis() as f64 * self.ratio.max(0.0)) as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Deterministic: no jitter at all
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn jitter(&self, _base: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Convert a std duration, saturating instead of failing on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_secs(4)).await;

        assert_eq!(clock.now(), start + chrono::Duration::seconds(6));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn test_random_jitter_bounds() {
        let jitter = RandomJitter { ratio: 0.5 };
        for _ in 0..100 {
            let extra = jitter.jitter(Duration::from_millis(1000));
            assert!(extra <= Duration::from_millis(500));
        }
        assert_eq!(jitter.jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_no_jitter() {
        assert_eq!(NoJitter.jitter(Duration::from_secs(10)), Duration::ZERO);
    }
}
