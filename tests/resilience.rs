//! Resilience Integration Tests
//!
//! Circuit breaker and retry executor behavior against a manual clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use voxnote::adapters::{ErrorKind, ProviderError};
use voxnote::core::{
    CircuitBreaker, CircuitConfig, CircuitPhase, ManualClock, NoJitter, RetryError,
    RetryExecutor, RetryPolicy,
};

const SERVICE: &str = "transcription";

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
    ))
}

fn breaker(clock: &Arc<ManualClock>, threshold: u32) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        CircuitConfig {
            threshold,
            window_seconds: 300,
            cooldown_seconds: 60,
        },
        clock.clone(),
    ))
}

fn executor(clock: &Arc<ManualClock>, breaker: Arc<CircuitBreaker>) -> RetryExecutor {
    RetryExecutor::new(
        RetryPolicy::default(),
        breaker,
        clock.clone(),
        Arc::new(NoJitter),
    )
}

#[test]
fn test_breaker_opens_then_admits_one_trial() {
    let clock = clock();
    let breaker = breaker(&clock, 3);

    for _ in 0..3 {
        assert!(breaker.before_call(SERVICE));
        breaker.record_failure(SERVICE, ErrorKind::Server);
    }
    assert_eq!(breaker.phase(SERVICE), CircuitPhase::Open);
    assert!(!breaker.before_call(SERVICE));

    clock.advance(Duration::from_secs(59));
    assert!(!breaker.before_call(SERVICE));

    clock.advance(Duration::from_secs(2));
    assert!(breaker.before_call(SERVICE));
    // Only one trial while it is in flight
    assert!(!breaker.before_call(SERVICE));
    assert_eq!(breaker.phase(SERVICE), CircuitPhase::HalfOpen);

    breaker.record_success(SERVICE);
    assert_eq!(breaker.phase(SERVICE), CircuitPhase::Closed);
    assert!(breaker.before_call(SERVICE));
}

#[test]
fn test_failed_trial_reopens() {
    let clock = clock();
    let breaker = breaker(&clock, 2);

    breaker.record_failure(SERVICE, ErrorKind::Timeout);
    breaker.record_failure(SERVICE, ErrorKind::Timeout);
    clock.advance(Duration::from_secs(61));

    assert!(breaker.before_call(SERVICE));
    breaker.record_failure(SERVICE, ErrorKind::Timeout);

    assert_eq!(breaker.phase(SERVICE), CircuitPhase::Open);
    assert!(!breaker.before_call(SERVICE));
}

#[test]
fn test_services_are_isolated() {
    let clock = clock();
    let breaker = breaker(&clock, 1);

    breaker.record_failure("analysis", ErrorKind::Server);

    assert!(!breaker.before_call("analysis"));
    assert!(breaker.before_call(SERVICE));

    let snapshot = breaker.snapshot();
    let analysis = snapshot.iter().find(|s| s.service == "analysis").unwrap();
    assert_eq!(analysis.phase, CircuitPhase::Open);
    assert_eq!(analysis.error_histogram.get("server"), Some(&1));
}

#[tokio::test]
async fn test_succeeds_on_third_attempt() {
    let clock = clock();
    let retry = executor(&clock, breaker(&clock, 5));
    let calls = AtomicU32::new(0);

    let result = retry
        .execute(SERVICE, Duration::from_secs(5), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ProviderError::network("connection reset"))
                } else {
                    Ok("hello")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result.value, "hello");
    assert_eq!(result.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn test_exhausted_budget_returns_last_error() {
    let clock = clock();
    let retry = executor(&clock, breaker(&clock, 5));

    let err = retry
        .execute(SERVICE, Duration::from_secs(5), |attempt| async move {
            Err::<(), _>(ProviderError::new(
                ErrorKind::Server,
                format!("attempt {} failed", attempt),
            ))
        })
        .await
        .unwrap_err();

    match err {
        RetryError::Failed {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(source.kind, ErrorKind::Server);
            assert_eq!(source.message, "attempt 3 failed");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_validation_error_is_not_retried() {
    let clock = clock();
    let retry = executor(&clock, breaker(&clock, 5));
    let calls = AtomicU32::new(0);

    let err = retry
        .execute(SERVICE, Duration::from_secs(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::validation("unsupported language")) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert_eq!(err.kind(), Some(ErrorKind::Validation));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_timeout_counts_as_retryable_failure() {
    let clock = clock();
    let retry = executor(&clock, breaker(&clock, 5));

    let result = retry
        .execute(SERVICE, Duration::from_millis(20), |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, ProviderError>(attempt)
        })
        .await
        .unwrap();

    assert_eq!(result.value, 2);
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn test_open_circuit_stops_retrying() {
    let clock = clock();
    let breaker = breaker(&clock, 2);
    let retry = executor(&clock, breaker.clone());
    let calls = AtomicU32::new(0);

    let err = retry
        .execute(SERVICE, Duration::from_secs(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::network("refused")) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RetryError::CircuitOpen { attempts: 2, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.phase(SERVICE), CircuitPhase::Open);
}

#[tokio::test]
async fn test_cancelled_trial_does_not_wedge_the_breaker() {
    let clock = clock();
    let breaker = breaker(&clock, 1);
    let retry = executor(&clock, breaker.clone());

    breaker.record_failure("analysis", ErrorKind::Server);
    clock.advance(Duration::from_secs(61));

    // The caller gives up on the trial call before it resolves
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        retry.execute("analysis", Duration::from_secs(3600), |_| async {
            std::future::pending::<Result<(), ProviderError>>().await
        }),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(breaker.phase("analysis"), CircuitPhase::HalfOpen);
    assert!(!breaker.before_call("analysis"));

    clock.advance(Duration::from_secs(61));
    let result = retry
        .execute("analysis", Duration::from_secs(5), |_| async {
            Ok::<_, ProviderError>("recovered")
        })
        .await
        .unwrap();

    assert_eq!(result.value, "recovered");
    assert_eq!(breaker.phase("analysis"), CircuitPhase::Closed);
}
