//! Resilience component behavior under realistic call sequences.

use crate::errors::{AttemptError, BulkheadRejection, ProtectedCallError};
use crate::events::{ChannelListener, EventBus, ResilienceEvent};
use crate::resilience::{
    execute_with_retry, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, ProtectedRequest, RateLimitPolicy, RateLimiter, ResilienceOrchestrator,
    RetryPolicy,
};
use crate::ResilienceConfig;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_case::test_case;
use tokio::time::{sleep, Instant};

fn policy(window_ms: u64, max_requests: u32) -> RateLimitPolicy {
    RateLimitPolicy::builder()
        .window(Duration::from_millis(window_ms))
        .max_requests(max_requests)
        .key_prefix("ip")
        .build()
        .unwrap()
}

#[test]
fn test_rate_limit_counts_calls_in_window() {
    let limiter = RateLimiter::new();
    let policy = policy(1_000, 3);
    let window_start = 1_700_000_000_000_i64;

    for n in 1..=5u32 {
        let at = window_start + i64::from(n) * 100;
        let result = limiter.check_limit_at("203.0.113.7", &policy, at);
        assert_eq!(result.total_in_window, n);
        assert_eq!(result.allowed, n <= 3);
        assert_eq!(result.remaining, 3u32.saturating_sub(n));
    }

    let next_window = limiter.check_limit_at("203.0.113.7", &policy, window_start + 1_000);
    assert!(next_window.allowed);
    assert_eq!(next_window.total_in_window, 1);
}

#[test]
fn test_rate_limit_keys_are_independent() {
    let limiter = RateLimiter::new();
    let policy = policy(60_000, 1);
    let now = 1_700_000_000_000_i64;

    assert!(limiter.check_limit_at("a", &policy, now).allowed);
    assert!(!limiter.check_limit_at("a", &policy, now + 1).allowed);
    assert!(limiter.check_limit_at("b", &policy, now + 2).allowed);
    assert_eq!(limiter.stats().active_windows, 2);
}

fn half_and_half() -> CircuitBreakerConfig {
    CircuitBreakerConfig::new()
        .failure_threshold_percent(50.0)
        .volume_threshold(10)
        .recovery_timeout(Duration::from_secs(30))
}

fn trip(breaker: &CircuitBreaker, service: &str, now: Instant) {
    for _ in 0..5 {
        breaker.record_outcome_at(service, true, None, now);
    }
    for _ in 0..5 {
        breaker.record_outcome_at(service, false, None, now);
    }
}

#[tokio::test]
async fn test_circuit_transition_law() {
    let bus = Arc::new(EventBus::new());
    let (listener, mut events) = ChannelListener::new();
    bus.subscribe(Arc::new(listener));
    let breaker = CircuitBreaker::new().with_events(bus);
    let config = half_and_half();
    let start = Instant::now();

    assert!(breaker.is_available_at("soap", &config, start));
    trip(&breaker, "soap", start);
    assert_eq!(breaker.state("soap"), CircuitState::Open);
    assert!(!breaker.is_available_at("soap", &config, start + Duration::from_secs(29)));

    let retry_at = start + Duration::from_secs(30);
    assert!(breaker.is_available_at("soap", &config, retry_at));
    assert_eq!(breaker.state("soap"), CircuitState::HalfOpen);

    for _ in 0..2 {
        breaker.record_outcome_at("soap", true, None, retry_at);
        assert_eq!(breaker.state("soap"), CircuitState::HalfOpen);
    }
    breaker.record_outcome_at("soap", true, None, retry_at);
    assert_eq!(breaker.state("soap"), CircuitState::Closed);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec!["circuit_opened", "circuit_half_opened", "circuit_closed"]
    );
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreaker::new();
    let config = half_and_half();
    let start = Instant::now();

    breaker.is_available_at("llm", &config, start);
    trip(&breaker, "llm", start);

    let retry_at = start + Duration::from_secs(30);
    assert!(breaker.is_available_at("llm", &config, retry_at));
    breaker.record_outcome_at("llm", true, None, retry_at);
    breaker.record_outcome_at("llm", false, None, retry_at);

    assert_eq!(breaker.state("llm"), CircuitState::Open);
    assert!(!breaker.is_available_at("llm", &config, retry_at + Duration::from_secs(1)));
}

#[tokio::test]
async fn test_below_volume_never_opens() {
    let breaker = CircuitBreaker::new();
    let config = half_and_half();
    let now = Instant::now();
    breaker.is_available_at("db", &config, now);

    for _ in 0..9 {
        breaker.record_outcome_at("db", false, None, now);
    }
    assert_eq!(breaker.state("db"), CircuitState::Closed);
}

#[test_case(1, 2 ; "single slot")]
#[test_case(3, 7 ; "several slots")]
#[tokio::test(start_paused = true)]
async fn test_bulkhead_capacity(max_concurrent: usize, submitted: usize) {
    let bulkhead = Bulkhead::new(
        "messaging",
        BulkheadConfig::new()
            .max_concurrent(max_concurrent)
            .max_queue_size(submitted)
            .queue_timeout(Duration::from_secs(60)),
    )
    .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..submitted)
        .map(|_| {
            let bulkhead = bulkhead.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        assert!(task.unwrap().is_ok());
    }
    assert_eq!(peak.load(Ordering::SeqCst), max_concurrent.min(submitted));
    assert_eq!(bulkhead.metrics().total_executions, submitted as u64);
    assert_eq!(bulkhead.metrics().failed_executions, 0);
}

#[test_case(1, Duration::from_millis(1_000))]
#[test_case(2, Duration::from_millis(2_000))]
#[test_case(3, Duration::from_millis(4_000))]
#[test_case(4, Duration::from_millis(5_000) ; "capped")]
fn test_backoff_doubles_until_cap(attempt: u32, expected: Duration) {
    let policy = RetryPolicy::new()
        .base_delay(Duration::from_millis(1_000))
        .backoff_multiplier(2.0)
        .max_delay(Duration::from_millis(5_000))
        .jitter_factor(0.0);
    assert_eq!(policy.nominal_delay(attempt), expected);
    assert_eq!(policy.delay_for_attempt(attempt), expected);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_uses_every_attempt() {
    let policy = RetryPolicy::new()
        .max_attempts(4)
        .base_delay(Duration::from_millis(100))
        .jitter_factor(0.0);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = execute_with_retry(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("ETIMEDOUT".to_string()) }
        },
        &policy,
    )
    .await;

    assert!(!result.is_success());
    assert_eq!(result.attempts, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 100 + 200 + 400 ms of backoff
    assert!(result.total_time >= Duration::from_millis(700));
}

fn single_slot_orchestrator() -> Arc<ResilienceOrchestrator> {
    let config = ResilienceConfig::new()
        .with_bulkhead(
            "document_service",
            BulkheadConfig::new()
                .max_concurrent(1)
                .queue_timeout(Duration::from_millis(50)),
        )
        .with_retry("document_service", RetryPolicy::new().max_attempts(1));
    Arc::new(ResilienceOrchestrator::from_config(&config).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_second_call_times_out_in_queue() {
    let orchestrator = single_slot_orchestrator();
    let request = ProtectedRequest::new("document_service");
    let slow = || async {
        sleep(Duration::from_millis(100)).await;
        Ok::<_, String>("done")
    };

    let (first, second) = tokio::join!(
        orchestrator.protect(&request, slow),
        orchestrator.protect(&request, slow)
    );

    assert_eq!(first.unwrap(), "done");
    match second.unwrap_err() {
        ProtectedCallError::Bulkhead(BulkheadRejection::QueueTimeout { waited, .. }) => {
            assert!(waited >= Duration::from_millis(50));
            assert!(waited < Duration::from_millis(100));
        }
        other => panic!("expected queue timeout, got {other:?}"),
    }

    let metrics = orchestrator.bulkheads().metrics("document_service").unwrap();
    assert_eq!(metrics.total_executions, 1);
    assert_eq!(metrics.failed_executions, 1);
    assert_eq!(orchestrator.metrics().bulkhead_rejections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_call_runs_after_first_when_fast_enough() {
    let orchestrator = single_slot_orchestrator();
    let request = ProtectedRequest::new("document_service");
    let quick = || async {
        sleep(Duration::from_millis(30)).await;
        Ok::<_, String>(Instant::now())
    };

    let (first, second) = tokio::join!(
        orchestrator.protect(&request, quick),
        orchestrator.protect(&request, quick)
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(second.duration_since(first) >= Duration::from_millis(30));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_reported() {
    let config = ResilienceConfig::new().with_retry(
        "text_generation",
        RetryPolicy::new()
            .max_attempts(2)
            .base_delay(Duration::from_millis(10))
            .timeout(Duration::from_millis(200)),
    );
    let orchestrator = ResilienceOrchestrator::from_config(&config).unwrap();

    let err = orchestrator
        .protect(&ProtectedRequest::new("text_generation"), || async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();

    match err {
        ProtectedCallError::Failed { error, attempts, .. } => {
            assert_eq!(attempts, 2);
            assert!(matches!(error, AttemptError::Timeout(t) if t == Duration::from_millis(200)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_listener_sees_rate_limit_event() {
    let bus = Arc::new(EventBus::new());
    let (listener, mut events) = ChannelListener::new();
    bus.subscribe(Arc::new(listener));
    let limiter = RateLimiter::new().with_events(bus);
    let policy = policy(60_000, 1);
    let now = 1_700_000_000_000_i64;

    limiter.check_limit_at("198.51.100.20", &policy, now);
    limiter.check_limit_at("198.51.100.20", &policy, now + 1);

    assert_eq!(
        events.recv().await,
        Some(ResilienceEvent::RateLimitExceeded {
            key: "ip:198.51.100.20".to_string(),
            requests: 2,
            limit: 1,
        })
    );
}
