//! End-to-end scenarios exercising the primitives together, on virtual time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parapet::prelude::*;
use parapet::cache::{CacheEvent, EvictionReason};
use parapet::saga::SagaResult;
use parapet::time_limiter::TimeLimiterConfig;
use parapet::ResilienceError;

#[tokio::test]
async fn breaker_opens_after_threshold_and_rejects_the_next_call() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap();

    for call in 0..3 {
        let result: Result<(), _> = breaker
            .execute(|| async { Err(format!("failure {call}")) })
            .await;
        assert_eq!(
            result.unwrap_err(),
            ResilienceError::Underlying(format!("failure {call}")),
            "user errors pass through while the breaker counts them"
        );
    }

    assert_eq!(breaker.current_state(), CircuitState::Open);
    assert_eq!(breaker.failure_count(), 3);

    let ran = AtomicUsize::new(0);
    let rejected: Result<(), ResilienceError<String>> = breaker
        .execute(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert_eq!(rejected.unwrap_err(), ResilienceError::BreakerOpen);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "rejected ops never run");
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_reset_timeout_via_half_open() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(1),
        half_open_success_threshold: 2,
        half_open_max_calls: 3,
    })
    .unwrap();

    for _ in 0..3 {
        let _: Result<(), _> = breaker
            .execute(|| async { Err("down".to_string()) })
            .await;
    }
    assert_eq!(breaker.current_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1001)).await;

    let first = breaker
        .execute(|| async { Ok::<_, String>("ok") })
        .await
        .unwrap();
    assert_eq!(first, "ok");
    assert_eq!(
        breaker.current_state(),
        CircuitState::HalfOpen,
        "one success of two required leaves the breaker half-open"
    );

    breaker
        .execute(|| async { Ok::<_, String>("ok") })
        .await
        .unwrap();
    assert_eq!(breaker.current_state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn bulkhead_admits_fifo_and_rejects_beyond_queue() {
    let bulkhead = Arc::new(
        Bulkhead::new(BulkheadConfig {
            max_concurrent_calls: 1,
            max_waiting_calls: 2,
            max_wait_duration: None,
        })
        .unwrap(),
    );
    let completions: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let bulkhead = Arc::clone(&bulkhead);
        let completions = Arc::clone(&completions);
        tokio::spawn(async move {
            bulkhead
                .execute(|| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    completions.lock().unwrap().push("A");
                    Ok::<_, String>(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(1)).await;

    let mut queued = Vec::new();
    for tag in ["B", "C"] {
        let bulkhead = Arc::clone(&bulkhead);
        let completions = Arc::clone(&completions);
        queued.push(tokio::spawn(async move {
            bulkhead
                .execute(|| async move {
                    completions.lock().unwrap().push(tag);
                    Ok::<_, String>(())
                })
                .await
        }));
        tokio::task::yield_now().await;
    }
    assert_eq!(bulkhead.waiting_calls(), 2);

    // D finds the queue full.
    let d: Result<(), ResilienceError<String>> =
        bulkhead.execute(|| async { Ok(()) }).await;
    assert_eq!(d.unwrap_err(), ResilienceError::BulkheadFull);

    a.await.unwrap().unwrap();
    for task in queued {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        *completions.lock().unwrap(),
        vec!["A", "B", "C"],
        "waiters complete in arrival order after the holder"
    );
}

#[tokio::test(start_paused = true)]
async fn token_bucket_refills_while_idle() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        permits_per_second: 10.0,
        burst_capacity: 2,
    })
    .unwrap();

    limiter
        .try_execute(|| async { Ok::<_, String>(()) })
        .await
        .unwrap();
    limiter
        .try_execute(|| async { Ok::<_, String>(()) })
        .await
        .unwrap();

    let rejected: Result<(), ResilienceError<String>> =
        limiter.try_execute(|| async { Ok(()) }).await;
    assert_eq!(rejected.unwrap_err(), ResilienceError::RateLimitExceeded);

    tokio::time::advance(Duration::from_millis(100)).await;
    limiter
        .try_execute(|| async { Ok::<_, String>(()) })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn time_limiter_counts_the_timeout() {
    let limiter = TimeLimiter::new(TimeLimiterConfig {
        timeout: Duration::from_millis(50),
        ..Default::default()
    })
    .unwrap();

    let result: Result<(), ResilienceError<String>> = limiter
        .execute(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

    assert_eq!(result.unwrap_err(), ResilienceError::TimedOut);
    let stats = limiter.statistics();
    assert_eq!(stats.timed_out_calls, 1);
    assert_eq!(stats.successful_calls, 0);
}

#[tokio::test]
async fn saga_compensates_in_reverse_order() {
    let compensations: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut builder = SagaBuilder::new("provisioning");
    for name in ["s1", "s2", "s3"] {
        let compensations = Arc::clone(&compensations);
        builder = builder.compensable_step(
            name,
            || async { Ok::<_, String>(()) },
            move |_| {
                let compensations = Arc::clone(&compensations);
                async move {
                    compensations.lock().unwrap().push(name);
                    Ok(())
                }
            },
        );
    }
    let saga = builder
        .step("s4", || async { Err("s4 failed".to_string()) })
        .build()
        .unwrap();

    match saga.execute().await {
        SagaResult::Failure {
            compensated_steps,
            compensation_errors,
            ..
        } => {
            assert_eq!(compensated_steps, 3);
            assert!(compensation_errors.is_empty());
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(*compensations.lock().unwrap(), vec!["s3", "s2", "s1"]);
}

#[tokio::test]
async fn lru_cache_evicts_the_least_recently_used_key() {
    let cache: Cache<&'static str, u32> = Cache::new(CacheConfig {
        max_size: 3,
        ttl: None,
        eviction: EvictionStrategy::Lru,
    })
    .unwrap();

    let evicted: Arc<Mutex<Vec<(&'static str, EvictionReason)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let evicted_clone = Arc::clone(&evicted);
    cache.add_listener(move |event: &CacheEvent<&'static str, u32>| {
        if let CacheEvent::Evicted { key, reason, .. } = event {
            evicted_clone.lock().unwrap().push((*key, *reason));
        }
    });

    cache.put("k1", 1);
    cache.put("k2", 2);
    cache.put("k3", 3);
    assert_eq!(cache.get(&"k1"), Some(1));
    cache.put("k4", 4);

    let mut present = cache.keys();
    present.sort();
    assert_eq!(present, vec!["k1", "k3", "k4"]);
    assert_eq!(
        *evicted.lock().unwrap(),
        vec![("k2", EvictionReason::Size)]
    );
}

#[tokio::test(start_paused = true)]
async fn primitives_compose_around_one_operation() {
    // Breaker outside, time limiter inside: timeouts count as failures
    // and eventually open the breaker.
    let breaker = Arc::new(
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap(),
    );
    let limiter = Arc::new(
        TimeLimiter::new(TimeLimiterConfig {
            timeout: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap(),
    );

    for _ in 0..2 {
        let limiter = Arc::clone(&limiter);
        let result: Result<(), _> = breaker
            .execute(|| async move {
                limiter
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok::<_, String>(())
                    })
                    .await
                    .map_err(|err| err.to_string())
            })
            .await;
        assert!(result.is_err());
    }

    assert_eq!(breaker.current_state(), CircuitState::Open);
    assert_eq!(limiter.statistics().timed_out_calls, 2);
}

#[tokio::test]
async fn registry_round_trips_and_trip_reset_restores_initial_state() {
    let registry = CircuitBreakerRegistry::new();
    let breaker = registry.get_or_create("api", CircuitBreaker::new_default);

    breaker.trip();
    assert_eq!(breaker.current_state(), CircuitState::Open);
    breaker.reset();
    assert_eq!(breaker.current_state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);

    let same = registry.get("api").unwrap();
    assert!(Arc::ptr_eq(&breaker, &same));
    assert!(registry.remove("api").is_some());
    assert!(registry.get("api").is_none());
}

#[tokio::test]
async fn listener_panic_does_not_disturb_breaker_state() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let breaker = Arc::new(CircuitBreaker::new_default());

    breaker.add_listener(|_| panic!("observer bug"));
    let observed = Arc::new(AtomicUsize::new(0));
    let observed_clone = Arc::clone(&observed);
    breaker.add_listener(move |_| {
        observed_clone.fetch_add(1, Ordering::SeqCst);
    });

    breaker.trip();
    assert_eq!(breaker.current_state(), CircuitState::Open);
    assert_eq!(
        observed.load(Ordering::SeqCst),
        1,
        "the second listener still fires"
    );

    // State machine keeps functioning afterwards.
    breaker.reset();
    breaker
        .execute(|| async { Ok::<_, String>(()) })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_and_time_limiter_compose_for_slow_starts() {
    let retry: Retry<ResilienceError<String>> =
        Retry::spaced(2, Duration::from_millis(5));
    let limiter = Arc::new(
        TimeLimiter::new(TimeLimiterConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let value = retry
        .execute(|| {
            let limiter = Arc::clone(&limiter);
            let calls = Arc::clone(&calls);
            async move {
                limiter
                    .execute(move || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Ok::<_, String>(n)
                    })
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 1, "second attempt beats the deadline");
}
