//! Retry behavior of the acquire path and the standalone retry helpers.

mod common;

use common::{FakeProbe, blocking_target, manager, register, target};
use pg_multipool::db::{RetryPolicy, retry_async, retry_blocking};
use pg_multipool::error::DbError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn steady_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(20), Duration::from_secs(1))
        .with_jitter(false)
}

#[tokio::test]
async fn test_transient_failure_tried_max_attempts_times() {
    let manager = manager(FakeProbe::new());
    let policy = steady_policy(3);
    let fake = register(
        &manager,
        target("primary", 5).with_retry(policy.clone()),
    );
    fake.set_failing(true);

    let start = Instant::now();
    let result = manager.acquire("primary", Duration::from_secs(2)).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(DbError::TransientNetwork { .. })));
    assert_eq!(fake.connects(), 3);
    // 20ms then 40ms between the three tries
    let slept = policy.base_backoff(1) + policy.base_backoff(2);
    assert_eq!(slept, Duration::from_millis(60));
    assert!(elapsed >= slept, "finished after {:?}", elapsed);

    // One failed acquire, however many tries it took
    assert_eq!(manager.health("primary").unwrap().consecutive_failures, 1);
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failures() {
    let manager = manager(FakeProbe::new());
    let fake = register(&manager, target("primary", 2).with_retry(steady_policy(4)));
    fake.fail_next(2);

    let session = manager.acquire("primary", Duration::from_secs(2)).await;
    assert!(session.is_ok());
    assert_eq!(fake.connects(), 3);
    assert_eq!(manager.health("primary").unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn test_retries_stop_at_acquire_budget() {
    let manager = manager(FakeProbe::new());
    let policy = RetryPolicy::default()
        .with_max_attempts(10)
        .with_delays(Duration::from_millis(100), Duration::from_secs(1))
        .with_jitter(false);
    let fake = register(&manager, target("primary", 2).with_retry(policy));
    fake.set_failing(true);

    let start = Instant::now();
    let result = manager.acquire("primary", Duration::from_millis(250)).await;

    assert!(result.is_err());
    // 100ms and 200ms backoffs cannot both fit in 250ms
    assert_eq!(fake.connects(), 2);
    assert!(start.elapsed() < Duration::from_millis(250));
}

#[test]
fn test_blocking_acquire_retries_on_plain_thread() {
    let manager = manager(FakeProbe::new());
    let fake = register(
        &manager,
        blocking_target("batch", 2).with_retry(steady_policy(3)),
    );
    fake.fail_next(1);

    let mut session = manager
        .acquire_blocking("batch", Duration::from_secs(2))
        .unwrap();
    assert_eq!(fake.connects(), 2);
    manager.release(&mut session).unwrap();
}

#[test]
fn test_retry_blocking_gives_up_after_max_attempts() {
    let policy = steady_policy(4);
    let calls = AtomicU32::new(0);

    let start = Instant::now();
    let result: Result<(), DbError> = retry_blocking(&policy, "primary", |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(attempt, calls.load(Ordering::SeqCst));
        Err(DbError::transient_network("primary", "connection reset by peer"))
    });

    assert!(matches!(result, Err(DbError::TransientNetwork { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // 20 + 40 + 80
    assert!(start.elapsed() >= Duration::from_millis(140));
}

#[tokio::test]
async fn test_retry_async_skips_non_retryable_errors() {
    let policy = steady_policy(5);
    let calls = AtomicU32::new(0);

    let result: Result<(), DbError> = retry_async(&policy, "primary", |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(DbError::config("primary", "database \"app\" does not exist")) }
    })
    .await;

    assert!(matches!(result, Err(DbError::Config { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_jittered_delays_stay_within_cap() {
    let policy = RetryPolicy::default()
        .with_delays(Duration::from_millis(50), Duration::from_millis(400))
        .with_jitter(true);

    for attempt in 1..=12 {
        let base = policy.base_backoff(attempt);
        assert!(base <= Duration::from_millis(400));
        for _ in 0..20 {
            let delay = policy.next_delay(attempt);
            assert!(delay <= base);
            assert!(delay >= base / 2 - Duration::from_millis(1));
        }
    }
}
