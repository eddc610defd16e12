//! Registration, removal and shutdown tests.

mod common;

use common::{FakeProbe, blocking_target, manager, register, target};
use pg_multipool::db::{ConnectionManager, Connector};
use pg_multipool::error::DbError;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_remove_target_defers_close_of_leased_connection() {
    let manager = manager(FakeProbe::new());
    let fake = register(&manager, target("primary", 2));

    let mut leased = manager
        .acquire("primary", Duration::from_millis(100))
        .await
        .unwrap();
    let mut idle = manager
        .acquire("primary", Duration::from_millis(100))
        .await
        .unwrap();
    manager.release(&mut idle).unwrap();
    assert_eq!(fake.live(), 2);

    manager.remove_target("primary").unwrap();

    // Idle connection closed right away, the leased one is still usable
    assert_eq!(fake.live(), 1);
    assert!(!leased.is_released());
    assert!(!manager.contains("primary"));

    manager.release(&mut leased).unwrap();
    assert_eq!(fake.live(), 0);

    match manager.acquire("primary", Duration::from_millis(100)).await {
        Err(DbError::UnknownTarget { target }) => assert_eq!(target, "primary"),
        other => panic!("Expected UnknownTarget, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reregistered_name_gets_fresh_pool() {
    let manager = manager(FakeProbe::new());
    let old = register(&manager, target("primary", 1));

    let mut stale = manager
        .acquire("primary", Duration::from_millis(100))
        .await
        .unwrap();
    manager.remove_target("primary").unwrap();
    let new = register(&manager, target("primary", 1));

    // The stale session goes back to the removed pool, which closes it
    manager.release(&mut stale).unwrap();
    assert_eq!(old.live(), 0);

    let stats = manager.pool_stats("primary").unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.in_use, 0);

    let session = manager.acquire("primary", Duration::from_millis(100)).await;
    assert!(session.is_ok());
    assert_eq!(new.connects(), 1);
}

#[tokio::test]
async fn test_session_from_other_manager_is_rejected() {
    let ours = manager(FakeProbe::new());
    let theirs = manager(FakeProbe::new());
    register(&ours, target("primary", 1));
    let their_fake = register(&theirs, target("primary", 1));

    let mut session = theirs
        .acquire("primary", Duration::from_millis(100))
        .await
        .unwrap();

    match ours.release(&mut session) {
        Err(DbError::ForeignSession { target, .. }) => assert_eq!(target, "primary"),
        other => panic!("Expected ForeignSession, got {:?}", other),
    }
    assert!(!session.is_released());
    assert_eq!(ours.pool_stats("primary").unwrap().idle, 0);

    theirs.release(&mut session).unwrap();
    assert_eq!(theirs.pool_stats("primary").unwrap().idle, 1);
    assert_eq!(their_fake.live(), 1);
}

#[tokio::test]
async fn test_remove_unknown_target() {
    let manager = manager(FakeProbe::new());
    assert!(matches!(
        manager.remove_target("ghost"),
        Err(DbError::UnknownTarget { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let manager = manager(FakeProbe::new());
    register(&manager, target("primary", 1));

    let fake = common::FakeConnector::new("primary");
    let result = manager.register_target_with(target("primary", 4), Connector::Async(fake));
    match result {
        Err(DbError::DuplicateName { target }) => assert_eq!(target, "primary"),
        other => panic!("Expected DuplicateName, got {:?}", other),
    }
    assert_eq!(manager.pool_stats("primary").unwrap().max_size, 1);
}

#[tokio::test]
async fn test_invalid_target_rejected() {
    let manager = manager(FakeProbe::new());
    let fake = common::FakeConnector::new("primary");
    let result = manager.register_target_with(
        target("primary", 2).with_pool_size(5, 2),
        Connector::Async(fake),
    );
    assert!(matches!(result, Err(DbError::InvalidConfig { .. })));
    assert_eq!(manager.target_count(), 0);
}

#[tokio::test]
async fn test_targets_are_isolated() {
    let manager = manager(FakeProbe::new());
    let bad = register(&manager, target("reports", 1));
    register(&manager, target("primary", 1));
    bad.set_failing(true);

    assert!(manager.acquire("reports", Duration::from_millis(50)).await.is_err());
    assert!(manager.acquire("reports", Duration::from_millis(50)).await.is_err());

    let session = manager.acquire("primary", Duration::from_millis(50)).await;
    assert!(session.is_ok());
    assert_eq!(manager.health("primary").unwrap().consecutive_failures, 0);
    assert_eq!(manager.target_names(), vec!["primary", "reports"]);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_final() {
    let manager = manager(FakeProbe::new());
    let fake = register(&manager, target("primary", 2));

    let mut leased = manager
        .acquire("primary", Duration::from_millis(100))
        .await
        .unwrap();

    manager.shutdown().await;
    manager.shutdown().await;
    assert!(manager.is_closed());
    assert_eq!(manager.target_count(), 0);

    assert!(matches!(
        manager.acquire("primary", Duration::from_millis(10)).await,
        Err(DbError::Closed { .. })
    ));
    let late = common::FakeConnector::new("late");
    assert!(matches!(
        manager.register_target_with(target("late", 1), Connector::Async(late)),
        Err(DbError::Closed { .. })
    ));
    assert!(manager.run_health_loop(Duration::from_millis(10)).is_err());

    // Sessions leased before shutdown can still be returned
    manager.release(&mut leased).unwrap();
    assert_eq!(fake.live(), 0);
}

#[tokio::test]
async fn test_health_loop_starts_once_and_stops_on_shutdown() {
    let manager = manager(FakeProbe::new());
    register(&manager, target("primary", 1));

    assert!(manager.run_health_loop(Duration::from_millis(20)).unwrap());
    assert!(!manager.run_health_loop(Duration::from_millis(20)).unwrap());
    assert!(manager.health_loop_running());

    manager.shutdown().await;
    assert!(!manager.health_loop_running());
}

#[test]
fn test_health_loop_needs_runtime() {
    let manager = manager(FakeProbe::new());
    match manager.run_health_loop(Duration::from_millis(20)) {
        Err(DbError::Internal { .. }) => {}
        other => panic!("Expected Internal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_manager_ends_health_loop() {
    let probe = FakeProbe::new();
    let manager = manager(Arc::clone(&probe));
    register(&manager, target("primary", 1));
    manager.run_health_loop(Duration::from_millis(10)).unwrap();

    let weak = Arc::downgrade(&manager);
    drop(manager);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(weak.upgrade().is_none());
    let checks = probe.checks_of("primary");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.checks_of("primary"), checks);
}

#[test]
fn test_blocking_target_lifecycle_on_plain_threads() {
    let manager = manager(FakeProbe::new());
    let fake = register(&manager, blocking_target("batch", 2));

    let worker = {
        let manager: Arc<ConnectionManager> = Arc::clone(&manager);
        std::thread::spawn(move || {
            let mut session = manager.acquire_blocking("batch", Duration::from_secs(1))?;
            std::thread::sleep(Duration::from_millis(20));
            manager.release(&mut session)
        })
    };
    worker.join().unwrap().unwrap();
    assert_eq!(manager.pool_stats("batch").unwrap().idle, 1);

    manager.remove_target("batch").unwrap();
    assert_eq!(fake.live(), 0);

    tokio_test::block_on(manager.shutdown());
    assert!(manager.is_closed());
}
