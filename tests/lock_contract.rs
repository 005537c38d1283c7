//! Contract paths that must resolve before any backend round-trip:
//! validation, closed factories, and constructor input checks. The Redis
//! clients below point at a closed local port, so any accidental network
//! dependence fails loudly rather than silently passing.

use dislock::{AcquireOptions, Error, EtcdLockFactory, EtcdOptions, LockFactory, RedisLockFactory};
use std::time::Duration;

fn unreachable_client() -> redis::Client {
    redis::Client::open("redis://127.0.0.1:1/").expect("url parses")
}

fn factory() -> RedisLockFactory {
    RedisLockFactory::new(vec![unreachable_client()]).expect("non-empty client list")
}

#[tokio::test]
async fn empty_client_list_is_rejected_at_construction() {
    assert!(matches!(RedisLockFactory::new(Vec::new()), Err(Error::NoClients)));
}

#[tokio::test]
async fn empty_endpoint_list_is_rejected_before_connecting() {
    let err = EtcdLockFactory::connect(&[], EtcdOptions::new()).await.err();
    assert!(matches!(err, Some(Error::NoEndpoints)));
}

#[tokio::test]
async fn key_validation_runs_before_any_io() {
    let factory = factory();
    let opts = AcquireOptions::default();

    let err = factory.try_lock("", &opts).await.err().expect("empty key rejected");
    assert!(matches!(err, Error::EmptyKey));

    let err = factory.try_lock("  \t ", &opts).await.err().expect("whitespace key rejected");
    assert!(matches!(err, Error::EmptyKey));

    let long = "k".repeat(513);
    let err = factory.lock(&long, &opts).await.err().expect("oversized key rejected");
    assert!(matches!(err, Error::KeyTooLong { len: 513 }));
}

#[tokio::test]
async fn key_at_the_limit_reaches_the_backend() {
    let factory = factory();
    let at_limit = "k".repeat(512);
    let opts = AcquireOptions::new().with_tries(1).with_expiry(Duration::from_millis(100));

    // Validation passes, so the unreachable node surfaces as transport.
    let err = factory.try_lock(&at_limit, &opts).await.err().expect("transport failure");
    assert!(err.is_transport(), "expected transport error, got {err:?}");
}

#[tokio::test]
async fn closed_factory_refuses_new_work_without_io() {
    let factory = factory();
    factory.close().await.expect("close succeeds");

    let opts = AcquireOptions::default();
    assert!(matches!(
        factory.try_lock("jobs/a", &opts).await.err(),
        Some(Error::FactoryClosed)
    ));
    assert!(matches!(
        factory.lock("jobs/a", &opts).await.err(),
        Some(Error::FactoryClosed)
    ));
    assert!(matches!(factory.health().await.err(), Some(Error::FactoryClosed)));
}

#[tokio::test]
async fn close_is_idempotent() {
    let factory = factory();
    factory.close().await.expect("first close");
    factory.close().await.expect("second close");
}

#[tokio::test]
async fn blocking_lock_exhausts_tries_against_a_dead_node() {
    let factory = factory();
    let opts = AcquireOptions::new()
        .with_tries(2)
        .with_retry_delay(Duration::from_millis(1))
        .with_expiry(Duration::from_millis(100));

    let err = factory.lock("jobs/a", &opts).await.err().expect("exhaustion");
    assert!(matches!(err, Error::LockFailed { attempts: 2 }));
}

#[tokio::test]
async fn try_lock_propagates_transport_failures() {
    let factory = factory();
    let opts = AcquireOptions::new().with_expiry(Duration::from_millis(100));

    let err = factory.try_lock("jobs/a", &opts).await.err().expect("transport failure");
    assert!(err.is_transport(), "expected transport error, got {err:?}");
}

#[tokio::test]
async fn redlock_escape_hatch_exposes_the_driver() {
    let factory = RedisLockFactory::new(vec![
        unreachable_client(),
        unreachable_client(),
        unreachable_client(),
    ])
    .expect("three clients");
    assert_eq!(factory.redlock().quorum(), 2);
    assert_eq!(factory.redlock().clients().len(), 3);
}
