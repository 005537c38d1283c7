//! End-to-end behavior against a live etcd. If DISLOCK_TEST_ETCD_ENDPOINT
//! is unset, every test skips (e.g. http://127.0.0.1:2379).

use dislock::{
    watch_with_retry, AcquireOptions, Error, EtcdLockFactory, EtcdOptions, LockFactory,
    LockHandle, RetryConfig, WatchEventType, WatchOptions,
};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn test_client() -> Option<etcd_client::Client> {
    let Some(endpoint) = std::env::var("DISLOCK_TEST_ETCD_ENDPOINT").ok() else {
        eprintln!("skipping: set DISLOCK_TEST_ETCD_ENDPOINT (e.g. http://127.0.0.1:2379)");
        return None;
    };
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let client = etcd_client::Client::connect([endpoint.as_str()], None)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to etcd at '{endpoint}': {e}"));
    Some(client)
}

async fn test_factory() -> Option<EtcdLockFactory> {
    let client = test_client().await?;
    Some(
        EtcdLockFactory::new(client, EtcdOptions::new().with_session_ttl(10))
            .await
            .expect("factory over live client"),
    )
}

fn unique_key(tag: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
    format!("{tag}/{nanos:x}")
}

#[tokio::test]
async fn same_factory_acquisition_is_not_reentrant() {
    let Some(factory) = test_factory().await else { return };
    let key = unique_key("reentrancy");
    let opts = AcquireOptions::default();

    let handle = factory.try_lock(&key, &opts).await.expect("acquire").expect("free key");

    // Second acquisition through the same session would share the lease;
    // both entry points refuse it locally.
    let second = factory.try_lock(&key, &opts).await.expect("no error");
    assert!(second.is_none());
    let err = factory.lock(&key, &opts).await.err().expect("blocking refuses too");
    assert!(matches!(err, Error::LockFailed { .. }));

    handle.unlock().await.expect("release");

    let reacquired = factory.try_lock(&key, &opts).await.expect("acquire after release");
    assert!(reacquired.is_some());
    reacquired.expect("handle").unlock().await.expect("cleanup");
    factory.close().await.expect("close");
}

#[tokio::test]
async fn two_factories_contend_on_one_key() {
    let (Some(f1), Some(f2)) = (test_factory().await, test_factory().await) else { return };
    let key = unique_key("contend");
    let opts = AcquireOptions::default();

    let handle = f1.try_lock(&key, &opts).await.expect("acquire").expect("first wins");
    let blocked = f2.try_lock(&key, &opts).await.expect("no error while held");
    assert!(blocked.is_none());

    handle.unlock().await.expect("release");
    let reacquired = f2.try_lock(&key, &opts).await.expect("acquire after release");
    assert!(reacquired.is_some());
    reacquired.expect("handle").unlock().await.expect("cleanup");

    f1.close().await.expect("close f1");
    f2.close().await.expect("close f2");
}

#[tokio::test]
async fn extend_is_a_session_liveness_check() {
    let Some(factory) = test_factory().await else { return };
    let key = unique_key("extend");

    let handle = factory
        .try_lock(&key, &AcquireOptions::default())
        .await
        .expect("acquire")
        .expect("free key");
    handle.extend().await.expect("session alive");

    handle.unlock().await.expect("release");
    let err = handle.extend().await.err().expect("extend after release fails");
    assert!(matches!(err, Error::NotLocked));

    factory.close().await.expect("close");
}

#[tokio::test]
async fn close_revokes_the_lease_and_releases_held_locks() {
    let Some(factory) = test_factory().await else { return };
    let key = unique_key("close-releases");

    let _held = factory
        .try_lock(&key, &AcquireOptions::default())
        .await
        .expect("acquire")
        .expect("free key");

    factory.close().await.expect("first close");
    factory.close().await.expect("second close is a no-op");
    assert!(matches!(
        factory.try_lock(&key, &AcquireOptions::default()).await.err(),
        Some(Error::FactoryClosed)
    ));

    // Lease revocation released the key cluster-side.
    let Some(other) = test_factory().await else { return };
    let reacquired = other
        .try_lock(&key, &AcquireOptions::default())
        .await
        .expect("acquire after revoke");
    assert!(reacquired.is_some(), "revoked lease released the lock");
    reacquired.expect("handle").unlock().await.expect("cleanup");
    other.close().await.expect("close");
}

#[tokio::test]
async fn blocking_lock_waits_for_the_holder_to_release() {
    let (Some(f1), Some(f2)) = (test_factory().await, test_factory().await) else { return };
    let key = unique_key("blocking");
    let opts = AcquireOptions::default();

    let handle = f1.lock(&key, &opts).await.expect("first acquires immediately");

    let key_for_waiter = key.clone();
    let waiter = tokio::spawn(async move {
        f2.lock(&key_for_waiter, &AcquireOptions::default())
            .await
            .expect("eventually acquires")
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.unlock().await.expect("release");

    let second =
        tokio::time::timeout(Duration::from_secs(5), waiter).await.expect("waiter unblocked");
    second.expect("waiter task").unlock().await.expect("cleanup");
    f1.close().await.expect("close");
}

#[tokio::test]
async fn watch_streams_puts_and_deletes_in_revision_order() {
    let Some(client) = test_client().await else { return };
    let prefix = unique_key("watched");

    let mut events = watch_with_retry(
        client.clone(),
        &prefix,
        RetryConfig::default(),
        WatchOptions::new().with_prefix(),
    )
    .expect("valid watch");
    // Let the watch register server-side before mutating.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut kv = client.clone();
    let key = format!("{prefix}/entry");
    kv.put(key.as_str(), "v1", None).await.expect("put");
    kv.delete(key.as_str(), None).await.expect("delete");

    let put_event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("put arrives")
        .expect("stream open");
    assert_eq!(put_event.event_type, WatchEventType::Put);
    assert_eq!(put_event.key, key);
    assert_eq!(put_event.value.as_deref(), Some(b"v1".as_slice()));

    let delete_event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("delete arrives")
        .expect("stream open");
    assert_eq!(delete_event.event_type, WatchEventType::Delete);
    assert!(delete_event.revision > put_event.revision, "revisions ascend");
}

#[tokio::test]
async fn mutual_exclusion_under_concurrency() {
    if test_client().await.is_none() {
        return;
    }
    let key = unique_key("mutex");
    let in_section = Arc::new(AtomicI32::new(0));
    let mut workers = Vec::new();

    for _ in 0..5 {
        let key = key.clone();
        let in_section = Arc::clone(&in_section);
        workers.push(tokio::spawn(async move {
            let factory = test_factory().await.expect("env checked above");
            for _ in 0..10 {
                let handle =
                    factory.lock(&key, &AcquireOptions::default()).await.expect("acquire");
                let occupants = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(occupants, 1, "two holders inside the critical section");
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
                handle.unlock().await.expect("release");
            }
            factory.close().await.expect("close");
        }));
    }

    for worker in workers {
        worker.await.expect("worker finished cleanly");
    }
    assert_eq!(in_section.load(Ordering::SeqCst), 0);
}
