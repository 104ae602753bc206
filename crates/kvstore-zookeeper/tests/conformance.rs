//! ZooKeeper backend conformance tests
//!
//! Runs the shared suite against the in-process reference server.

use std::time::Duration;

use bytes::Bytes;
use kvstore_common::{Config, Context, LockOptions, Store, StoreError};
use kvstore_zookeeper::{MemoryZk, ZkError, ZookeeperStore};
use kvstore_testutils as testutils;

const SERVERS: &[&str] = &["localhost:2181"];

fn servers() -> Vec<String> {
    SERVERS.iter().map(|s| s.to_string()).collect()
}

async fn make_store(server: &MemoryZk) -> ZookeeperStore {
    let config = Config::default().with_connection_timeout(Duration::from_secs(3));
    ZookeeperStore::connect(server, &servers(), Some(&config))
        .await
        .expect("cannot create store")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_common() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_common(&kv).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_atomic() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_atomic(&kv).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_watch() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_watch(&kv).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_lock() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let other = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_lock(&kv).await;
    testutils::run_test_lock_ttl(&kv, &other).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_ttl() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let ttl_kv = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_ttl(&kv, &ttl_kv).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zk_txn() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;

    testutils::run_cleanup(&kv).await;
    testutils::run_test_txn(&kv).await;
}

#[tokio::test]
async fn test_watch_fails_when_server_closes_stream() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let ctx = Context::background();

    let mut rx = kv.watch_tree(&ctx, "/fail", None).await.unwrap();
    kv.put(&ctx, "/fail/a", Bytes::from_static(b"1"), None).await.unwrap();
    testutils::next_event(&mut rx).await;

    // Events already queued are still delivered before the failure.
    server.close_watches();
    loop {
        match rx.recv().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                assert!(matches!(e, StoreError::WatchFail));
                break;
            }
            None => panic!("watch closed without a terminal error"),
        }
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_session_expiry_fails_watch() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let ctx = Context::background();

    let mut rx = kv.watch(&ctx, "/expire", None).await.unwrap();
    server.expire_session(kv.client().session_id());
    assert!(matches!(rx.recv().await, Some(Err(StoreError::WatchFail))));
}

#[tokio::test]
async fn test_expired_lock_session_frees_lock() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let ctx = Context::background();
    let opts = LockOptions {
        ttl: Duration::from_secs(30),
        value: None,
    };

    let mut holder = kv.new_lock("/locks/expire", Some(&opts));
    holder.lock(&ctx).await.unwrap();
    let (_, stat) = kv.client().get_data(holder.key().unwrap()).await.unwrap();
    server.expire_session(stat.ephemeral_owner);

    let mut next = kv.new_lock("/locks/expire", Some(&opts));
    tokio::time::timeout(testutils::WAIT, next.lock(&ctx))
        .await
        .expect("lock should free once the holder session expires")
        .unwrap();

    // The expired holder can no longer release.
    let err = holder.unlock(&ctx).await.unwrap_err();
    assert_eq!(err.downcast_backend::<ZkError>(), Some(&ZkError::SessionExpired));
    next.unlock(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_connect_requires_digest() {
    let server = MemoryZk::with_digest("user", "secret");

    let err = ZookeeperStore::connect(&server, &servers(), None)
        .await
        .err()
        .expect("connect without credentials should fail");
    assert_eq!(err.downcast_backend::<ZkError>(), Some(&ZkError::AuthFailed));

    let config = Config::default().with_auth("user", "secret");
    let kv = ZookeeperStore::connect(&server, &servers(), Some(&config))
        .await
        .unwrap();
    assert_eq!(kv.backend(), "zk");
}

#[tokio::test]
async fn test_operations_honour_cancelled_context() {
    let server = MemoryZk::new();
    let kv = make_store(&server).await;
    let ctx = Context::background();
    ctx.cancel();

    let err = kv.get(&ctx, "/any").await.unwrap_err();
    assert!(matches!(err, StoreError::Cancelled));
}
