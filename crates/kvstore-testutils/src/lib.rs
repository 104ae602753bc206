//! kvstore Test Utilities - Backend conformance suite
//!
//! Every backend runs the same checks against its own server:
//!
//! | Function            | Covers                                                    |
//! |---------------------|-----------------------------------------------------------|
//! | `run_cleanup`       | removes everything the suite writes                       |
//! | `run_test_common`   | CRUD, create / update, list / delete_tree and their scope |
//! | `run_test_atomic`   | atomic_put / atomic_delete, concurrent CAS                |
//! | `run_test_watch`    | watch / watch_tree events, no extras, cancellation        |
//! | `run_test_lock`     | mutual exclusion, unlock, cancellation                    |
//! | `run_test_lock_ttl` | lock released by session expiry                           |
//! | `run_test_ttl`      | TTL keys expire, TTL rewrites keep the version            |
//! | `run_test_txn`      | branches are all-or-nothing and write nothing else        |
//!
//! All keys live under [`ROOT`].

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvstore_common::{
    Compare, Context, KVPair, LockOptions, Store, StoreError, TxnOp, TxnOpResponse, WatchAction,
    WatchReceiver, WriteOptions,
};

/// Prefix under which the suite writes
pub const ROOT: &str = "/kvstore-test";

/// Upper bound for any single wait in the suite
pub const WAIT: Duration = Duration::from_secs(10);

/// How long a watch must stay silent to count as idle
pub const QUIET: Duration = Duration::from_millis(300);

static TRACING: Once = Once::new();

/// Install a fmt subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn key(path: &str) -> String {
    format!("{}/{}", ROOT, path)
}

fn value(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Next event on `rx`, failing the test on errors or closure.
pub async fn next_event(rx: &mut WatchReceiver) -> kvstore_common::WatchEvent {
    match within("watch event", rx.recv()).await {
        Some(Ok(event)) => event,
        Some(Err(e)) => panic!("watch delivered error: {}", e),
        None => panic!("watch closed unexpectedly"),
    }
}

/// Fail the test if `rx` delivers anything within [`QUIET`].
pub async fn assert_no_event(rx: &mut WatchReceiver) {
    if let Ok(Some(delivered)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected watch delivery {:?}", delivered);
    }
}

/// Poll `check` until it returns true or [`WAIT`] passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    within(what, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
}

// ============================================================================
// Cleanup
// ============================================================================

pub async fn run_cleanup(kv: &dyn Store) {
    init_tracing();
    let ctx = Context::background();
    match kv.delete_tree(&ctx, ROOT).await {
        Ok(()) | Err(StoreError::KeyNotFound) => {}
        Err(e) => panic!("cleanup of {} failed: {}", ROOT, e),
    }
    info!("Cleaned up {} on {}", ROOT, kv.backend());
}

// ============================================================================
// Common operations
// ============================================================================

pub async fn run_test_common(kv: &dyn Store) {
    init_tracing();
    test_put_get_delete_exists(kv).await;
    test_key_normalization(kv).await;
    test_create_and_update(kv).await;
    test_list(kv).await;
    test_list_scope(kv).await;
    test_delete_tree(kv).await;
    test_delete_tree_is_atomic(kv).await;
}

async fn test_put_get_delete_exists(kv: &dyn Store) {
    let ctx = Context::background();
    for path in ["common/foo", "common/foo/", "common/foo/bar"] {
        let k = key(path);
        let v = value("hello");

        kv.put(&ctx, &k, v.clone(), None).await.unwrap();

        let pair = kv.get(&ctx, &k).await.unwrap();
        assert_eq!(pair.value, v);
        assert_ne!(pair.index, 0);
        assert!(pair.version >= 1);
        assert!(kv.exists(&ctx, &k).await.unwrap());

        kv.delete(&ctx, &k).await.unwrap();
        assert!(matches!(kv.get(&ctx, &k).await, Err(StoreError::KeyNotFound)));
        assert!(!kv.exists(&ctx, &k).await.unwrap());

        // Deleting again is not an error.
        kv.delete(&ctx, &k).await.unwrap();
    }
}

async fn test_key_normalization(kv: &dyn Store) {
    let ctx = Context::background();
    let raw = format!("{}//common//norm/", ROOT.trim_start_matches('/'));
    kv.put(&ctx, &raw, value("n"), None).await.unwrap();

    let pair = kv.get(&ctx, &key("common/norm")).await.unwrap();
    assert_eq!(pair.key, key("common/norm"));
    assert_eq!(pair.value, value("n"));

    kv.delete(&ctx, &raw).await.unwrap();
    assert!(!kv.exists(&ctx, &key("common/norm")).await.unwrap());
}

async fn test_create_and_update(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("common/create");

    let err = kv.update(&ctx, &k, value("u"), None).await.unwrap_err();
    assert!(matches!(err, StoreError::KeyNotFound));
    assert!(!kv.exists(&ctx, &k).await.unwrap());

    kv.create(&ctx, &k, value("v1"), None).await.unwrap();
    let err = kv.create(&ctx, &k, value("v2"), None).await.unwrap_err();
    assert!(matches!(err, StoreError::KeyExists));
    assert_eq!(kv.get(&ctx, &k).await.unwrap().value, value("v1"));

    let before = kv.get(&ctx, &k).await.unwrap();
    kv.update(&ctx, &k, value("v3"), None).await.unwrap();
    let after = kv.get(&ctx, &k).await.unwrap();
    assert_eq!(after.value, value("v3"));
    assert_eq!(after.version, before.version + 1);
    assert!(after.index > before.index);

    kv.delete(&ctx, &k).await.unwrap();
}

async fn test_list(kv: &dyn Store) {
    let ctx = Context::background();
    let dir = key("common/list");
    let first = format!("{}/first", dir);
    let second = format!("{}/second", dir);

    kv.put(&ctx, &first, value("1"), None).await.unwrap();
    kv.put(&ctx, &second, value("2"), None).await.unwrap();

    let pairs = kv.list(&ctx, &dir).await.unwrap();
    let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec![first.as_str(), second.as_str()]);
    assert_eq!(pairs[0].value, value("1"));
    assert_eq!(pairs[1].value, value("2"));

    // Trailing separators address the same directory.
    assert_eq!(kv.list(&ctx, &format!("{}/", dir)).await.unwrap().len(), 2);

    let err = kv.list(&ctx, &key("common/nothing-here")).await.unwrap_err();
    assert!(matches!(err, StoreError::KeyNotFound));

    kv.delete_tree(&ctx, &dir).await.unwrap();
}

/// A directory lists its descendants, including empty values, but neither
/// itself nor siblings sharing its name as a prefix.
async fn test_list_scope(kv: &dyn Store) {
    let ctx = Context::background();
    let dir = key("common/scope");
    let empty = format!("{}/empty", dir);
    let full = format!("{}/full", dir);
    let sibling = format!("{}-sibling", dir);

    kv.put(&ctx, &dir, value("dir"), None).await.unwrap();
    kv.put(&ctx, &empty, Bytes::new(), None).await.unwrap();
    kv.put(&ctx, &full, value("1"), None).await.unwrap();
    kv.put(&ctx, &sibling, value("s"), None).await.unwrap();

    let pairs = kv.list(&ctx, &dir).await.unwrap();
    let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec![empty.as_str(), full.as_str()]);
    assert!(pairs[0].value.is_empty());

    kv.delete_tree(&ctx, &dir).await.unwrap();
    for gone in [&dir, &empty, &full] {
        assert!(!kv.exists(&ctx, gone).await.unwrap(), "{} survived", gone);
    }
    assert_eq!(kv.get(&ctx, &sibling).await.unwrap().value, value("s"));

    kv.delete(&ctx, &sibling).await.unwrap();
}

async fn test_delete_tree(kv: &dyn Store) {
    let ctx = Context::background();
    let dir = key("common/tree");
    let children = [
        format!("{}/a", dir),
        format!("{}/b", dir),
        format!("{}/sub/c", dir),
    ];
    for child in &children {
        kv.put(&ctx, child, value("x"), None).await.unwrap();
    }

    kv.delete_tree(&ctx, &dir).await.unwrap();
    for child in &children {
        assert!(matches!(kv.get(&ctx, child).await, Err(StoreError::KeyNotFound)));
    }
    assert!(matches!(kv.list(&ctx, &dir).await, Err(StoreError::KeyNotFound)));
}

async fn test_delete_tree_is_atomic(kv: &dyn Store) {
    let ctx = Context::background();
    let dir = key("common/atomic-tree");
    let count = 8;
    for i in 0..count {
        kv.put(&ctx, &format!("{}/{}", dir, i), value("x"), None)
            .await
            .unwrap();
    }

    let listers = join_all((0..16).map(|_| kv.list(&ctx, &dir)));
    let (_, lists) = tokio::join!(kv.delete_tree(&ctx, &dir), listers);

    for listed in lists {
        match listed {
            Ok(pairs) => assert_eq!(pairs.len(), count, "observed a partial delete"),
            Err(StoreError::KeyNotFound) => {}
            Err(e) => panic!("list failed: {}", e),
        }
    }
}

// ============================================================================
// Atomic operations
// ============================================================================

pub async fn run_test_atomic(kv: &dyn Store) {
    init_tracing();
    test_atomic_put(kv).await;
    test_atomic_put_create(kv).await;
    test_atomic_delete(kv).await;
    test_concurrent_atomic_put(kv).await;
}

async fn test_atomic_put(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("atomic/put");

    kv.put(&ctx, &k, value("v1"), None).await.unwrap();
    let original = kv.get(&ctx, &k).await.unwrap();

    let updated = kv
        .atomic_put(&ctx, &k, value("v2"), Some(&original), None)
        .await
        .unwrap();
    assert_eq!(updated.value, value("v2"));
    assert!(updated.index > original.index);
    assert_eq!(kv.get(&ctx, &k).await.unwrap(), updated);

    // The original baseline is stale now.
    let err = kv
        .atomic_put(&ctx, &k, value("v3"), Some(&original), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::KeyModified));
    assert_eq!(kv.get(&ctx, &k).await.unwrap().value, value("v2"));

    kv.delete(&ctx, &k).await.unwrap();
}

async fn test_atomic_put_create(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("atomic/create");

    let created = kv
        .atomic_put(&ctx, &k, value("first"), None, None)
        .await
        .unwrap();
    assert_eq!(created.value, value("first"));
    assert_eq!(created.version, 1);

    let err = kv
        .atomic_put(&ctx, &k, value("second"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::KeyExists));
    assert_eq!(kv.get(&ctx, &k).await.unwrap().value, value("first"));

    kv.delete(&ctx, &k).await.unwrap();
}

async fn test_atomic_delete(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("atomic/delete");

    kv.put(&ctx, &k, value("v1"), None).await.unwrap();
    let original = kv.get(&ctx, &k).await.unwrap();

    let err = kv.atomic_delete(&ctx, &k, None).await.unwrap_err();
    assert!(matches!(err, StoreError::PreviousNotSpecified));

    kv.put(&ctx, &k, value("v2"), None).await.unwrap();
    let err = kv.atomic_delete(&ctx, &k, Some(&original)).await.unwrap_err();
    assert!(matches!(err, StoreError::KeyModified));
    assert!(kv.exists(&ctx, &k).await.unwrap());

    let current = kv.get(&ctx, &k).await.unwrap();
    kv.atomic_delete(&ctx, &k, Some(&current)).await.unwrap();
    assert!(!kv.exists(&ctx, &k).await.unwrap());
}

async fn test_concurrent_atomic_put(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("atomic/race");

    kv.put(&ctx, &k, value("base"), None).await.unwrap();
    let baseline = kv.get(&ctx, &k).await.unwrap();

    let contenders = (0..8).map(|i| {
        let v = value(&format!("contender-{}", i));
        let (ctx, k, baseline) = (&ctx, &k, &baseline);
        async move { kv.atomic_put(ctx, k, v, Some(baseline), None).await }
    });
    let results = join_all(contenders).await;

    let winners: Vec<KVPair> = results
        .into_iter()
        .filter_map(|res| match res {
            Ok(pair) => Some(pair),
            Err(StoreError::KeyModified) => None,
            Err(e) => panic!("unexpected CAS error: {}", e),
        })
        .collect();
    assert_eq!(winners.len(), 1, "exactly one CAS must win");
    assert_eq!(kv.get(&ctx, &k).await.unwrap().value, winners[0].value);

    kv.delete(&ctx, &k).await.unwrap();
}

// ============================================================================
// Watch
// ============================================================================

pub async fn run_test_watch(kv: &dyn Store) {
    init_tracing();
    test_watch(kv).await;
    test_watch_tree(kv).await;
    test_watch_cancel(kv).await;
}

async fn test_watch(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("watch/key");
    kv.put(&ctx, &k, value("initial"), None).await.unwrap();

    let mut rx = kv.watch(&ctx, &k, None).await.unwrap();

    for i in 0..3 {
        let v = value(&format!("update-{}", i));
        kv.put(&ctx, &k, v.clone(), None).await.unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.action, WatchAction::Put);
        let node = event.node.unwrap();
        assert_eq!(node.key, k);
        assert_eq!(node.value, v);
    }
    assert_no_event(&mut rx).await;

    kv.delete(&ctx, &k).await.unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event.action, WatchAction::Delete);
    assert_eq!(event.key(), Some(k.as_str()));
    assert_no_event(&mut rx).await;

    ctx.cancel();
}

async fn test_watch_tree(kv: &dyn Store) {
    let ctx = Context::background();
    let dir = key("watch/tree");
    let first = format!("{}/first", dir);
    let second = format!("{}/second", dir);
    let sibling = format!("{}-sibling", dir);
    kv.put(&ctx, &first, value("0"), None).await.unwrap();

    let mut rx = kv.watch_tree(&ctx, &dir, None).await.unwrap();

    // Outside the tree despite the shared prefix.
    kv.put(&ctx, &sibling, value("s"), None).await.unwrap();
    kv.put(&ctx, &second, value("1"), None).await.unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event.action, WatchAction::Put);
    assert_eq!(event.key(), Some(second.as_str()));
    assert_eq!(event.node.unwrap().value, value("1"));

    kv.put(&ctx, &first, value("2"), None).await.unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event.key(), Some(first.as_str()));
    assert_eq!(event.node.unwrap().value, value("2"));

    kv.delete(&ctx, &first).await.unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(event.action, WatchAction::Delete);
    assert_eq!(event.key(), Some(first.as_str()));

    ctx.cancel();
    let ctx = Context::background();
    kv.delete_tree(&ctx, &dir).await.unwrap();
    kv.delete(&ctx, &sibling).await.unwrap();
}

async fn test_watch_cancel(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("watch/cancel");
    kv.put(&ctx, &k, value("v"), None).await.unwrap();

    let watch_ctx = ctx.child();
    let mut rx = kv.watch(&watch_ctx, &k, None).await.unwrap();
    watch_ctx.cancel();

    // Cancellation closes the channel without a terminal error.
    loop {
        match within("watch close", rx.recv()).await {
            None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("cancelled watch delivered error: {}", e),
        }
    }

    kv.delete(&ctx, &k).await.unwrap();
}

// ============================================================================
// Locks
// ============================================================================

pub async fn run_test_lock(kv: &dyn Store) {
    init_tracing();
    let ctx = Context::background();
    let k = key("lock/mutex");
    let opts = LockOptions {
        ttl: Duration::from_secs(5),
        value: Some(value("holder")),
    };

    let mut holder = kv.new_lock(&k, Some(&opts));
    let mut contender = kv.new_lock(&k, Some(&opts));
    assert!(!holder.is_held());

    holder.lock(&ctx).await.unwrap();
    assert!(holder.is_held());
    assert!(holder.key().unwrap().starts_with(&k));

    // Blocked while held.
    let short = Context::with_timeout(Duration::from_millis(300));
    let err = contender.lock(&short).await.unwrap_err();
    assert!(err.is_context_error(), "expected timeout, got {}", err);
    assert!(!contender.is_held());

    // Released by unlock.
    let (acquired, released) = tokio::join!(
        within("contender lock", contender.lock(&ctx)),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            holder.unlock(&ctx).await
        },
    );
    released.unwrap();
    acquired.unwrap();
    assert!(contender.is_held());
    assert!(!holder.is_held());

    contender.unlock(&ctx).await.unwrap();
    let err = contender.unlock(&ctx).await.unwrap_err();
    assert!(matches!(err, StoreError::LockNotHeld));

    // Free again.
    within("relock", holder.lock(&ctx)).await.unwrap();
    holder.unlock(&ctx).await.unwrap();
}

/// A holder that disappears without unlocking releases the lock once its
/// session expires.
pub async fn run_test_lock_ttl(kv: &dyn Store, other: &dyn Store) {
    init_tracing();
    let ctx = Context::background();
    let k = key("lock/ttl");
    let opts = LockOptions {
        ttl: Duration::from_secs(2),
        value: None,
    };

    let mut crashed = kv.new_lock(&k, Some(&opts));
    crashed.lock(&ctx).await.unwrap();

    let mut next = other.new_lock(&k, Some(&opts));
    let short = Context::with_timeout(Duration::from_millis(300));
    assert!(next.lock(&short).await.unwrap_err().is_context_error());

    drop(crashed);

    within("lock after session expiry", next.lock(&ctx))
        .await
        .unwrap();
    assert!(next.is_held());
    next.unlock(&ctx).await.unwrap();
}

// ============================================================================
// TTL
// ============================================================================

pub async fn run_test_ttl(kv: &dyn Store, other: &dyn Store) {
    init_tracing();
    let ctx = Context::background();
    let k = key("ttl/expiring");
    let opts = WriteOptions::with_ttl(Duration::from_secs(1));

    kv.put(&ctx, &k, value("soon gone"), Some(&opts)).await.unwrap();
    let pair = other.get(&ctx, &k).await.unwrap();
    assert_eq!(pair.value, value("soon gone"));

    let (ctx_ref, k_ref) = (&ctx, k.as_str());
    eventually("TTL expiry", move || async move {
        matches!(other.get(ctx_ref, k_ref).await, Err(StoreError::KeyNotFound))
    })
    .await;

    test_ttl_rewrite_keeps_version(kv).await;

    // A key written without a TTL stays.
    let lasting = key("ttl/lasting");
    kv.put(&ctx, &lasting, value("stays"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(other.exists(&ctx, &lasting).await.unwrap());
    kv.delete(&ctx, &lasting).await.unwrap();
}

/// Rewriting an existing key with a TTL is an ordinary update.
async fn test_ttl_rewrite_keeps_version(kv: &dyn Store) {
    let ctx = Context::background();
    let k = key("ttl/rewrite");
    let opts = WriteOptions::with_ttl(Duration::from_secs(30));

    kv.put(&ctx, &k, value("1"), None).await.unwrap();
    kv.put(&ctx, &k, value("2"), None).await.unwrap();

    let watch_ctx = ctx.child();
    let mut rx = kv.watch(&watch_ctx, &k, None).await.unwrap();
    kv.put(&ctx, &k, value("3"), Some(&opts)).await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.action, WatchAction::Put);
    let node = event.node.unwrap();
    assert_eq!(node.value, value("3"));
    assert_eq!(node.version, 3);
    assert_eq!(kv.get(&ctx, &k).await.unwrap().version, 3);

    watch_ctx.cancel();
    kv.delete(&ctx, &k).await.unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

pub async fn run_test_txn(kv: &dyn Store) {
    init_tracing();
    let ctx = Context::background();
    let a = key("txn/a");
    let b = key("txn/b");
    let c = key("txn/c");

    kv.put(&ctx, &a, value("1"), None).await.unwrap();
    kv.put(&ctx, &b, value("2"), None).await.unwrap();

    let resp = kv
        .new_txn(&ctx)
        .await
        .unwrap()
        .when([Compare::value(a.as_str(), "1"), Compare::exists(b.as_str())])
        .and_then([TxnOp::put(a.as_str(), "10"), TxnOp::delete(b.as_str())])
        .or_else([TxnOp::put(c.as_str(), "else")])
        .commit()
        .await
        .unwrap();
    assert!(resp.succeeded);
    assert_eq!(kv.get(&ctx, &a).await.unwrap().value, value("10"));
    assert!(!kv.exists(&ctx, &b).await.unwrap());
    assert!(!kv.exists(&ctx, &c).await.unwrap());

    // A failing compare applies nothing from the success branch.
    let before = kv.get(&ctx, &a).await.unwrap();
    let resp = kv
        .new_txn(&ctx)
        .await
        .unwrap()
        .when([
            Compare::exists(a.as_str()),
            Compare::value(a.as_str(), "not-the-value"),
        ])
        .and_then([
            TxnOp::put(a.as_str(), "20"),
            TxnOp::put(b.as_str(), "20"),
            TxnOp::delete(a.as_str()),
        ])
        .or_else([TxnOp::get(a.as_str())])
        .commit()
        .await
        .unwrap();
    assert!(!resp.succeeded);
    match &resp.responses[..] {
        [TxnOpResponse::Get(Some(pair))] => assert_eq!(pair.value, value("10")),
        other => panic!("unexpected failure branch responses {:?}", other),
    }
    assert_eq!(kv.get(&ctx, &a).await.unwrap(), before);
    assert!(!kv.exists(&ctx, &b).await.unwrap());

    // Create-if-missing plus a tree delete.
    let resp = kv
        .new_txn(&ctx)
        .await
        .unwrap()
        .when([Compare::missing(c.as_str())])
        .and_then([
            TxnOp::put(c.as_str(), "created"),
            TxnOp::delete_tree(key("txn/a")),
        ])
        .commit()
        .await
        .unwrap();
    assert!(resp.succeeded);
    assert_eq!(kv.get(&ctx, &c).await.unwrap().value, value("created"));
    assert!(!kv.exists(&ctx, &a).await.unwrap());

    kv.delete(&ctx, &c).await.unwrap();

    test_txn_untaken_branch_writes_nothing(kv).await;
    test_txn_absence_check_is_silent(kv).await;
}

/// Parents of a key written only by the untaken branch are not created.
async fn test_txn_untaken_branch_writes_nothing(kv: &dyn Store) {
    let ctx = Context::background();
    let deep = key("txn/q/deep/k");

    let resp = kv
        .new_txn(&ctx)
        .await
        .unwrap()
        .when([Compare::value(deep.as_str(), "expected")])
        .and_then([TxnOp::put(deep.as_str(), "v")])
        .commit()
        .await
        .unwrap();
    assert!(!resp.succeeded);
    assert!(!kv.exists(&ctx, &deep).await.unwrap());
    assert!(!kv.exists(&ctx, &key("txn/q")).await.unwrap());
    assert!(!kv.exists(&ctx, &key("txn/q/deep")).await.unwrap());
}

/// Comparing on an absent key produces no watch events for it.
async fn test_txn_absence_check_is_silent(kv: &dyn Store) {
    let ctx = Context::background();
    let ghost = key("txn/ghost");
    let other = key("txn/other");

    let watch_ctx = ctx.child();
    let mut ghost_rx = kv.watch(&watch_ctx, &ghost, None).await.unwrap();
    let mut tree_rx = kv.watch_tree(&watch_ctx, &key("txn"), None).await.unwrap();

    let resp = kv
        .new_txn(&ctx)
        .await
        .unwrap()
        .when([Compare::missing(ghost.as_str())])
        .and_then([TxnOp::put(other.as_str(), "o")])
        .commit()
        .await
        .unwrap();
    assert!(resp.succeeded);

    let event = next_event(&mut tree_rx).await;
    assert_eq!(event.action, WatchAction::Put);
    assert_eq!(event.key(), Some(other.as_str()));
    assert_no_event(&mut tree_rx).await;
    assert_no_event(&mut ghost_rx).await;
    assert!(!kv.exists(&ctx, &ghost).await.unwrap());

    watch_ctx.cancel();
    kv.delete(&ctx, &other).await.unwrap();
}
