//! etcd v3 store adapter
//!
//! Every conditional write is a single etcd transaction, so the existence or
//! CAS check and the write are evaluated at one revision by the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use kvstore_common::{
    Config, Context, KVPair, LockOptions, Locker, Result, Store, StoreError, Txn, WatchOptions,
    WatchReceiver, WriteOptions, normalize, spawn_delivery,
};
use kvstore_common::key::tree_prefix;

use crate::client::{
    ClientOptions, Compare, CompareResult, CompareTarget, EtcdClient, EtcdConnector, KeyValue,
    RequestOp, ResponseOp, TxnRequest, WatchRequest,
};
use crate::lock::EtcdLocker;
use crate::txn::EtcdTxnCommitter;
use crate::watch::EtcdWatchSource;

/// Name the etcd v3 backend registers under
pub const BACKEND_NAME: &str = "etcdv3";

pub(crate) fn to_pair(kv: &KeyValue) -> KVPair {
    KVPair {
        key: kv.key.clone(),
        value: kv.value.clone(),
        index: kv.mod_revision as u64,
        version: kv.version as u64,
        lease: kv.lease as u64,
    }
}

/// Lease TTL in whole seconds, rounded up, at least one.
pub(crate) fn lease_ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

/// Deletes of `dir` and every key below it, excluding siblings that only
/// share its byte prefix.
pub(crate) fn tree_delete_ops(dir: &str) -> Vec<RequestOp> {
    vec![
        RequestOp::DeleteRange {
            key: dir.to_string(),
            prefix: false,
        },
        RequestOp::DeleteRange {
            key: tree_prefix(dir),
            prefix: true,
        },
    ]
}

/// Store backed by an etcd v3 cluster
pub struct EtcdStore {
    client: Arc<dyn EtcdClient>,
    committer: Arc<EtcdTxnCommitter>,
}

impl EtcdStore {
    pub fn new(client: Arc<dyn EtcdClient>) -> Self {
        let committer = Arc::new(EtcdTxnCommitter::new(client.clone()));
        Self { client, committer }
    }

    /// Connect to `endpoints`, passing `config` through to the client.
    pub async fn connect(
        connector: &dyn EtcdConnector,
        endpoints: &[String],
        config: Option<&Config>,
    ) -> Result<Self> {
        let options = ClientOptions::from_config(endpoints, config);
        let client = connector.connect(options).await?;
        info!("Connected etcd store to {:?}", endpoints);
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Arc<dyn EtcdClient> {
        &self.client
    }

    /// Grant a lease for the write TTL, 0 for writes that never expire.
    async fn lease_for(&self, opts: Option<&WriteOptions>) -> Result<i64> {
        match WriteOptions::ttl_of(opts) {
            Some(ttl) => Ok(self.client.grant(lease_ttl_secs(ttl)).await?.id),
            None => Ok(0),
        }
    }

    /// Put guarded by the key's create revision compared against zero.
    async fn guarded_put(
        &self,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
        create: CompareResult,
    ) -> Result<bool> {
        let key = normalize(key);
        let lease = self.lease_for(opts).await?;
        let resp = self
            .client
            .txn(TxnRequest {
                compare: vec![Compare::new(&key, CompareTarget::Create(0), create)],
                success: vec![RequestOp::Put { key, value, lease }],
                failure: vec![],
            })
            .await?;
        Ok(resp.succeeded)
    }

    /// Compact history before `revision`. `wait` requests physical
    /// compaction before returning.
    pub async fn compact(&self, ctx: &Context, revision: u64, wait: bool) -> Result<()> {
        ctx.run(async {
            self.client.compact(revision as i64, wait).await?;
            Ok(())
        })
        .await
    }

    async fn watch_key(
        &self,
        ctx: &Context,
        key: &str,
        prefix: bool,
        opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver> {
        let key = normalize(key);
        let start_revision = opts.map_or(0, |o| o.index as i64);
        let stream = ctx
            .run(async {
                Ok(self
                    .client
                    .watch(WatchRequest {
                        key: key.clone(),
                        prefix,
                        start_revision,
                        prev_kv: true,
                    })
                    .await?)
            })
            .await?;

        debug!("Watching '{}' (prefix={}) from revision {}", key, prefix, start_revision);
        let scope = prefix.then(|| key.clone());
        Ok(spawn_delivery(ctx, EtcdWatchSource::new(stream, scope), key))
    }
}

/// Condition values for a CAS against `previous`.
fn cas_compares(key: &str, previous: &KVPair) -> Vec<Compare> {
    let mut compare = vec![Compare::new(
        key,
        CompareTarget::Value(previous.value.clone()),
        CompareResult::Equal,
    )];
    if previous.index != 0 {
        compare.push(Compare::new(
            key,
            CompareTarget::Mod(previous.index as i64),
            CompareResult::Equal,
        ));
    }
    compare
}

#[async_trait]
impl Store for EtcdStore {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<KVPair> {
        ctx.run(async {
            let resp = self.client.range(&normalize(key), false).await?;
            resp.kvs.first().map(to_pair).ok_or(StoreError::KeyNotFound)
        })
        .await
    }

    async fn put(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()> {
        ctx.run(async {
            let lease = self.lease_for(opts).await?;
            self.client.put(&normalize(key), value, lease).await?;
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()> {
        ctx.run(async {
            if self.guarded_put(key, value, opts, CompareResult::Greater).await? {
                Ok(())
            } else {
                Err(StoreError::KeyNotFound)
            }
        })
        .await
    }

    async fn create(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()> {
        ctx.run(async {
            if self.guarded_put(key, value, opts, CompareResult::Equal).await? {
                Ok(())
            } else {
                Err(StoreError::KeyExists)
            }
        })
        .await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        ctx.run(async {
            self.client.delete_range(&normalize(key), false).await?;
            Ok(())
        })
        .await
    }

    async fn watch(
        &self,
        ctx: &Context,
        key: &str,
        opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver> {
        self.watch_key(ctx, key, false, opts).await
    }

    async fn watch_tree(
        &self,
        ctx: &Context,
        dir: &str,
        opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver> {
        self.watch_key(ctx, dir, true, opts).await
    }

    async fn atomic_put(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        previous: Option<&KVPair>,
        opts: Option<&WriteOptions>,
    ) -> Result<KVPair> {
        ctx.run(async {
            let key = normalize(key);
            let compare = match previous {
                None => vec![Compare::new(&key, CompareTarget::Create(0), CompareResult::Equal)],
                Some(previous) => cas_compares(&key, previous),
            };
            let lease = self.lease_for(opts).await?;

            let resp = self
                .client
                .txn(TxnRequest {
                    compare,
                    success: vec![
                        RequestOp::Put {
                            key: key.clone(),
                            value,
                            lease,
                        },
                        RequestOp::Range { key, prefix: false },
                    ],
                    failure: vec![],
                })
                .await?;

            if !resp.succeeded {
                return Err(match previous {
                    None => StoreError::KeyExists,
                    Some(_) => StoreError::KeyModified,
                });
            }

            resp.responses
                .iter()
                .find_map(|op| match op {
                    ResponseOp::Range(range) => range.kvs.first().map(to_pair),
                    _ => None,
                })
                .ok_or(StoreError::KeyNotFound)
        })
        .await
    }

    async fn atomic_delete(
        &self,
        ctx: &Context,
        key: &str,
        previous: Option<&KVPair>,
    ) -> Result<()> {
        let previous = previous.ok_or(StoreError::PreviousNotSpecified)?;
        ctx.run(async {
            let key = normalize(key);
            let resp = self
                .client
                .txn(TxnRequest {
                    compare: cas_compares(&key, previous),
                    success: vec![RequestOp::DeleteRange { key, prefix: false }],
                    failure: vec![],
                })
                .await?;

            if resp.succeeded {
                Ok(())
            } else {
                Err(StoreError::KeyModified)
            }
        })
        .await
    }

    async fn list(&self, ctx: &Context, dir: &str) -> Result<Vec<KVPair>> {
        ctx.run(async {
            let resp = self.client.range(&tree_prefix(&normalize(dir)), true).await?;
            if resp.kvs.is_empty() {
                return Err(StoreError::KeyNotFound);
            }
            let mut pairs: Vec<KVPair> = resp.kvs.iter().map(to_pair).collect();
            pairs.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(pairs)
        })
        .await
    }

    async fn delete_tree(&self, ctx: &Context, dir: &str) -> Result<()> {
        ctx.run(async {
            let resp = self
                .client
                .txn(TxnRequest {
                    compare: vec![],
                    success: tree_delete_ops(&normalize(dir)),
                    failure: vec![],
                })
                .await?;
            let deleted: i64 = resp
                .responses
                .iter()
                .map(|r| match r {
                    ResponseOp::DeleteRange(del) => del.deleted,
                    _ => 0,
                })
                .sum();
            debug!("Deleted {} keys under '{}'", deleted, dir);
            Ok(())
        })
        .await
    }

    fn new_lock(&self, key: &str, opts: Option<&LockOptions>) -> Box<dyn Locker> {
        Box::new(EtcdLocker::new(self.client.clone(), &normalize(key), opts))
    }

    async fn new_txn(&self, ctx: &Context) -> Result<Txn> {
        Ok(Txn::new(ctx, self.committer.clone()))
    }

    async fn close(&self) {
        self.client.close().await;
        info!("Closed etcd store");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEtcd;
    use crate::error::EtcdError;

    fn store() -> (MemoryEtcd, EtcdStore) {
        let server = MemoryEtcd::new();
        let store = EtcdStore::new(server.client());
        (server, store)
    }

    #[test]
    fn test_lease_ttl_rounding() {
        assert_eq!(lease_ttl_secs(Duration::from_millis(1)), 1);
        assert_eq!(lease_ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(lease_ttl_secs(Duration::from_secs(3)), 3);
    }

    #[tokio::test]
    async fn test_pair_carries_revisions() {
        let (_server, store) = store();
        let ctx = Context::background();

        store.put(&ctx, "a/b", Bytes::from_static(b"1"), None).await.unwrap();
        store.put(&ctx, "/a/b/", Bytes::from_static(b"2"), None).await.unwrap();

        let pair = store.get(&ctx, "a/b").await.unwrap();
        assert_eq!(pair.key, "/a/b");
        assert_eq!(pair.index, 2);
        assert_eq!(pair.version, 2);
        assert_eq!(pair.lease, 0);
    }

    #[tokio::test]
    async fn test_put_with_ttl_attaches_lease() {
        let (server, store) = store();
        let ctx = Context::background();
        let opts = WriteOptions::with_ttl(Duration::from_secs(30));

        store.put(&ctx, "ttl", Bytes::from_static(b"v"), Some(&opts)).await.unwrap();
        let pair = store.get(&ctx, "ttl").await.unwrap();
        assert_ne!(pair.lease, 0);
        assert_eq!(server.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_atomic_put_returns_new_pair() {
        let (_server, store) = store();
        let ctx = Context::background();

        let created = store
            .atomic_put(&ctx, "cas", Bytes::from_static(b"1"), None, None)
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let updated = store
            .atomic_put(&ctx, "cas", Bytes::from_static(b"2"), Some(&created), None)
            .await
            .unwrap();
        assert_eq!(updated.value, Bytes::from_static(b"2"));
        assert!(updated.index > created.index);

        // Value matches but the index is stale.
        let mut stale = updated.clone();
        stale.index = created.index;
        let err = store
            .atomic_put(&ctx, "cas", Bytes::from_static(b"3"), Some(&stale), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyModified));

        // Index zero compares the value only.
        let mut loose = updated.clone();
        loose.index = 0;
        store
            .atomic_put(&ctx, "cas", Bytes::from_static(b"3"), Some(&loose), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_compact_passthrough() {
        let (_server, store) = store();
        let ctx = Context::background();
        for v in ["1", "2", "3"] {
            store.put(&ctx, "c", Bytes::from(v), None).await.unwrap();
        }

        store.compact(&ctx, 2, true).await.unwrap();
        let err = store.compact(&ctx, 1, false).await.unwrap_err();
        assert_eq!(err.downcast_backend::<EtcdError>(), Some(&EtcdError::Compacted));
    }

    #[tokio::test]
    async fn test_watch_from_index_replays() {
        let (_server, store) = store();
        let ctx = Context::background();
        store.put(&ctx, "w", Bytes::from_static(b"1"), None).await.unwrap();
        let first = store.get(&ctx, "w").await.unwrap();
        store.put(&ctx, "w", Bytes::from_static(b"2"), None).await.unwrap();

        let mut rx = store
            .watch(&ctx, "w", Some(&WatchOptions { index: first.index + 1 }))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.node.unwrap().value, Bytes::from_static(b"2"));
        assert_eq!(event.pre_node.unwrap().value, Bytes::from_static(b"1"));
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_closed_client_surfaces_native_error() {
        let (_server, store) = store();
        let ctx = Context::background();
        store.close().await;

        let err = store.get(&ctx, "a").await.unwrap_err();
        assert_eq!(err.downcast_backend::<EtcdError>(), Some(&EtcdError::Closed));
    }
}
