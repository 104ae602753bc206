//! ZooKeeper store adapter
//!
//! Keys map one to one onto znode paths. Parent znodes are created on demand
//! as empty persistent nodes; such never-written parents are not listed as
//! keys. Conditional writes use the data version read alongside the node,
//! and tree operations walk the subtree below a directory node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use kvstore_common::key::{directory, join, split_key};
use kvstore_common::{
    Config, Context, KVPair, LockOptions, Locker, Result, Store, StoreError, Txn, WatchOptions,
    WatchReceiver, WriteOptions, normalize, spawn_delivery,
};

use crate::client::{AddWatchMode, ClientOptions, CreateMode, Stat, ZkClient, ZkConnector, ZkOp};
use crate::error::{self, ZkError};
use crate::lock::ZookeeperLocker;
use crate::txn::ZkTxnCommitter;
use crate::watch::ZkWatchSource;

/// Name the ZooKeeper backend registers under
pub const BACKEND_NAME: &str = "zk";

pub(crate) fn to_pair(path: &str, data: Bytes, stat: &Stat) -> KVPair {
    KVPair {
        key: path.to_string(),
        value: data,
        index: stat.mzxid as u64,
        version: stat.version as u64 + 1,
        lease: stat.ephemeral_owner as u64,
    }
}

pub(crate) fn create_mode(ttl: Option<Duration>) -> CreateMode {
    match ttl {
        Some(ttl) => CreateMode::PersistentWithTtl(ttl),
        None => CreateMode::Persistent,
    }
}

/// Create `path` and every missing ancestor as empty persistent nodes.
pub(crate) async fn ensure_path(client: &dyn ZkClient, path: &str) -> error::Result<()> {
    let mut current = String::new();
    for part in split_key(path) {
        current.push('/');
        current.push_str(part);
        match client.create(&current, Bytes::new(), CreateMode::Persistent).await {
            Ok(_) | Err(ZkError::NodeExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create the ancestors of `key`.
pub(crate) async fn ensure_parents(client: &dyn ZkClient, key: &str) -> error::Result<()> {
    ensure_path(client, &directory(key)).await
}

/// One znode of a walked subtree
pub(crate) struct TreeNode {
    pub path: String,
    pub data: Bytes,
    pub stat: Stat,
}

impl TreeNode {
    /// Empty, never written parent created on demand for its children.
    /// Such nodes are not keys.
    pub(crate) fn is_structural(&self) -> bool {
        self.data.is_empty() && self.stat.version == 0 && self.stat.num_children > 0
    }
}

/// Read `root` and every node below it, parents before children.
pub(crate) async fn walk(client: &dyn ZkClient, root: &str) -> error::Result<Vec<TreeNode>> {
    let mut nodes = Vec::new();
    let mut pending = vec![root.to_string()];

    while let Some(path) = pending.pop() {
        let (data, stat) = client.get_data(&path).await?;
        if stat.num_children > 0 {
            let (children, _) = client.get_children(&path).await?;
            pending.extend(children.iter().map(|child| join(&path, child)));
        }
        nodes.push(TreeNode { path, data, stat });
    }

    Ok(nodes)
}

/// True when no node of a walk gained or lost children since it was read.
async fn unchanged(client: &dyn ZkClient, nodes: &[TreeNode]) -> error::Result<bool> {
    for node in nodes {
        match client.exists(&node.path).await? {
            Some(stat) if stat.pzxid == node.stat.pzxid => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    UpdateOnly,
    CreateOnly,
}

/// Store backed by a ZooKeeper ensemble
pub struct ZookeeperStore {
    client: Arc<dyn ZkClient>,
    committer: Arc<ZkTxnCommitter>,
}

impl ZookeeperStore {
    pub fn new(client: Arc<dyn ZkClient>) -> Self {
        let committer = Arc::new(ZkTxnCommitter::new(client.clone()));
        Self { client, committer }
    }

    /// Connect to `servers`, passing `config` through to the client.
    pub async fn connect(
        connector: &dyn ZkConnector,
        servers: &[String],
        config: Option<&Config>,
    ) -> Result<Self> {
        let options = ClientOptions::from_config(servers, config);
        let client = connector.connect(options).await?;
        info!(
            "Connected zookeeper store to {:?} with session {:x}",
            servers,
            client.session_id()
        );
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Arc<dyn ZkClient> {
        &self.client
    }

    /// Overwrite an existing node guarded by its data version.
    ///
    /// The node keeps its kind: a TTL only takes effect when the write
    /// creates the node, so the version keeps counting across writes.
    async fn replace(&self, key: &str, value: Bytes, current: &Stat) -> error::Result<Stat> {
        self.client.set_data(key, value, Some(current.version)).await
    }

    /// Write `value`, re-reading the node whenever it moves underneath.
    async fn write(
        &self,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
        mode: WriteMode,
    ) -> Result<Stat> {
        let ttl = WriteOptions::ttl_of(opts);

        loop {
            let attempt = match self.client.exists(key).await? {
                Some(_) if mode == WriteMode::CreateOnly => return Err(StoreError::KeyExists),
                Some(stat) => self.replace(key, value.clone(), &stat).await,
                None if mode == WriteMode::UpdateOnly => return Err(StoreError::KeyNotFound),
                None => {
                    match self.client.create(key, value.clone(), create_mode(ttl)).await {
                        Ok((_, stat)) => Ok(stat),
                        Err(ZkError::NodeExists) if mode == WriteMode::CreateOnly => {
                            return Err(StoreError::KeyExists);
                        }
                        Err(ZkError::NoNode) => {
                            ensure_parents(self.client.as_ref(), key).await?;
                            Err(ZkError::NoNode)
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            match attempt {
                Ok(stat) => return Ok(stat),
                Err(e) if e.is_state_conflict() => {
                    debug!("Write to '{}' raced ({}), retrying", key, e);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current node paired with a check against the CAS baseline.
    async fn read_matching(&self, key: &str, previous: &KVPair) -> Result<Stat> {
        let (data, stat) = match self.client.get_data(key).await {
            Ok(node) => node,
            Err(ZkError::NoNode) => return Err(StoreError::KeyModified),
            Err(e) => return Err(e.into()),
        };
        if data != previous.value || (previous.index != 0 && stat.mzxid as u64 != previous.index) {
            return Err(StoreError::KeyModified);
        }
        Ok(stat)
    }

    async fn watch_path(
        &self,
        ctx: &Context,
        key: &str,
        mode: AddWatchMode,
    ) -> Result<WatchReceiver> {
        let key = normalize(key);
        let stream = ctx
            .run(async { Ok(self.client.add_watch(&key, mode).await?) })
            .await?;

        debug!("Watching '{}' ({:?})", key, mode);
        let source = ZkWatchSource::new(self.client.clone(), stream);
        Ok(spawn_delivery(ctx, source, key))
    }
}

#[async_trait]
impl Store for ZookeeperStore {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<KVPair> {
        ctx.run(async {
            let key = normalize(key);
            match self.client.get_data(&key).await {
                Ok((data, stat)) => Ok(to_pair(&key, data, &stat)),
                Err(ZkError::NoNode) => Err(StoreError::KeyNotFound),
                Err(e) => Err(e.into()),
            }
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
            self.write(&normalize(key), value, opts, WriteMode::Upsert).await?;
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
            self.write(&normalize(key), value, opts, WriteMode::UpdateOnly).await?;
            Ok(())
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
            self.write(&normalize(key), value, opts, WriteMode::CreateOnly).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        ctx.run(async {
            match self.client.delete(&normalize(key), None).await {
                Ok(()) | Err(ZkError::NoNode) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn watch(
        &self,
        ctx: &Context,
        key: &str,
        _opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver> {
        self.watch_path(ctx, key, AddWatchMode::Persistent).await
    }

    async fn watch_tree(
        &self,
        ctx: &Context,
        dir: &str,
        _opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver> {
        self.watch_path(ctx, dir, AddWatchMode::PersistentRecursive).await
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
            let stat = match previous {
                None => {
                    self.write(&key, value.clone(), opts, WriteMode::CreateOnly)
                        .await?
                }
                Some(previous) => {
                    let current = self.read_matching(&key, previous).await?;
                    match self.replace(&key, value.clone(), &current).await {
                        Ok(stat) => stat,
                        Err(e) if e.is_state_conflict() => return Err(StoreError::KeyModified),
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            Ok(to_pair(&key, value, &stat))
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
            let current = self.read_matching(&key, previous).await?;
            match self.client.delete(&key, Some(current.version)).await {
                Ok(()) => Ok(()),
                Err(ZkError::NotEmpty) => Err(ZkError::NotEmpty.into()),
                Err(e) if e.is_state_conflict() => Err(StoreError::KeyModified),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list(&self, ctx: &Context, dir: &str) -> Result<Vec<KVPair>> {
        ctx.run(async {
            let dir = normalize(dir);
            loop {
                let nodes = match walk(self.client.as_ref(), &dir).await {
                    Ok(nodes) => nodes,
                    Err(ZkError::NoNode) => {
                        if self.client.exists(&dir).await?.is_none() {
                            return Err(StoreError::KeyNotFound);
                        }
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                if !unchanged(self.client.as_ref(), &nodes).await? {
                    tokio::task::yield_now().await;
                    continue;
                }

                let mut pairs: Vec<KVPair> = nodes
                    .into_iter()
                    .filter(|node| node.path != dir && !node.is_structural())
                    .map(|node| to_pair(&node.path, node.data, &node.stat))
                    .collect();
                if pairs.is_empty() {
                    return Err(StoreError::KeyNotFound);
                }
                pairs.sort_by(|a, b| a.key.cmp(&b.key));
                return Ok(pairs);
            }
        })
        .await
    }

    async fn delete_tree(&self, ctx: &Context, dir: &str) -> Result<()> {
        ctx.run(async {
            let dir = normalize(dir);
            loop {
                let nodes = match walk(self.client.as_ref(), &dir).await {
                    Ok(nodes) => nodes,
                    Err(ZkError::NoNode) => {
                        if self.client.exists(&dir).await?.is_none() {
                            return Ok(());
                        }
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut paths: Vec<String> = nodes
                    .into_iter()
                    .map(|node| node.path)
                    .filter(|path| path != "/")
                    .collect();
                // Children sort after their parent.
                paths.sort_unstable_by(|a, b| b.cmp(a));
                let count = paths.len();

                let ops = paths
                    .into_iter()
                    .map(|path| ZkOp::Delete {
                        path,
                        version: None,
                    })
                    .collect();
                match self.client.multi(ops).await {
                    Ok(_) => {
                        debug!("Deleted {} nodes under '{}'", count, dir);
                        return Ok(());
                    }
                    Err(e) if e.is_state_conflict() => tokio::task::yield_now().await,
                    Err(e) => return Err(e.into()),
                }
            }
        })
        .await
    }

    fn new_lock(&self, key: &str, opts: Option<&LockOptions>) -> Box<dyn Locker> {
        Box::new(ZookeeperLocker::new(self.client.clone(), &normalize(key), opts))
    }

    async fn new_txn(&self, ctx: &Context) -> Result<Txn> {
        Ok(Txn::new(ctx, self.committer.clone()))
    }

    async fn close(&self) {
        self.client.close().await;
        info!("Closed zookeeper store");
    }
}
