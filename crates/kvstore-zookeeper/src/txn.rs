//! Canonical transactions onto ZooKeeper `multi`
//!
//! ZooKeeper has no server-side compare, so a commit reads every touched
//! node, evaluates the compares locally and submits the chosen branch as one
//! `multi`. The branch is prefixed with guards pinning what was read: a
//! version check for present nodes, a create/delete pair on the topmost
//! missing path for absent ones. A failing guard means the state moved, and
//! the whole commit starts over.
//!
//! Missing parents of written keys are created inside the branch `multi`,
//! so a commit whose branch writes nothing leaves the tree untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use kvstore_common::key::split_key;
use kvstore_common::{
    Context, KeyState, Result, TxnCommitter, TxnOp, TxnOpResponse, TxnRequest, TxnResponse,
};

use crate::client::{CreateMode, OpResult, Stat, ZkClient, ZkOp, is_within};
use crate::error::{self, ZkError};
use crate::store::{TreeNode, create_mode, to_pair, walk};

pub(crate) struct ZkTxnCommitter {
    client: Arc<dyn ZkClient>,
}

/// `/a`, `/a/b`, `/a/b/c` for `/a/b/c`.
fn ancestry(key: &str) -> Vec<String> {
    let mut current = String::new();
    split_key(key)
        .into_iter()
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}

/// Nodes observed before evaluating the compares
#[derive(Default)]
struct Snapshot {
    nodes: HashMap<String, Option<(Bytes, Stat)>>,
    trees: HashMap<String, Vec<TreeNode>>,
    /// Absent touched key to its topmost missing ancestor-or-self
    missing_from: HashMap<String, String>,
    /// Every path known to be absent
    missing: HashSet<String>,
}

impl Snapshot {
    fn state(&self, key: &str) -> Option<KeyState<'_>> {
        let (data, stat) = self.nodes.get(key)?.as_ref()?;
        Some(KeyState {
            value: data.as_ref(),
            index: stat.mzxid as u64,
            create_index: stat.czxid as u64,
            version: stat.version as u64 + 1,
            lease: stat.ephemeral_owner as u64,
        })
    }

    fn stat(&self, key: &str) -> Option<&Stat> {
        self.nodes.get(key)?.as_ref().map(|(_, stat)| stat)
    }
}

/// Response whose content is only known once the multi has run
enum Pending {
    Ready(TxnOpResponse),
    Written { op: usize, key: String, value: Bytes },
}

/// Translates one branch against a snapshot, tracking the effect of the
/// ops already planned.
struct Planner<'a> {
    snapshot: &'a Snapshot,
    present: HashMap<String, bool>,
    written: HashMap<String, (usize, Bytes)>,
    ops: Vec<ZkOp>,
    pending: Vec<Pending>,
}

impl<'a> Planner<'a> {
    fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot,
            present: HashMap::new(),
            written: HashMap::new(),
            ops: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Paths neither read, planned nor seen missing are existing ancestors.
    fn is_present(&self, path: &str) -> bool {
        match self.present.get(path) {
            Some(present) => *present,
            None => match self.snapshot.nodes.get(path) {
                Some(node) => node.is_some(),
                None => !self.snapshot.missing.contains(path),
            },
        }
    }

    fn creates(&self, path: &str) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, ZkOp::Create { path: p, .. } if p == path))
    }

    /// Pin every observed key. An absent key is pinned through its topmost
    /// missing path, unless the planned branch already creates that path.
    fn guards(&self) -> Vec<ZkOp> {
        let snapshot = self.snapshot;
        let mut keys: Vec<&String> = snapshot.nodes.keys().collect();
        keys.sort_unstable();

        let mut guards = Vec::new();
        let mut pinned = HashSet::new();
        for key in keys {
            match snapshot.stat(key) {
                Some(stat) => guards.push(ZkOp::Check {
                    path: key.clone(),
                    version: stat.version,
                }),
                None => {
                    let root = snapshot.missing_from.get(key).unwrap_or(key);
                    if !pinned.insert(root) || self.creates(root) {
                        continue;
                    }
                    guards.push(ZkOp::Create {
                        path: root.clone(),
                        data: Bytes::new(),
                        mode: CreateMode::Persistent,
                    });
                    guards.push(ZkOp::Delete {
                        path: root.clone(),
                        version: None,
                    });
                }
            }
        }
        guards
    }

    /// Create ancestors of `key` missing at this point of the branch.
    fn restore_ancestors(&mut self, key: &str) {
        let mut ancestors = ancestry(key);
        ancestors.pop();
        for ancestor in ancestors {
            if !self.is_present(&ancestor) {
                self.ops.push(ZkOp::Create {
                    path: ancestor.clone(),
                    data: Bytes::new(),
                    mode: CreateMode::Persistent,
                });
                self.present.insert(ancestor, true);
            }
        }
    }

    fn has_planned_children(&self, key: &str) -> bool {
        self.present
            .iter()
            .any(|(path, present)| *present && path != key && is_within(path, key))
    }

    fn plan(&mut self, op: &TxnOp) -> error::Result<()> {
        let pending = match op {
            TxnOp::Get { key } => match self.written.get(key) {
                Some((op, value)) => Pending::Written {
                    op: *op,
                    key: key.clone(),
                    value: value.clone(),
                },
                None if !self.is_present(key) => Pending::Ready(TxnOpResponse::Get(None)),
                None => Pending::Ready(TxnOpResponse::Get(
                    self.snapshot
                        .nodes
                        .get(key)
                        .and_then(Option::as_ref)
                        .map(|(data, stat)| to_pair(key, data.clone(), stat)),
                )),
            },
            TxnOp::Put { key, value, ttl } => {
                self.restore_ancestors(key);
                if self.is_present(key) {
                    self.ops.push(ZkOp::SetData {
                        path: key.clone(),
                        data: value.clone(),
                        version: None,
                    });
                } else {
                    self.ops.push(ZkOp::Create {
                        path: key.clone(),
                        data: value.clone(),
                        mode: create_mode(*ttl),
                    });
                    self.present.insert(key.clone(), true);
                }
                self.written
                    .insert(key.clone(), (self.ops.len() - 1, value.clone()));
                Pending::Ready(TxnOpResponse::Put)
            }
            TxnOp::Delete { key } => {
                let deleted = if self.is_present(key) {
                    let children = self.snapshot.stat(key).is_some_and(|s| s.num_children > 0);
                    if children || self.has_planned_children(key) {
                        return Err(ZkError::NotEmpty);
                    }
                    self.ops.push(ZkOp::Delete {
                        path: key.clone(),
                        version: None,
                    });
                    self.present.insert(key.clone(), false);
                    self.written.remove(key);
                    1
                } else {
                    0
                };
                Pending::Ready(TxnOpResponse::Delete { deleted })
            }
            TxnOp::DeleteTree { dir } => {
                let deleted = self.plan_delete_tree(dir);
                Pending::Ready(TxnOpResponse::DeleteTree { deleted })
            }
        };
        self.pending.push(pending);
        Ok(())
    }

    /// Structural parents are removed but not counted as keys.
    fn plan_delete_tree(&mut self, dir: &str) -> u64 {
        let mut doomed: Vec<(String, bool)> = self
            .snapshot
            .trees
            .get(dir)
            .into_iter()
            .flatten()
            .filter(|node| self.present.get(&node.path).copied().unwrap_or(true))
            .map(|node| {
                let key = self.written.contains_key(&node.path) || !node.is_structural();
                (node.path.clone(), key)
            })
            .collect();

        // Nodes created earlier in this branch.
        for (path, present) in &self.present {
            if *present && is_within(path, dir) && !doomed.iter().any(|(p, _)| p == path) {
                doomed.push((path.clone(), self.written.contains_key(path)));
            }
        }

        doomed.retain(|(path, _)| path != "/");
        doomed.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut deleted = 0;
        for (path, key) in doomed {
            self.ops.push(ZkOp::Delete {
                path: path.clone(),
                version: None,
            });
            self.written.remove(&path);
            self.present.insert(path, false);
            deleted += u64::from(key);
        }
        deleted
    }

    /// `results` holds the branch results, guards excluded.
    fn resolve(self, results: &[OpResult]) -> Vec<TxnOpResponse> {
        self.pending
            .into_iter()
            .map(|pending| match pending {
                Pending::Ready(resp) => resp,
                Pending::Written { op, key, value } => TxnOpResponse::Get(match results.get(op) {
                    Some(OpResult::Create { stat, .. }) | Some(OpResult::SetData { stat }) => {
                        Some(to_pair(&key, value, stat))
                    }
                    _ => None,
                }),
            })
            .collect()
    }
}

/// Conflicts become `None` so the caller starts over.
fn settle<T>(res: error::Result<T>) -> error::Result<Option<T>> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_state_conflict() => Ok(None),
        Err(e) => Err(e),
    }
}

impl ZkTxnCommitter {
    pub(crate) fn new(client: Arc<dyn ZkClient>) -> Self {
        Self { client }
    }

    /// Topmost path of `key`'s ancestry that does not exist. `key` itself
    /// is known to be absent.
    async fn first_missing(&self, key: &str, snapshot: &Snapshot) -> error::Result<String> {
        for path in ancestry(key) {
            if path == key
                || snapshot.missing.contains(&path)
                || self.client.exists(&path).await?.is_none()
            {
                return Ok(path);
            }
        }
        Ok(key.to_string())
    }

    async fn read(&self, request: &TxnRequest) -> error::Result<Snapshot> {
        let mut snapshot = Snapshot::default();

        for key in request.touched_keys() {
            let node = match self.client.get_data(key).await {
                Ok(node) => Some(node),
                Err(ZkError::NoNode) => None,
                Err(e) => return Err(e),
            };
            if node.is_none() {
                let root = self.first_missing(key, &snapshot).await?;
                for path in ancestry(key) {
                    if path.len() >= root.len() {
                        snapshot.missing.insert(path);
                    }
                }
                snapshot.missing_from.insert(key.to_string(), root);
            }
            snapshot.nodes.insert(key.to_string(), node);
        }

        for op in request.success.iter().chain(&request.failure) {
            if let TxnOp::DeleteTree { dir } = op
                && !snapshot.trees.contains_key(dir)
            {
                let nodes = match walk(self.client.as_ref(), dir).await {
                    Ok(nodes) => nodes,
                    Err(ZkError::NoNode) if snapshot.stat(dir).is_none() => Vec::new(),
                    Err(e) => return Err(e),
                };
                snapshot.trees.insert(dir.clone(), nodes);
            }
        }

        Ok(snapshot)
    }

    /// One evaluate-and-apply round. `None` means the state moved.
    async fn attempt(&self, request: &TxnRequest) -> error::Result<Option<TxnResponse>> {
        let Some(snapshot) = settle(self.read(request).await)? else {
            return Ok(None);
        };

        let succeeded = request
            .compares
            .iter()
            .all(|cmp| cmp.evaluate(snapshot.state(&cmp.key).as_ref()));
        let branch = if succeeded {
            &request.success
        } else {
            &request.failure
        };

        let mut planner = Planner::new(&snapshot);
        for op in branch {
            planner.plan(op)?;
        }

        let mut ops = planner.guards();
        let offset = ops.len();
        ops.append(&mut planner.ops);
        let Some(results) = settle(self.client.multi(ops).await)? else {
            debug!("Transaction guards failed, re-evaluating");
            return Ok(None);
        };
        Ok(Some(TxnResponse {
            succeeded,
            responses: planner.resolve(results.get(offset..).unwrap_or_default()),
        }))
    }
}

#[async_trait]
impl TxnCommitter for ZkTxnCommitter {
    async fn commit(&self, _ctx: &Context, request: TxnRequest) -> Result<TxnResponse> {
        loop {
            if let Some(resp) = self.attempt(&request).await? {
                return Ok(resp);
            }
            tokio::task::yield_now().await;
        }
    }
}
