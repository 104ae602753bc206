//! Multi-operation transaction model
//!
//! A transaction is an ordered list of compares, the operations to apply when
//! every compare holds, and the operations to apply otherwise. Backends commit
//! the chosen branch as one atomic unit; partial application is never
//! observable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::Result;
use crate::key::normalize;
use crate::model::KVPair;

/// Relation between the current key state and the expected value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareResult {
    fn holds<T: PartialOrd + ?Sized>(self, actual: &T, expected: &T) -> bool {
        match self {
            CompareResult::Equal => actual == expected,
            CompareResult::NotEqual => actual != expected,
            CompareResult::Greater => actual > expected,
            CompareResult::Less => actual < expected,
        }
    }
}

/// Key attribute a compare inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Bytes),
    Version(u64),
    /// Modification counter
    Index(u64),
    /// Counter at which the key was created, 0 when absent
    CreateIndex(u64),
    Lease(u64),
}

/// Current state of one key as seen by a compare
#[derive(Debug, Clone, Copy)]
pub struct KeyState<'a> {
    pub value: &'a [u8],
    pub index: u64,
    pub create_index: u64,
    pub version: u64,
    pub lease: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
    pub result: CompareResult,
}

impl Compare {
    pub fn new(key: impl Into<String>, target: CompareTarget, result: CompareResult) -> Self {
        Self {
            key: key.into(),
            target,
            result,
        }
    }

    /// Current value equals `value`.
    pub fn value(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(key, CompareTarget::Value(value.into()), CompareResult::Equal)
    }

    pub fn version(key: impl Into<String>, result: CompareResult, version: u64) -> Self {
        Self::new(key, CompareTarget::Version(version), result)
    }

    pub fn index(key: impl Into<String>, result: CompareResult, index: u64) -> Self {
        Self::new(key, CompareTarget::Index(index), result)
    }

    pub fn lease(key: impl Into<String>, result: CompareResult, lease: u64) -> Self {
        Self::new(key, CompareTarget::Lease(lease), result)
    }

    /// Key does not exist.
    pub fn missing(key: impl Into<String>) -> Self {
        Self::new(key, CompareTarget::CreateIndex(0), CompareResult::Equal)
    }

    /// Key exists.
    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, CompareTarget::CreateIndex(0), CompareResult::Greater)
    }

    /// Absent keys compare as zero counters and an empty value.
    pub fn evaluate(&self, state: Option<&KeyState<'_>>) -> bool {
        let empty = KeyState {
            value: &[],
            index: 0,
            create_index: 0,
            version: 0,
            lease: 0,
        };
        let state = state.unwrap_or(&empty);
        match &self.target {
            CompareTarget::Value(expected) => self.result.holds(state.value, expected.as_ref()),
            CompareTarget::Version(expected) => self.result.holds(&state.version, expected),
            CompareTarget::Index(expected) => self.result.holds(&state.index, expected),
            CompareTarget::CreateIndex(expected) => {
                self.result.holds(&state.create_index, expected)
            }
            CompareTarget::Lease(expected) => self.result.holds(&state.lease, expected),
        }
    }
}

/// Operation applied by a committed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Get { key: String },
    Put {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Delete { key: String },
    DeleteTree { dir: String },
}

impl TxnOp {
    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    pub fn put_with_ttl(key: impl Into<String>, value: impl Into<Bytes>, ttl: Duration) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl).filter(|t| !t.is_zero()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    pub fn delete_tree(dir: impl Into<String>) -> Self {
        TxnOp::DeleteTree { dir: dir.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            TxnOp::Get { key } | TxnOp::Put { key, .. } | TxnOp::Delete { key } => key,
            TxnOp::DeleteTree { dir } => dir,
        }
    }

    fn normalized(self) -> Self {
        match self {
            TxnOp::Get { key } => TxnOp::Get {
                key: normalize(&key),
            },
            TxnOp::Put { key, value, ttl } => TxnOp::Put {
                key: normalize(&key),
                value,
                ttl,
            },
            TxnOp::Delete { key } => TxnOp::Delete {
                key: normalize(&key),
            },
            TxnOp::DeleteTree { dir } => TxnOp::DeleteTree {
                dir: normalize(&dir),
            },
        }
    }
}

/// Result of one applied operation, in branch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Get(Option<KVPair>),
    Put,
    Delete { deleted: u64 },
    DeleteTree { deleted: u64 },
}

/// Normalized transaction handed to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl TxnRequest {
    /// Keys read or written by either branch or by a compare.
    pub fn touched_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .compares
            .iter()
            .map(|c| c.key.as_str())
            .chain(self.success.iter().map(TxnOp::key))
            .chain(self.failure.iter().map(TxnOp::key))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held and the success branch was applied
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
}

/// Backend side of a transaction
#[async_trait]
pub trait TxnCommitter: Send + Sync {
    async fn commit(&self, ctx: &Context, request: TxnRequest) -> Result<TxnResponse>;
}

/// Transaction builder returned by `Store::new_txn`
pub struct Txn {
    ctx: Context,
    request: TxnRequest,
    committer: Arc<dyn TxnCommitter>,
}

impl Txn {
    pub fn new(ctx: &Context, committer: Arc<dyn TxnCommitter>) -> Self {
        Self {
            ctx: ctx.clone(),
            request: TxnRequest::default(),
            committer,
        }
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.request
            .compares
            .extend(compares.into_iter().map(|mut c| {
                c.key = normalize(&c.key);
                c
            }));
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.request
            .success
            .extend(ops.into_iter().map(TxnOp::normalized));
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.request
            .failure
            .extend(ops.into_iter().map(TxnOp::normalized));
        self
    }

    pub fn request(&self) -> &TxnRequest {
        &self.request
    }

    pub async fn commit(self) -> Result<TxnResponse> {
        let Txn {
            ctx,
            request,
            committer,
        } = self;
        ctx.run(committer.commit(&ctx, request)).await
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn").field("request", &self.request).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(value: &[u8], index: u64) -> KeyState<'_> {
        KeyState {
            value,
            index,
            create_index: 1,
            version: 2,
            lease: 0,
        }
    }

    #[test]
    fn test_compare_value() {
        let cmp = Compare::value("/a", "x");
        assert!(cmp.evaluate(Some(&state(b"x", 3))));
        assert!(!cmp.evaluate(Some(&state(b"y", 3))));
        assert!(!cmp.evaluate(None));
    }

    #[test]
    fn test_compare_counters() {
        assert!(Compare::index("/a", CompareResult::Equal, 3).evaluate(Some(&state(b"", 3))));
        assert!(Compare::index("/a", CompareResult::Less, 4).evaluate(Some(&state(b"", 3))));
        assert!(Compare::version("/a", CompareResult::Greater, 1).evaluate(Some(&state(b"", 3))));
        assert!(Compare::lease("/a", CompareResult::NotEqual, 5).evaluate(Some(&state(b"", 3))));
    }

    #[test]
    fn test_compare_existence() {
        assert!(Compare::missing("/a").evaluate(None));
        assert!(!Compare::missing("/a").evaluate(Some(&state(b"", 1))));
        assert!(Compare::exists("/a").evaluate(Some(&state(b"", 1))));
        assert!(!Compare::exists("/a").evaluate(None));
    }

    struct Echo;

    #[async_trait]
    impl TxnCommitter for Echo {
        async fn commit(&self, _ctx: &Context, request: TxnRequest) -> Result<TxnResponse> {
            Ok(TxnResponse {
                succeeded: request.compares.is_empty(),
                responses: request.success.iter().map(|_| TxnOpResponse::Put).collect(),
            })
        }
    }

    #[tokio::test]
    async fn test_builder_normalizes_keys() {
        let ctx = Context::background();
        let txn = Txn::new(&ctx, Arc::new(Echo))
            .when([Compare::missing("a/b/")])
            .and_then([TxnOp::put("a/b", "v"), TxnOp::delete_tree("dir/")])
            .or_else([TxnOp::get("a//b")]);

        let req = txn.request();
        assert_eq!(req.compares[0].key, "/a/b");
        assert_eq!(req.success[0].key(), "/a/b");
        assert_eq!(req.success[1].key(), "/dir");
        assert_eq!(req.failure[0].key(), "/a/b");
        assert_eq!(req.touched_keys(), vec!["/a/b", "/dir"]);

        let resp = txn.commit().await.unwrap();
        assert!(!resp.succeeded);
        assert_eq!(resp.responses.len(), 2);
    }

    #[test]
    fn test_put_with_zero_ttl() {
        let op = TxnOp::put_with_ttl("/a", "v", Duration::ZERO);
        assert!(matches!(op, TxnOp::Put { ttl: None, .. }));
    }
}
