//! Canonical transactions onto etcd compare/then/else
//!
//! Compares and both branches map onto the native request, one native op
//! per op except tree deletes, which take two.
//! Leases for TTL puts are granted before the commit, so a put with a TTL in
//! the branch that is not taken leaves an unused lease to expire.

use std::sync::Arc;

use async_trait::async_trait;

use kvstore_common::{
    CompareResult, CompareTarget, Context, Result, TxnCommitter, TxnOp, TxnOpResponse, TxnRequest,
    TxnResponse,
};

use crate::client::{self, EtcdClient, RequestOp, ResponseOp};
use crate::store::{lease_ttl_secs, to_pair, tree_delete_ops};

pub(crate) struct EtcdTxnCommitter {
    client: Arc<dyn EtcdClient>,
}

impl EtcdTxnCommitter {
    pub(crate) fn new(client: Arc<dyn EtcdClient>) -> Self {
        Self { client }
    }

    async fn translate_ops(&self, ops: &[TxnOp]) -> Result<Vec<RequestOp>> {
        let mut native = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Get { key } => native.push(RequestOp::Range {
                    key: key.clone(),
                    prefix: false,
                }),
                TxnOp::Put { key, value, ttl } => {
                    let lease = match ttl {
                        Some(ttl) => self.client.grant(lease_ttl_secs(*ttl)).await?.id,
                        None => 0,
                    };
                    native.push(RequestOp::Put {
                        key: key.clone(),
                        value: value.clone(),
                        lease,
                    });
                }
                TxnOp::Delete { key } => native.push(RequestOp::DeleteRange {
                    key: key.clone(),
                    prefix: false,
                }),
                TxnOp::DeleteTree { dir } => native.extend(tree_delete_ops(dir)),
            }
        }
        Ok(native)
    }
}

fn translate_compare(cmp: &kvstore_common::Compare) -> client::Compare {
    let target = match &cmp.target {
        CompareTarget::Value(v) => client::CompareTarget::Value(v.clone()),
        CompareTarget::Version(v) => client::CompareTarget::Version(*v as i64),
        CompareTarget::Index(v) => client::CompareTarget::Mod(*v as i64),
        CompareTarget::CreateIndex(v) => client::CompareTarget::Create(*v as i64),
        CompareTarget::Lease(v) => client::CompareTarget::Lease(*v as i64),
    };
    let result = match cmp.result {
        CompareResult::Equal => client::CompareResult::Equal,
        CompareResult::NotEqual => client::CompareResult::NotEqual,
        CompareResult::Greater => client::CompareResult::Greater,
        CompareResult::Less => client::CompareResult::Less,
    };
    client::Compare::new(cmp.key.clone(), target, result)
}

fn deleted(resp: Option<ResponseOp>) -> u64 {
    match resp {
        Some(ResponseOp::DeleteRange(del)) => del.deleted as u64,
        _ => 0,
    }
}

/// Fold native responses back onto the branch ops. A tree delete spans two
/// native deletes.
fn translate_responses(branch: &[TxnOp], native: Vec<ResponseOp>) -> Vec<TxnOpResponse> {
    let mut native = native.into_iter();
    branch
        .iter()
        .map(|op| match op {
            TxnOp::Get { .. } => {
                let kv = match native.next() {
                    Some(ResponseOp::Range(range)) => range.kvs.first().map(to_pair),
                    _ => None,
                };
                TxnOpResponse::Get(kv)
            }
            TxnOp::Put { .. } => {
                native.next();
                TxnOpResponse::Put
            }
            TxnOp::Delete { .. } => TxnOpResponse::Delete {
                deleted: deleted(native.next()),
            },
            TxnOp::DeleteTree { .. } => TxnOpResponse::DeleteTree {
                deleted: deleted(native.next()) + deleted(native.next()),
            },
        })
        .collect()
}

#[async_trait]
impl TxnCommitter for EtcdTxnCommitter {
    async fn commit(&self, _ctx: &Context, request: TxnRequest) -> Result<TxnResponse> {
        let native = client::TxnRequest {
            compare: request.compares.iter().map(translate_compare).collect(),
            success: self.translate_ops(&request.success).await?,
            failure: self.translate_ops(&request.failure).await?,
        };

        let resp = self.client.txn(native).await?;
        let branch = if resp.succeeded {
            &request.success
        } else {
            &request.failure
        };

        Ok(TxnResponse {
            succeeded: resp.succeeded,
            responses: translate_responses(branch, resp.responses),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EtcdStore, MemoryEtcd};
    use bytes::Bytes;
    use kvstore_common::{Compare, Store};

    #[test]
    fn test_compare_translation() {
        let native = translate_compare(&Compare::missing("/a"));
        assert_eq!(native.target, client::CompareTarget::Create(0));
        assert_eq!(native.result, client::CompareResult::Equal);

        let native = translate_compare(&Compare::index("/a", CompareResult::Less, 7));
        assert_eq!(native.target, client::CompareTarget::Mod(7));
        assert_eq!(native.result, client::CompareResult::Less);
    }

    #[tokio::test]
    async fn test_branch_responses() {
        let server = MemoryEtcd::new();
        let store = EtcdStore::new(server.client());
        let ctx = Context::background();
        store.put(&ctx, "/t/a", Bytes::from_static(b"1"), None).await.unwrap();
        store.put(&ctx, "/t/b", Bytes::from_static(b"2"), None).await.unwrap();
        store.put(&ctx, "/tt", Bytes::from_static(b"sibling"), None).await.unwrap();

        let resp = store
            .new_txn(&ctx)
            .await
            .unwrap()
            .when([Compare::value("/t/a", "1")])
            .and_then([TxnOp::get("/t/a"), TxnOp::delete_tree("/t")])
            .or_else([TxnOp::put("/t/a", "x")])
            .commit()
            .await
            .unwrap();

        assert!(resp.succeeded);
        match &resp.responses[0] {
            TxnOpResponse::Get(Some(pair)) => assert_eq!(pair.value, Bytes::from_static(b"1")),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(resp.responses[1], TxnOpResponse::DeleteTree { deleted: 2 });
        assert!(store.exists(&ctx, "/tt").await.unwrap());
    }
}
