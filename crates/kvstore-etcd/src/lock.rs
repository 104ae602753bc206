//! Lease-bound distributed mutex
//!
//! Each acquisition opens a session: a lease refreshed by a background
//! keepalive task. The contender key `<lock>/<lease-hex>` is attached to the
//! lease, so it disappears when the session ends for any reason. Contenders
//! queue by create revision and each waits only on its predecessor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kvstore_common::{Context, LockOptions, Locker, Result, StoreError};

use crate::client::{
    Compare, CompareResult, CompareTarget, EtcdClient, EventType, KeyValue, RequestOp,
    TxnRequest, WatchRequest,
};
use crate::error::EtcdError;
use crate::store::lease_ttl_secs;

/// Session TTL when the caller does not set one
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Lease plus the task keeping it alive
struct Session {
    client: Arc<dyn EtcdClient>,
    lease: i64,
    keepalive: JoinHandle<()>,
}

impl Session {
    async fn open(client: Arc<dyn EtcdClient>, ttl: Duration) -> Result<Self> {
        let grant = client.grant(lease_ttl_secs(ttl)).await?;
        let keepalive = tokio::spawn(keep_alive(
            client.clone(),
            grant.id,
            Duration::from_secs(grant.ttl as u64),
        ));
        Ok(Self {
            client,
            lease: grant.id,
            keepalive,
        })
    }

    /// Stop refreshing and revoke the lease, deleting its keys.
    async fn close(self) -> Result<()> {
        self.keepalive.abort();
        match self.client.revoke(self.lease).await {
            Ok(()) | Err(EtcdError::LeaseNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

async fn keep_alive(client: Arc<dyn EtcdClient>, lease: i64, ttl: Duration) {
    let mut interval = tokio::time::interval((ttl / 3).max(MIN_KEEPALIVE_PERIOD));
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = client.keep_alive_once(lease).await {
            warn!("Lease {:x} keepalive stopped: {}", lease, e);
            return;
        }
    }
}

struct Held {
    session: Session,
    key: String,
}

/// etcd lock bound to one key
pub struct EtcdLocker {
    client: Arc<dyn EtcdClient>,
    prefix: String,
    ttl: Duration,
    value: Bytes,
    held: Option<Held>,
}

impl EtcdLocker {
    pub fn new(client: Arc<dyn EtcdClient>, key: &str, opts: Option<&LockOptions>) -> Self {
        let ttl = opts
            .map(|o| o.ttl)
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(DEFAULT_LOCK_TTL);
        let value = opts.and_then(|o| o.value.clone()).unwrap_or_default();
        Self {
            client,
            prefix: format!("{}/", key.trim_end_matches('/')),
            ttl,
            value,
            held: None,
        }
    }

    /// Register as a contender and wait until every earlier contender is
    /// gone.
    async fn campaign(&self, lease: i64) -> Result<String> {
        let key = format!("{}{:x}", self.prefix, lease);
        self.client
            .txn(TxnRequest {
                compare: vec![Compare::new(
                    &key,
                    CompareTarget::Create(0),
                    CompareResult::Equal,
                )],
                success: vec![RequestOp::Put {
                    key: key.clone(),
                    value: self.value.clone(),
                    lease,
                }],
                failure: vec![],
            })
            .await?;

        loop {
            let range = self.client.range(&self.prefix, true).await?;
            let mine = range
                .kvs
                .iter()
                .find(|kv| kv.key == key)
                .map(|kv| kv.create_revision)
                .ok_or(EtcdError::LeaseNotFound)?;

            let Some(predecessor) = predecessor(&range.kvs, mine) else {
                return Ok(key);
            };

            debug!("Lock '{}' waiting on {}", self.prefix, predecessor);
            self.wait_deleted(&predecessor, range.revision + 1).await?;
        }
    }

    async fn wait_deleted(&self, key: &str, start_revision: i64) -> Result<()> {
        let mut stream = self
            .client
            .watch(WatchRequest {
                key: key.to_string(),
                prefix: false,
                start_revision,
                prev_kv: false,
            })
            .await?;

        while let Some(batch) = stream.message().await {
            if batch?.iter().any(|e| e.event_type == EventType::Delete) {
                return Ok(());
            }
        }
        // Stream closed by the server; the caller re-reads the queue.
        Ok(())
    }
}

/// Contender created immediately before `mine`.
fn predecessor(contenders: &[KeyValue], mine: i64) -> Option<String> {
    contenders
        .iter()
        .filter(|kv| kv.create_revision < mine)
        .max_by_key(|kv| kv.create_revision)
        .map(|kv| kv.key.clone())
}

#[async_trait]
impl Locker for EtcdLocker {
    async fn lock(&mut self, ctx: &Context) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }

        let session = ctx
            .run(Session::open(self.client.clone(), self.ttl))
            .await?;

        let outcome = ctx.run(self.campaign(session.lease)).await;
        match outcome {
            Ok(key) => {
                debug!("Acquired lock {}", key);
                self.held = Some(Held { session, key });
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!("Failed to release abandoned lock session: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn unlock(&mut self, ctx: &Context) -> Result<()> {
        let held = self.held.take().ok_or(StoreError::LockNotHeld)?;
        debug!("Releasing lock {}", held.key);

        let deleted = ctx
            .run(async {
                self.client.delete_range(&held.key, false).await?;
                Ok(())
            })
            .await;
        // Revoking the lease deletes the contender key too, so either step
        // succeeding releases the lock.
        match (deleted, held.session.close().await) {
            (_, Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                warn!("Lock {} released, lease revoke failed: {}", held.key, e);
                Ok(())
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn key(&self) -> Option<&str> {
        self.held.as_ref().map(|h| h.key.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryEtcd;

    fn contender(key: &str, create_revision: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            create_revision,
            mod_revision: create_revision,
            version: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_predecessor_is_closest_earlier() {
        let queue = vec![
            contender("/l/1", 3),
            contender("/l/2", 5),
            contender("/l/3", 9),
        ];
        assert_eq!(predecessor(&queue, 3), None);
        assert_eq!(predecessor(&queue, 9).as_deref(), Some("/l/2"));
    }

    #[tokio::test]
    async fn test_lock_key_carries_value_and_lease() {
        let server = MemoryEtcd::new();
        let client: Arc<dyn EtcdClient> = server.client();
        let opts = LockOptions {
            ttl: Duration::from_secs(5),
            value: Some(Bytes::from_static(b"owner-1")),
        };
        let mut lock = EtcdLocker::new(client.clone(), "/locks/job", Some(&opts));
        let ctx = Context::background();

        lock.lock(&ctx).await.unwrap();
        let key = lock.key().unwrap().to_string();
        assert!(key.starts_with("/locks/job/"));

        let kv = client.range(&key, false).await.unwrap().kvs.remove(0);
        assert_eq!(kv.value, Bytes::from_static(b"owner-1"));
        assert_ne!(kv.lease, 0);

        lock.unlock(&ctx).await.unwrap();
        assert!(client.range(&key, false).await.unwrap().kvs.is_empty());
        assert_eq!(server.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let server = MemoryEtcd::new();
        let mut lock = EtcdLocker::new(server.client(), "/locks/none", None);
        let err = lock.unlock(&Context::background()).await.unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld));
    }

    #[tokio::test]
    async fn test_unlock_with_cancelled_context_releases() {
        let server = MemoryEtcd::new();
        let client: Arc<dyn EtcdClient> = server.client();
        let ctx = Context::background();

        let mut holder = EtcdLocker::new(client.clone(), "/locks/cancel", None);
        holder.lock(&ctx).await.unwrap();
        let key = holder.key().unwrap().to_string();

        let cancelled = Context::background();
        cancelled.cancel();
        holder.unlock(&cancelled).await.unwrap();
        assert!(!holder.is_held());
        assert!(client.range(&key, false).await.unwrap().kvs.is_empty());
        assert_eq!(server.lease_count(), 0);

        let mut next = EtcdLocker::new(client, "/locks/cancel", None);
        tokio::time::timeout(Duration::from_secs(1), next.lock(&ctx))
            .await
            .expect("lock should be free after unlock")
            .unwrap();
        assert!(next.is_held());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_withdraws() {
        let server = MemoryEtcd::new();
        let client: Arc<dyn EtcdClient> = server.client();
        let ctx = Context::background();

        let mut holder = EtcdLocker::new(client.clone(), "/locks/q", None);
        holder.lock(&ctx).await.unwrap();

        let mut waiter = EtcdLocker::new(client.clone(), "/locks/q", None);
        let short = Context::with_timeout(Duration::from_millis(100));
        let err = waiter.lock(&short).await.unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded));
        assert!(!waiter.is_held());

        // Only the holder's contender key remains.
        let queue = client.range("/locks/q/", true).await.unwrap().kvs;
        assert_eq!(queue.len(), 1);
        assert_eq!(Some(queue[0].key.as_str()), holder.key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_holder_expires() {
        let server = MemoryEtcd::new();
        let client: Arc<dyn EtcdClient> = server.client();
        let ctx = Context::background();
        let opts = LockOptions {
            ttl: Duration::from_secs(2),
            value: None,
        };

        let mut holder = EtcdLocker::new(client.clone(), "/locks/crash", Some(&opts));
        holder.lock(&ctx).await.unwrap();
        drop(holder);

        let mut next = EtcdLocker::new(client, "/locks/crash", Some(&opts));
        tokio::time::timeout(Duration::from_secs(5), next.lock(&ctx))
            .await
            .expect("lock should free after the session TTL")
            .unwrap();
        assert!(next.is_held());
    }
}
