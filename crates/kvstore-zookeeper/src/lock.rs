//! Session-bound distributed mutex
//!
//! Each acquisition opens its own session with the lock TTL as session
//! timeout. Contenders create ephemeral sequential nodes
//! `<lock>/lock-NNNNNNNNNN`; the lowest sequence owns the lock and every
//! other contender waits for its predecessor to go away. The node vanishes
//! with the session, so a holder that stops heartbeating releases the lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use kvstore_common::key::{base_name, join};
use kvstore_common::{Context, LockOptions, Locker, Result, StoreError};

use crate::client::{AddWatchMode, CreateMode, EventType, ZkClient};
use crate::error::ZkError;
use crate::store::ensure_path;

/// Session timeout when the caller does not set a TTL
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

const CONTENDER_PREFIX: &str = "lock-";

struct Held {
    session: Arc<dyn ZkClient>,
    path: String,
}

/// ZooKeeper lock bound to one key
pub struct ZookeeperLocker {
    client: Arc<dyn ZkClient>,
    dir: String,
    ttl: Duration,
    value: Bytes,
    held: Option<Held>,
}

impl ZookeeperLocker {
    pub fn new(client: Arc<dyn ZkClient>, key: &str, opts: Option<&LockOptions>) -> Self {
        let ttl = opts
            .map(|o| o.ttl)
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(DEFAULT_LOCK_TTL);
        let value = opts.and_then(|o| o.value.clone()).unwrap_or_default();
        Self {
            client,
            dir: key.to_string(),
            ttl,
            value,
            held: None,
        }
    }

    /// Enqueue on `session` and wait until no earlier contender is left.
    async fn campaign(&self, session: &dyn ZkClient) -> Result<String> {
        ensure_path(session, &self.dir).await?;
        let (path, _) = session
            .create(
                &join(&self.dir, CONTENDER_PREFIX),
                self.value.clone(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let name = base_name(&path).to_string();

        loop {
            let (mut queue, _) = session.get_children(&self.dir).await?;
            queue.retain(|child| child.starts_with(CONTENDER_PREFIX));
            queue.sort_unstable();

            let position = queue
                .iter()
                .position(|child| *child == name)
                .ok_or(ZkError::NoNode)?;
            if position == 0 {
                return Ok(path);
            }

            let predecessor = join(&self.dir, &queue[position - 1]);
            debug!("Lock '{}' waiting on {}", self.dir, predecessor);

            let mut stream = session.add_watch(&predecessor, AddWatchMode::Persistent).await?;
            if session.exists(&predecessor).await?.is_none() {
                continue;
            }
            loop {
                match stream.next().await {
                    Some(event) if event.event_type == EventType::NodeDeleted => break,
                    Some(_) => continue,
                    None => return Err(ZkError::SessionExpired.into()),
                }
            }
        }
    }
}

#[async_trait]
impl Locker for ZookeeperLocker {
    async fn lock(&mut self, ctx: &Context) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }

        let session = ctx
            .run(async { Ok(self.client.open_session(self.ttl).await?) })
            .await?;

        let outcome = ctx.run(self.campaign(session.as_ref())).await;
        match outcome {
            Ok(path) => {
                debug!("Acquired lock {}", path);
                self.held = Some(Held { session, path });
                Ok(())
            }
            Err(e) => {
                // Closing the session removes the contender node.
                session.close().await;
                Err(e)
            }
        }
    }

    async fn unlock(&mut self, ctx: &Context) -> Result<()> {
        let held = self.held.take().ok_or(StoreError::LockNotHeld)?;
        debug!("Releasing lock {}", held.path);

        let deleted = ctx
            .run(async {
                match held.session.delete(&held.path, None).await {
                    Ok(()) | Err(ZkError::NoNode) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await;
        held.session.close().await;
        deleted
    }

    fn key(&self) -> Option<&str> {
        self.held.as_ref().map(|h| h.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryZk;

    #[tokio::test]
    async fn test_contender_node_is_ephemeral_sequential() {
        let server = MemoryZk::new();
        let client: Arc<dyn ZkClient> = server.open(Duration::from_secs(30));
        let opts = LockOptions {
            ttl: Duration::from_secs(5),
            value: Some(Bytes::from_static(b"owner-1")),
        };
        let mut lock = ZookeeperLocker::new(client.clone(), "/locks/job", Some(&opts));
        let ctx = Context::background();

        lock.lock(&ctx).await.unwrap();
        let path = lock.key().unwrap().to_string();
        assert_eq!(path, "/locks/job/lock-0000000000");

        let (data, stat) = client.get_data(&path).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"owner-1"));
        assert_ne!(stat.ephemeral_owner, client.session_id());
        assert_eq!(server.session_count(), 2);

        lock.unlock(&ctx).await.unwrap();
        assert!(client.exists(&path).await.unwrap().is_none());
        assert_eq!(server.session_count(), 1);
    }

    #[tokio::test]
    async fn test_unlock_without_lock() {
        let server = MemoryZk::new();
        let client = server.open(Duration::from_secs(30));
        let mut lock = ZookeeperLocker::new(client, "/locks/none", None);
        let err = lock.unlock(&Context::background()).await.unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_withdraws() {
        let server = MemoryZk::new();
        let client: Arc<dyn ZkClient> = server.open(Duration::from_secs(30));
        let ctx = Context::background();

        let mut holder = ZookeeperLocker::new(client.clone(), "/locks/q", None);
        holder.lock(&ctx).await.unwrap();

        let mut waiter = ZookeeperLocker::new(client.clone(), "/locks/q", None);
        let short = Context::with_timeout(Duration::from_millis(100));
        let err = waiter.lock(&short).await.unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded));
        assert!(!waiter.is_held());

        let (queue, _) = client.get_children("/locks/q").await.unwrap();
        assert_eq!(queue, vec!["lock-0000000000".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_holder_session_frees_lock() {
        let server = MemoryZk::new();
        let client: Arc<dyn ZkClient> = server.open(Duration::from_secs(30));
        let ctx = Context::background();

        let mut holder = ZookeeperLocker::new(client.clone(), "/locks/expire", None);
        holder.lock(&ctx).await.unwrap();
        let holder_session = client
            .get_data(holder.key().unwrap())
            .await
            .unwrap()
            .1
            .ephemeral_owner;

        let mut next = ZookeeperLocker::new(client.clone(), "/locks/expire", None);
        let (acquired, ()) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(5), next.lock(&ctx)),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                server.expire_session(holder_session);
            },
        );
        acquired.expect("lock should free on session expiry").unwrap();
        assert!(next.is_held());
    }
}
