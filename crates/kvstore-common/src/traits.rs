//! Backend contract
//!
//! These traits are what callers program against. Each backend crate
//! provides one `Store` implementation and one `Locker` implementation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::Context;
use crate::error::{Result, StoreError};
use crate::model::{KVPair, LockOptions, WatchOptions, WatchReceiver, WriteOptions};
use crate::txn::Txn;

/// Backend-agnostic key-value coordination store
///
/// Keys are normalized with [`crate::key::normalize`] before any backend
/// call. No key state is cached; every read reflects the backend at call
/// time.
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the backend the store talks to.
    fn backend(&self) -> &'static str;

    /// Get the value at `key`. Fails with `KeyNotFound` if absent.
    async fn get(&self, ctx: &Context, key: &str) -> Result<KVPair>;

    /// Unconditional upsert. Rewriting an existing key continues its version,
    /// whether or not the write carries a TTL.
    async fn put(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()>;

    /// Write only if the key already exists, else `KeyNotFound`.
    async fn update(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()>;

    /// Write only if the key does not exist, else `KeyExists`.
    async fn create(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        opts: Option<&WriteOptions>,
    ) -> Result<()>;

    /// Unconditional delete. Deleting an absent key succeeds.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<()>;

    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool> {
        match self.get(ctx, key).await {
            Ok(_) => Ok(true),
            Err(StoreError::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Watch a single key.
    async fn watch(
        &self,
        ctx: &Context,
        key: &str,
        opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver>;

    /// Watch `dir` and every key below it. Keys that merely share `dir` as
    /// a byte prefix, like `/ab` for `/a`, are not included.
    async fn watch_tree(
        &self,
        ctx: &Context,
        dir: &str,
        opts: Option<&WatchOptions>,
    ) -> Result<WatchReceiver>;

    /// Compare-and-swap. `previous == None` means "create only".
    async fn atomic_put(
        &self,
        ctx: &Context,
        key: &str,
        value: Bytes,
        previous: Option<&KVPair>,
        opts: Option<&WriteOptions>,
    ) -> Result<KVPair>;

    /// Compare-and-delete. `previous` is mandatory.
    async fn atomic_delete(&self, ctx: &Context, key: &str, previous: Option<&KVPair>)
    -> Result<()>;

    /// All pairs strictly below `dir`, sorted by key. `dir` itself and
    /// byte-prefix siblings are excluded. Fails with `KeyNotFound` if
    /// nothing matches.
    async fn list(&self, ctx: &Context, dir: &str) -> Result<Vec<KVPair>>;

    /// Delete `dir` and every key below it atomically.
    async fn delete_tree(&self, ctx: &Context, dir: &str) -> Result<()>;

    /// Construct, but do not acquire, a lock bound to `key`.
    fn new_lock(&self, key: &str, opts: Option<&LockOptions>) -> Box<dyn Locker>;

    async fn new_txn(&self, ctx: &Context) -> Result<Txn>;

    /// Release the backend connection.
    async fn close(&self);
}

/// Distributed mutex handle bound to one key
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the lock is held or the context is done.
    async fn lock(&mut self, ctx: &Context) -> Result<()>;

    /// Release a held lock.
    async fn unlock(&mut self, ctx: &Context) -> Result<()>;

    /// Contender key while the lock is held.
    fn key(&self) -> Option<&str>;

    fn is_held(&self) -> bool {
        self.key().is_some()
    }
}
