//! In-process etcd reference server
//!
//! Single-node MVCC store implementing the native primitives the adapter
//! relies on: a global revision bumped once per write transaction, per-key
//! create/mod revisions and versions, leases with TTL expiry, prefix
//! watches with previous key-values and revision replay, and compaction.
//!
//! State lives behind one mutex, so every request is linearized. Every
//! request also yields once before taking it, as a network round-trip
//! would, so concurrent callers interleave. Leases are expired lazily on
//! each request and by a background reaper task. The event history keeps
//! the last [`DEFAULT_HISTORY_LIMIT`] revisions; older ones are compacted
//! automatically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{
    ClientOptions, DeleteRangeResponse, EtcdClient, EtcdConnector, Event, EventType, KeyValue,
    LeaseGrantResponse, PutResponse, RangeResponse, RequestOp, ResponseOp, TxnRequest,
    TxnResponse, WatchRequest, WatchStream,
};
use crate::error::{EtcdError, Result};

/// Interval of the background lease reaper
pub const REAPER_INTERVAL: Duration = Duration::from_millis(100);

/// Revisions of event history kept for watch replay
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

// ============================================================================
// Server State
// ============================================================================

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    client: u64,
    key: String,
    prefix: bool,
    prev_kv: bool,
    start_revision: i64,
    tx: mpsc::UnboundedSender<Result<Vec<Event>>>,
}

impl Watcher {
    fn covers(&self, key: &str) -> bool {
        key_matches(key, &self.key, self.prefix)
    }

    /// Events of one revision that this watcher should see.
    fn select(&self, revision: i64, events: &[Event]) -> Vec<Event> {
        if revision < self.start_revision {
            return Vec::new();
        }
        events
            .iter()
            .filter(|e| self.covers(&e.kv.key))
            .map(|e| {
                let mut e = e.clone();
                if !self.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect()
    }
}

fn key_matches(key: &str, target: &str, prefix: bool) -> bool {
    if prefix {
        key.starts_with(target)
    } else {
        key == target
    }
}

#[derive(Default)]
struct State {
    revision: i64,
    compacted: i64,
    kvs: BTreeMap<String, KeyValue>,
    /// Events per revision, oldest first, pruned by compaction
    history: Vec<(i64, Vec<Event>)>,
    history_limit: usize,
    leases: HashMap<i64, Lease>,
    next_lease: i64,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
}

impl State {
    fn range(&self, key: &str, prefix: bool) -> Vec<KeyValue> {
        if prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            self.kvs.get(key).cloned().into_iter().collect()
        }
    }

    fn check_lease(&self, lease: i64) -> Result<()> {
        if lease != 0 && !self.leases.contains_key(&lease) {
            return Err(EtcdError::LeaseNotFound);
        }
        Ok(())
    }

    fn apply_put(
        &mut self,
        revision: i64,
        key: &str,
        value: Bytes,
        lease: i64,
        events: &mut Vec<Event>,
    ) -> PutResponse {
        let prev = self.kvs.get(key).cloned();

        if let Some(prev) = &prev
            && prev.lease != 0
            && prev.lease != lease
            && let Some(old) = self.leases.get_mut(&prev.lease)
        {
            old.keys.remove(key);
        }
        if let Some(attached) = self.leases.get_mut(&lease) {
            attached.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        events.push(Event {
            event_type: EventType::Put,
            kv,
            prev_kv: prev.clone(),
        });

        PutResponse {
            prev_kv: prev,
            revision,
        }
    }

    fn apply_delete(
        &mut self,
        revision: i64,
        key: &str,
        prefix: bool,
        events: &mut Vec<Event>,
    ) -> DeleteRangeResponse {
        let targets: Vec<String> = self.range(key, prefix).into_iter().map(|kv| kv.key).collect();
        let mut prev_kvs = Vec::with_capacity(targets.len());

        for target in targets {
            let Some(prev) = self.kvs.remove(&target) else {
                continue;
            };
            if let Some(lease) = self.leases.get_mut(&prev.lease) {
                lease.keys.remove(&target);
            }
            events.push(Event {
                event_type: EventType::Delete,
                kv: KeyValue {
                    key: target,
                    mod_revision: revision,
                    ..Default::default()
                },
                prev_kv: Some(prev.clone()),
            });
            prev_kvs.push(prev);
        }

        DeleteRangeResponse {
            deleted: prev_kvs.len() as i64,
            prev_kvs,
            revision,
        }
    }

    /// Publish the events of one write transaction. Transactions that
    /// changed nothing do not consume a revision.
    fn commit(&mut self, revision: i64, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.revision = revision;

        let mut closed = Vec::new();
        for (id, watcher) in &self.watchers {
            let selected = watcher.select(revision, &events);
            if !selected.is_empty() && watcher.tx.send(Ok(selected)).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }

        self.history.push((revision, events));
        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
            self.compacted = self.history.first().map_or(revision, |(rev, _)| *rev);
        }
    }

    fn revoke_lease(&mut self, id: i64) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let revision = self.revision + 1;
        let mut events = Vec::new();
        for key in lease.keys {
            self.apply_delete(revision, &key, false, &mut events);
        }
        self.commit(revision, events);
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!("Lease {:x} expired", id);
            self.revoke_lease(id);
        }
    }
}

// ============================================================================
// Server
// ============================================================================

struct Shared {
    state: Mutex<State>,
    credentials: Option<(String, String)>,
    next_client: AtomicU64,
}

impl Shared {
    /// Lock the state with expired leases already revoked.
    fn lock(&self) -> parking_lot::MutexGuard<'_, State> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state
    }
}

/// In-process etcd server
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct MemoryEtcd {
    shared: Arc<Shared>,
}

impl MemoryEtcd {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Server rejecting clients without these credentials.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::build(Some((username.into(), password.into())))
    }

    fn build(credentials: Option<(String, String)>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_lease: 1,
                history_limit: DEFAULT_HISTORY_LIMIT,
                ..Default::default()
            }),
            credentials,
            next_client: AtomicU64::new(1),
        });

        // Outside a runtime leases still expire lazily on the next request.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(Self::reap(Arc::downgrade(&shared)));
        }

        Self { shared }
    }

    async fn reap(shared: Weak<Shared>) {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            drop(shared.lock());
        }
    }

    /// Keep at most `limit` revisions of watch history.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.shared.lock().history_limit = limit.max(1);
        self
    }

    /// Open a client without going through a connector.
    pub fn client(&self) -> Arc<MemoryEtcdClient> {
        Arc::new(MemoryEtcdClient {
            shared: self.shared.clone(),
            id: self.shared.next_client.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        })
    }

    /// Current revision.
    pub fn revision(&self) -> i64 {
        self.shared.lock().revision
    }

    pub fn lease_count(&self) -> usize {
        self.shared.lock().leases.len()
    }

    /// Terminate every open watch stream, as a server restart would.
    pub fn close_watches(&self) {
        let dropped = std::mem::take(&mut self.shared.lock().watchers);
        info!("Closed {} watch streams", dropped.len());
    }
}

impl Default for MemoryEtcd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EtcdConnector for MemoryEtcd {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn EtcdClient>> {
        if options.endpoints.is_empty() {
            return Err(EtcdError::Unavailable("no endpoints configured".to_string()));
        }

        if let Some((username, password)) = &self.shared.credentials {
            let supplied = options.username.as_deref().zip(options.password.as_deref());
            if supplied != Some((username.as_str(), password.as_str())) {
                return Err(EtcdError::AuthFailed);
            }
        }

        debug!("Connected to in-process etcd via {:?}", options.endpoints);
        Ok(self.client())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client handle onto a [`MemoryEtcd`]
pub struct MemoryEtcdClient {
    shared: Arc<Shared>,
    id: u64,
    closed: AtomicBool,
}

impl MemoryEtcdClient {
    async fn state(&self) -> Result<parking_lot::MutexGuard<'_, State>> {
        tokio::task::yield_now().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(EtcdError::Closed);
        }
        Ok(self.shared.lock())
    }
}

#[async_trait]
impl EtcdClient for MemoryEtcdClient {
    async fn range(&self, key: &str, prefix: bool) -> Result<RangeResponse> {
        let state = self.state().await?;
        Ok(RangeResponse {
            kvs: state.range(key, prefix),
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Bytes, lease: i64) -> Result<PutResponse> {
        let mut state = self.state().await?;
        state.check_lease(lease)?;

        let revision = state.revision + 1;
        let mut events = Vec::new();
        let resp = state.apply_put(revision, key, value, lease, &mut events);
        state.commit(revision, events);
        Ok(resp)
    }

    async fn delete_range(&self, key: &str, prefix: bool) -> Result<DeleteRangeResponse> {
        let mut state = self.state().await?;

        let revision = state.revision + 1;
        let mut events = Vec::new();
        let mut resp = state.apply_delete(revision, key, prefix, &mut events);
        state.commit(revision, events);
        resp.revision = state.revision;
        Ok(resp)
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse> {
        let mut state = self.state().await?;

        let succeeded = request
            .compare
            .iter()
            .all(|cmp| cmp.evaluate(state.kvs.get(&cmp.key)));
        let ops = if succeeded {
            request.success
        } else {
            request.failure
        };

        for op in &ops {
            if let RequestOp::Put { lease, .. } = op {
                state.check_lease(*lease)?;
            }
        }

        let revision = state.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let resp = match op {
                RequestOp::Range { key, prefix } => ResponseOp::Range(RangeResponse {
                    kvs: state.range(&key, prefix),
                    revision,
                }),
                RequestOp::Put { key, value, lease } => {
                    ResponseOp::Put(state.apply_put(revision, &key, value, lease, &mut events))
                }
                RequestOp::DeleteRange { key, prefix } => {
                    ResponseOp::DeleteRange(state.apply_delete(revision, &key, prefix, &mut events))
                }
            };
            responses.push(resp);
        }
        state.commit(revision, events);

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
            responses,
        })
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseGrantResponse> {
        let mut state = self.state().await?;

        let ttl_secs = ttl_secs.max(1);
        let ttl = Duration::from_secs(ttl_secs as u64);
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );

        debug!("Granted lease {:x} with ttl {}s", id, ttl_secs);
        Ok(LeaseGrantResponse { id, ttl: ttl_secs })
    }

    async fn keep_alive_once(&self, id: i64) -> Result<i64> {
        let mut state = self.state().await?;
        let lease = state.leases.get_mut(&id).ok_or(EtcdError::LeaseNotFound)?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(lease.ttl.as_secs() as i64)
    }

    async fn revoke(&self, id: i64) -> Result<()> {
        let mut state = self.state().await?;
        if state.revoke_lease(id) {
            Ok(())
        } else {
            Err(EtcdError::LeaseNotFound)
        }
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream> {
        let mut state = self.state().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        if request.start_revision > 0 && request.start_revision < state.compacted {
            let _ = tx.send(Err(EtcdError::Compacted));
            return Ok(WatchStream::new(rx, || {}));
        }

        let start_revision = if request.start_revision > 0 {
            request.start_revision
        } else {
            state.revision + 1
        };

        let watcher = Watcher {
            client: self.id,
            key: request.key,
            prefix: request.prefix,
            prev_kv: request.prev_kv,
            start_revision,
            tx,
        };

        for (revision, events) in &state.history {
            let selected = watcher.select(*revision, events);
            if !selected.is_empty() {
                let _ = watcher.tx.send(Ok(selected));
            }
        }

        let id = state.next_watcher;
        state.next_watcher += 1;
        state.watchers.insert(id, watcher);

        let shared = Arc::downgrade(&self.shared);
        Ok(WatchStream::new(rx, move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.lock().watchers.remove(&id);
            }
        }))
    }

    async fn compact(&self, revision: i64, physical: bool) -> Result<()> {
        let mut state = self.state().await?;
        if revision > state.revision {
            return Err(EtcdError::FutureRevision);
        }
        if revision <= state.compacted {
            return Err(EtcdError::Compacted);
        }

        state.compacted = revision;
        state.history.retain(|(rev, _)| *rev >= revision);
        debug!("Compacted history before revision {} (physical={})", revision, physical);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id;
        self.shared.state.lock().watchers.retain(|_, w| w.client != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Compare, CompareResult, CompareTarget};

    fn value(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_revisions_and_versions() {
        let server = MemoryEtcd::new();
        let client = server.client();

        client.put("/a", value("1"), 0).await.unwrap();
        client.put("/a", value("2"), 0).await.unwrap();
        client.put("/b", value("x"), 0).await.unwrap();

        let a = client.range("/a", false).await.unwrap().kvs.remove(0);
        assert_eq!(a.create_revision, 1);
        assert_eq!(a.mod_revision, 2);
        assert_eq!(a.version, 2);
        assert_eq!(server.revision(), 3);

        // Deleting nothing does not consume a revision.
        let resp = client.delete_range("/missing", false).await.unwrap();
        assert_eq!(resp.deleted, 0);
        assert_eq!(server.revision(), 3);
    }

    #[tokio::test]
    async fn test_prefix_range_is_byte_prefix() {
        let client = MemoryEtcd::new().client();
        for key in ["/a/x", "/a/y", "/ab", "/b"] {
            client.put(key, value("v"), 0).await.unwrap();
        }
        let keys: Vec<String> = client
            .range("/a", true)
            .await
            .unwrap()
            .kvs
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/a/x", "/a/y", "/ab"]);
    }

    #[tokio::test]
    async fn test_txn_single_revision() {
        let server = MemoryEtcd::new();
        let client = server.client();

        let resp = client
            .txn(TxnRequest {
                compare: vec![Compare::new("/a", CompareTarget::Create(0), CompareResult::Equal)],
                success: vec![
                    RequestOp::Put {
                        key: "/a".to_string(),
                        value: value("1"),
                        lease: 0,
                    },
                    RequestOp::Put {
                        key: "/b".to_string(),
                        value: value("2"),
                        lease: 0,
                    },
                ],
                failure: vec![],
            })
            .await
            .unwrap();
        assert!(resp.succeeded);
        assert_eq!(resp.revision, 1);
        assert_eq!(server.revision(), 1);
    }

    #[tokio::test]
    async fn test_txn_rejects_unknown_lease_without_side_effects() {
        let client = MemoryEtcd::new().client();
        let err = client
            .txn(TxnRequest {
                success: vec![
                    RequestOp::Put {
                        key: "/a".to_string(),
                        value: value("1"),
                        lease: 0,
                    },
                    RequestOp::Put {
                        key: "/b".to_string(),
                        value: value("2"),
                        lease: 99,
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, EtcdError::LeaseNotFound);
        assert!(client.range("/a", false).await.unwrap().kvs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let server = MemoryEtcd::new();
        let client = server.client();

        let lease = client.grant(1).await.unwrap();
        client.put("/ttl", value("v"), lease.id).await.unwrap();
        assert_eq!(server.lease_count(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(client.range("/ttl", false).await.unwrap().kvs.is_empty());
        assert_eq!(server.lease_count(), 0);
        assert_eq!(
            client.keep_alive_once(lease.id).await.unwrap_err(),
            EtcdError::LeaseNotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_lease() {
        let client = MemoryEtcd::new().client();
        let lease = client.grant(1).await.unwrap();
        client.put("/ttl", value("v"), lease.id).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            client.keep_alive_once(lease.id).await.unwrap();
        }
        assert_eq!(client.range("/ttl", false).await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_replay_and_prev_kv() {
        let client = MemoryEtcd::new().client();
        client.put("/w", value("1"), 0).await.unwrap();
        client.put("/w", value("2"), 0).await.unwrap();

        let mut stream = client
            .watch(WatchRequest {
                key: "/w".to_string(),
                prefix: false,
                start_revision: 2,
                prev_kv: true,
            })
            .await
            .unwrap();

        let batch = stream.message().await.unwrap().unwrap();
        assert_eq!(batch[0].kv.value, value("2"));
        assert_eq!(batch[0].prev_kv.as_ref().unwrap().value, value("1"));

        client.delete_range("/w", false).await.unwrap();
        let batch = stream.message().await.unwrap().unwrap();
        assert_eq!(batch[0].event_type, EventType::Delete);
        assert_eq!(batch[0].kv.mod_revision, 3);
    }

    #[tokio::test]
    async fn test_watch_compacted_revision() {
        let client = MemoryEtcd::new().client();
        for i in 0..4 {
            client.put("/c", value(&i.to_string()), 0).await.unwrap();
        }
        client.compact(3, false).await.unwrap();
        assert_eq!(client.compact(2, false).await.unwrap_err(), EtcdError::Compacted);
        assert_eq!(client.compact(10, false).await.unwrap_err(), EtcdError::FutureRevision);

        let mut stream = client
            .watch(WatchRequest {
                key: "/c".to_string(),
                start_revision: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stream.message().await.unwrap().unwrap_err(), EtcdError::Compacted);
        assert!(stream.message().await.is_none());
    }

    #[tokio::test]
    async fn test_history_limit_compacts_oldest() {
        let client = MemoryEtcd::new().with_history_limit(2).client();
        for i in 1..=4 {
            client.put("/h", value(&i.to_string()), 0).await.unwrap();
        }

        let mut old = client
            .watch(WatchRequest {
                key: "/h".to_string(),
                start_revision: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(old.message().await.unwrap().unwrap_err(), EtcdError::Compacted);

        let mut kept = client
            .watch(WatchRequest {
                key: "/h".to_string(),
                start_revision: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(kept.message().await.unwrap().unwrap()[0].kv.value, value("3"));
        assert_eq!(kept.message().await.unwrap().unwrap()[0].kv.value, value("4"));
        assert_eq!(client.compact(3, false).await.unwrap_err(), EtcdError::Compacted);
    }

    #[tokio::test]
    async fn test_close_watches_ends_streams() {
        let server = MemoryEtcd::new();
        let client = server.client();
        let mut stream = client
            .watch(WatchRequest {
                key: "/".to_string(),
                prefix: true,
                ..Default::default()
            })
            .await
            .unwrap();

        server.close_watches();
        assert!(stream.message().await.is_none());
    }

    #[tokio::test]
    async fn test_connector_checks_credentials() {
        let server = MemoryEtcd::with_credentials("root", "pw");
        let endpoints = vec!["mem://etcd".to_string()];

        let denied = server
            .connect(ClientOptions {
                endpoints: endpoints.clone(),
                ..Default::default()
            })
            .await;
        assert_eq!(denied.err(), Some(EtcdError::AuthFailed));

        let allowed = server
            .connect(ClientOptions {
                endpoints,
                username: Some("root".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            })
            .await;
        assert!(allowed.is_ok());

        let empty = server.connect(ClientOptions::default()).await;
        assert!(matches!(empty.err(), Some(EtcdError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let client = MemoryEtcd::new().client();
        client.close().await;
        assert_eq!(client.range("/a", false).await.unwrap_err(), EtcdError::Closed);
    }
}
