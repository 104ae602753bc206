//! In-process ZooKeeper reference server
//!
//! Single-node znode tree implementing the native primitives the adapter
//! relies on: a global zxid, per-node data versions, sequential and
//! ephemeral nodes, TTL nodes, atomic `multi`, persistent and recursive
//! watches, and sessions kept alive by client heartbeats.
//!
//! The tree lives behind one mutex, and every request yields once before
//! taking it so concurrent callers interleave. Sessions live in a separate
//! table so heartbeats never contend with requests. Expired sessions and TTL
//! nodes are swept on every request and by a background reaper task.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{
    AddWatchMode, ClientOptions, CreateMode, EventType, OpResult, Stat, WatchStream,
    WatchedEvent, ZkClient, ZkConnector, ZkOp, is_within, ttl_owner,
};
use crate::error::{Result, ZkError};

/// Interval of the background session and TTL reaper
pub const REAPER_INTERVAL: Duration = Duration::from_millis(100);

const MIN_PING_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Tree
// ============================================================================

#[derive(Clone)]
struct Node {
    data: Bytes,
    stat: Stat,
    children: BTreeSet<String>,
    modified: Instant,
}

struct Watcher {
    session: i64,
    path: String,
    mode: AddWatchMode,
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watcher {
    fn wants(&self, event: &WatchedEvent) -> bool {
        match self.mode {
            AddWatchMode::Persistent => event.path == self.path,
            AddWatchMode::PersistentRecursive => {
                event.event_type != EventType::NodeChildrenChanged
                    && is_within(&event.path, &self.path)
            }
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ZkError::BadArguments(format!("path must start with '/': {}", path)));
    }
    if path.len() > 1 && (path.ends_with('/') || path.contains("//")) {
        return Err(ZkError::BadArguments(format!("invalid path: {}", path)));
    }
    Ok(())
}

fn event(event_type: EventType, path: &str, zxid: i64) -> WatchedEvent {
    WatchedEvent {
        event_type,
        path: path.to_string(),
        zxid,
    }
}

struct State {
    zxid: i64,
    nodes: BTreeMap<String, Node>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
}

impl State {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Bytes::new(),
                stat: Stat::default(),
                children: BTreeSet::new(),
                modified: Instant::now(),
            },
        );
        Self {
            zxid: 0,
            nodes,
            watchers: HashMap::new(),
            next_watcher: 1,
        }
    }

    fn node(&self, path: &str) -> Result<&Node> {
        validate(path)?;
        self.nodes.get(path).ok_or(ZkError::NoNode)
    }

    fn create(
        &mut self,
        zxid: i64,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        session: i64,
        events: &mut Vec<WatchedEvent>,
    ) -> Result<(String, Stat)> {
        validate(path)?;
        let parent_path = parent_of(path).ok_or(ZkError::NodeExists)?.to_string();
        let parent = self.nodes.get(&parent_path).ok_or(ZkError::NoNode)?;
        if parent.stat.ephemeral_owner != 0 && parent.stat.ttl().is_none() {
            return Err(ZkError::NoChildrenForEphemerals);
        }

        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(ZkError::NodeExists);
        }

        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.insert(name_of(&actual).to_string());
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children += 1;
        }

        let ephemeral_owner = match mode {
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => session,
            CreateMode::PersistentWithTtl(ttl) => ttl_owner(ttl),
            CreateMode::Persistent | CreateMode::PersistentSequential => 0,
        };
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            version: 0,
            cversion: 0,
            ephemeral_owner,
            data_length: data.len() as i32,
            num_children: 0,
        };
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                stat,
                children: BTreeSet::new(),
                modified: Instant::now(),
            },
        );

        events.push(event(EventType::NodeCreated, &actual, zxid));
        events.push(event(EventType::NodeChildrenChanged, &parent_path, zxid));
        Ok((actual, stat))
    }

    fn set_data(
        &mut self,
        zxid: i64,
        path: &str,
        data: Bytes,
        version: Option<i32>,
        events: &mut Vec<WatchedEvent>,
    ) -> Result<Stat> {
        validate(path)?;
        let node = self.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if let Some(expected) = version
            && expected != node.stat.version
        {
            return Err(ZkError::BadVersion);
        }

        node.stat.data_length = data.len() as i32;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.data = data;
        node.modified = Instant::now();

        events.push(event(EventType::NodeDataChanged, path, zxid));
        Ok(node.stat)
    }

    fn delete(
        &mut self,
        zxid: i64,
        path: &str,
        version: Option<i32>,
        events: &mut Vec<WatchedEvent>,
    ) -> Result<()> {
        let node = self.node(path)?;
        let Some(parent_path) = parent_of(path).map(str::to_string) else {
            return Err(ZkError::BadArguments("cannot delete the root node".to_string()));
        };
        if let Some(expected) = version
            && expected != node.stat.version
        {
            return Err(ZkError::BadVersion);
        }
        if !node.children.is_empty() {
            return Err(ZkError::NotEmpty);
        }

        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.children.remove(name_of(path));
            parent.stat.cversion += 1;
            parent.stat.pzxid = zxid;
            parent.stat.num_children -= 1;
        }

        events.push(event(EventType::NodeDeleted, path, zxid));
        events.push(event(EventType::NodeChildrenChanged, &parent_path, zxid));
        Ok(())
    }

    fn check(&self, path: &str, version: i32) -> Result<()> {
        if self.node(path)?.stat.version != version {
            return Err(ZkError::BadVersion);
        }
        Ok(())
    }

    fn apply(
        &mut self,
        zxid: i64,
        op: ZkOp,
        session: i64,
        events: &mut Vec<WatchedEvent>,
    ) -> Result<OpResult> {
        match op {
            ZkOp::Create { path, data, mode } => {
                let (path, stat) = self.create(zxid, &path, data, mode, session, events)?;
                Ok(OpResult::Create { path, stat })
            }
            ZkOp::SetData {
                path,
                data,
                version,
            } => Ok(OpResult::SetData {
                stat: self.set_data(zxid, &path, data, version, events)?,
            }),
            ZkOp::Delete { path, version } => {
                self.delete(zxid, &path, version, events)?;
                Ok(OpResult::Delete)
            }
            ZkOp::Check { path, version } => {
                self.check(&path, version)?;
                Ok(OpResult::Check)
            }
        }
    }

    /// Publish the events of one committed request. Requests that changed
    /// nothing do not consume a zxid.
    fn commit(&mut self, zxid: i64, events: Vec<WatchedEvent>) {
        if events.is_empty() {
            return;
        }
        self.zxid = zxid;

        let mut closed = Vec::new();
        for (id, watcher) in &self.watchers {
            for ev in events.iter().filter(|ev| watcher.wants(ev)) {
                if watcher.tx.send(ev.clone()).is_err() {
                    closed.push(*id);
                    break;
                }
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }
    }

    fn close_session(&mut self, session: i64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();

        let zxid = self.zxid + 1;
        let mut events = Vec::new();
        for path in owned {
            let _ = self.delete(zxid, &path, None, &mut events);
        }
        self.commit(zxid, events);
        self.watchers.retain(|_, w| w.session != session);
    }

    fn expire_ttl_nodes(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.children.is_empty()
                    && node.stat.ttl().is_some_and(|ttl| node.modified + ttl <= now)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in expired {
            let zxid = self.zxid + 1;
            let mut events = Vec::new();
            if self.delete(zxid, &path, None, &mut events).is_ok() {
                debug!("TTL node {} expired", path);
            }
            self.commit(zxid, events);
        }
    }
}

// ============================================================================
// Server
// ============================================================================

struct SessionInfo {
    timeout: Duration,
    deadline: Instant,
}

struct Shared {
    state: Mutex<State>,
    sessions: DashMap<i64, SessionInfo>,
    next_session: AtomicI64,
    digest: Option<(String, String)>,
}

impl Shared {
    fn sweep(&self, state: &mut State, now: Instant) {
        let expired: Vec<i64> = self
            .sessions
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        for session in expired {
            self.sessions.remove(&session);
            info!("Session {:x} expired", session);
            state.close_session(session);
        }
        state.expire_ttl_nodes(now);
    }

    /// Lock the tree for a request on `session`, counting the request as a
    /// heartbeat.
    fn enter(&self, session: i64) -> Result<MutexGuard<'_, State>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.sweep(&mut state, now);

        match self.sessions.get_mut(&session) {
            Some(mut info) => {
                info.deadline = now + info.timeout;
                Ok(state)
            }
            None => Err(ZkError::SessionExpired),
        }
    }

    fn ping(&self, session: i64) -> bool {
        let now = Instant::now();
        match self.sessions.get_mut(&session) {
            // A late ping does not revive a session the server already
            // considers dead.
            Some(mut info) if info.deadline > now => {
                info.deadline = now + info.timeout;
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// In-process ZooKeeper server
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct MemoryZk {
    shared: Arc<Shared>,
}

impl MemoryZk {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Server requiring `digest` credentials.
    pub fn with_digest(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::build(Some((username.into(), password.into())))
    }

    fn build(digest: Option<(String, String)>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            sessions: DashMap::new(),
            next_session: AtomicI64::new(0x1_0000_0001),
            digest,
        });

        // Outside a runtime expiry still happens on the next request.
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
            let mut state = shared.state.lock();
            shared.sweep(&mut state, Instant::now());
        }
    }

    /// Open a session without going through a connector.
    pub fn open(&self, timeout: Duration) -> Arc<MemoryZkClient> {
        let session = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared.sessions.insert(
            session,
            SessionInfo {
                timeout,
                deadline: Instant::now() + timeout,
            },
        );

        let heartbeat = tokio::runtime::Handle::try_current().ok().map(|handle| {
            handle.spawn(heartbeat(Arc::downgrade(&self.shared), session, timeout))
        });

        debug!("Opened session {:x} with timeout {:?}", session, timeout);
        Arc::new(MemoryZkClient {
            shared: self.shared.clone(),
            session,
            heartbeat,
            closed: AtomicBool::new(false),
        })
    }

    pub fn zxid(&self) -> i64 {
        self.shared.state.lock().zxid
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Expire `session` now, as if its heartbeats had stopped.
    pub fn expire_session(&self, session: i64) {
        if self.shared.sessions.remove(&session).is_some() {
            self.shared.state.lock().close_session(session);
        }
    }

    /// Terminate every open watch, as a server restart would.
    pub fn close_watches(&self) {
        let dropped = std::mem::take(&mut self.shared.state.lock().watchers);
        info!("Closed {} watches", dropped.len());
    }
}

impl Default for MemoryZk {
    fn default() -> Self {
        Self::new()
    }
}

async fn heartbeat(shared: Weak<Shared>, session: i64, timeout: Duration) {
    let mut interval = tokio::time::interval((timeout / 3).max(MIN_PING_INTERVAL));
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.ping(session) {
            return;
        }
    }
}

#[async_trait]
impl ZkConnector for MemoryZk {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn ZkClient>> {
        if options.servers.is_empty() {
            return Err(ZkError::ConnectionLoss);
        }
        if let Some(expected) = &self.shared.digest
            && options.digest.as_ref() != Some(expected)
        {
            return Err(ZkError::AuthFailed);
        }
        Ok(self.open(options.session_timeout))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Session handle onto a [`MemoryZk`]
///
/// Dropping the handle stops its heartbeats without closing the session, so
/// the server expires it after the session timeout.
pub struct MemoryZkClient {
    shared: Arc<Shared>,
    session: i64,
    heartbeat: Option<JoinHandle<()>>,
    closed: AtomicBool,
}

impl MemoryZkClient {
    /// Every request suspends once, as a network round-trip would.
    async fn state(&self) -> Result<MutexGuard<'_, State>> {
        tokio::task::yield_now().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ZkError::SessionExpired);
        }
        self.shared.enter(self.session)
    }
}

/// Run one write request at the next zxid.
fn write<T>(
    mut state: MutexGuard<'_, State>,
    f: impl FnOnce(&mut State, i64, &mut Vec<WatchedEvent>) -> Result<T>,
) -> Result<T> {
    let zxid = state.zxid + 1;
    let mut events = Vec::new();
    let out = f(&mut state, zxid, &mut events)?;
    state.commit(zxid, events);
    Ok(out)
}

impl Drop for MemoryZkClient {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[async_trait]
impl ZkClient for MemoryZkClient {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<(String, Stat)> {
        let session = self.session;
        write(self.state().await?, |state, zxid, events| {
            state.create(zxid, path, data, mode, session, events)
        })
    }

    async fn get_data(&self, path: &str) -> Result<(Bytes, Stat)> {
        let state = self.state().await?;
        let node = state.node(path)?;
        Ok((node.data.clone(), node.stat))
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let state = self.state().await?;
        match state.node(path) {
            Ok(node) => Ok(Some(node.stat)),
            Err(ZkError::NoNode) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_data(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat> {
        write(self.state().await?, |state, zxid, events| {
            state.set_data(zxid, path, data, version, events)
        })
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        write(self.state().await?, |state, zxid, events| {
            state.delete(zxid, path, version, events)
        })
    }

    async fn get_children(&self, path: &str) -> Result<(Vec<String>, Stat)> {
        let state = self.state().await?;
        let node = state.node(path)?;
        Ok((node.children.iter().cloned().collect(), node.stat))
    }

    async fn multi(&self, ops: Vec<ZkOp>) -> Result<Vec<OpResult>> {
        let session = self.session;
        write(self.state().await?, |state, zxid, events| {
            let snapshot = state.nodes.clone();
            let mut results = Vec::with_capacity(ops.len());
            for (index, op) in ops.into_iter().enumerate() {
                match state.apply(zxid, op, session, events) {
                    Ok(result) => results.push(result),
                    Err(cause) => {
                        state.nodes = snapshot;
                        events.clear();
                        return Err(ZkError::MultiFailed {
                            index,
                            cause: Box::new(cause),
                        });
                    }
                }
            }
            Ok(results)
        })
    }

    async fn add_watch(&self, path: &str, mode: AddWatchMode) -> Result<WatchStream> {
        validate(path)?;
        let mut state = self.state().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let id = state.next_watcher;
        state.next_watcher += 1;
        state.watchers.insert(
            id,
            Watcher {
                session: self.session,
                path: path.to_string(),
                mode,
                tx,
            },
        );

        let shared = Arc::downgrade(&self.shared);
        Ok(WatchStream::new(rx, move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.lock().watchers.remove(&id);
            }
        }))
    }

    async fn open_session(&self, timeout: Duration) -> Result<Arc<dyn ZkClient>> {
        drop(self.state().await?);
        Ok(MemoryZk {
            shared: self.shared.clone(),
        }
        .open(timeout))
    }

    fn session_id(&self) -> i64 {
        self.session
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.sessions.remove(&self.session).is_some() {
            self.shared.state.lock().close_session(self.session);
        }
        debug!("Closed session {:x}", self.session);
    }
}
