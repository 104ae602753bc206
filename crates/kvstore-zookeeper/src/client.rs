//! ZooKeeper native client interface
//!
//! Mirrors the ZooKeeper 3.6+ client API the adapter needs: znodes with
//! `Stat`, versioned writes, sequential / ephemeral / TTL create modes,
//! `multi`, and persistent (optionally recursive) watches.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use kvstore_common::Config;
pub(crate) use kvstore_common::key::is_within;

use crate::error::Result;

/// Session timeout used when the caller does not configure one
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// High byte marking an `ephemeral_owner` as a TTL encoding
pub const TTL_OWNER_MARK: i64 = 0xFF << 56;

/// Node metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    /// Zxid of the last child list change
    pub pzxid: i64,
    /// Data version, 0 on creation
    pub version: i32,
    pub cversion: i32,
    /// Owning session for ephemeral nodes, TTL encoding for TTL nodes
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

impl Stat {
    /// TTL of a TTL node, `None` for any other node.
    pub fn ttl(&self) -> Option<Duration> {
        if self.ephemeral_owner & TTL_OWNER_MARK == TTL_OWNER_MARK {
            Some(Duration::from_millis(
                (self.ephemeral_owner & !TTL_OWNER_MARK) as u64,
            ))
        } else {
            None
        }
    }
}

/// Encode a TTL into the `ephemeral_owner` field.
pub fn ttl_owner(ttl: Duration) -> i64 {
    TTL_OWNER_MARK | (ttl.as_millis() as i64 & !TTL_OWNER_MARK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
    /// Removed by the server once it has no children and has not been
    /// modified for the TTL
    PersistentWithTtl(Duration),
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Operation inside a `multi`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZkOp {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Bytes,
        /// `None` matches any version
        version: Option<i32>,
    },
    Delete {
        path: String,
        version: Option<i32>,
    },
    Check {
        path: String,
        version: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Create { path: String, stat: Stat },
    SetData { stat: Stat },
    Delete,
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
    /// Zxid of the change that fired the event
    pub zxid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddWatchMode {
    /// Data, existence and child events for one node
    Persistent,
    /// Data and existence events for a node and all its descendants
    PersistentRecursive,
}

type WatchCancel = Box<dyn FnOnce() + Send>;

/// Event stream of a persistent watch
///
/// Ends when the owning session closes or expires. Dropping the stream
/// removes the watch from the server.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchedEvent>,
    cancel: Option<WatchCancel>,
}

impl WatchStream {
    pub fn new(
        rx: mpsc::UnboundedReceiver<WatchedEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub async fn next(&mut self) -> Option<WatchedEvent> {
        self.rx.recv().await
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

/// ZooKeeper client bound to one session
#[async_trait]
pub trait ZkClient: Send + Sync {
    /// Create a node, returning its actual path (sequential nodes get a
    /// suffix) and its stat.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<(String, Stat)>;

    async fn get_data(&self, path: &str) -> Result<(Bytes, Stat)>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    async fn set_data(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat>;

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Child names, unsorted, plus the parent stat.
    async fn get_children(&self, path: &str) -> Result<(Vec<String>, Stat)>;

    /// Apply every op or none.
    async fn multi(&self, ops: Vec<ZkOp>) -> Result<Vec<OpResult>>;

    async fn add_watch(&self, path: &str, mode: AddWatchMode) -> Result<WatchStream>;

    /// Open a second session on the same ensemble with its own timeout.
    async fn open_session(&self, timeout: Duration) -> Result<Arc<dyn ZkClient>>;

    fn session_id(&self) -> i64;

    /// Close the session, deleting its ephemeral nodes.
    async fn close(&self);
}

/// Connection options handed to a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub servers: Vec<String>,
    pub session_timeout: Duration,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    /// `digest` scheme credentials
    pub digest: Option<(String, String)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            ca_file: None,
            cert_file: None,
            key_file: None,
            insecure_skip_verify: false,
            digest: None,
        }
    }
}

impl ClientOptions {
    /// The connection timeout doubles as the session timeout.
    pub fn from_config(servers: &[String], config: Option<&Config>) -> Self {
        let mut options = ClientOptions {
            servers: servers.to_vec(),
            ..Default::default()
        };

        if let Some(config) = config {
            if let Some(tls) = &config.tls {
                options.ca_file = tls.ca_file.clone();
                options.cert_file = tls.cert_file.clone();
                options.key_file = tls.key_file.clone();
                options.insecure_skip_verify = tls.insecure_skip_verify;
            }
            if let Some(timeout) = config.connection_timeout
                && !timeout.is_zero()
            {
                options.session_timeout = timeout;
            }
            if config.has_auth() {
                options.digest = Some((config.username.clone(), config.password.clone()));
            }
        }

        options
    }
}

/// Opens sessions
#[async_trait]
pub trait ZkConnector: Send + Sync {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn ZkClient>>;
}
