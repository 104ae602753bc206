//! Canonical result, event and option types returned by every backend

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Immutable snapshot of one key at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KVPair {
    pub key: String,
    pub value: Bytes,
    /// Backend modification counter, used as the CAS baseline
    pub index: u64,
    /// Per-key write counter, 1 on creation
    pub version: u64,
    /// Lease or session binding, 0 when the key never expires
    pub lease: u64,
}

impl KVPair {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            index,
            version: 0,
            lease: 0,
        }
    }

    /// Key-only pair used for delete notifications.
    pub fn tombstone(key: impl Into<String>, index: u64) -> Self {
        Self::new(key, Bytes::new(), index)
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_lease(mut self, lease: u64) -> Self {
        self.lease = lease;
        self
    }

    /// Value as UTF-8, lossy.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchAction {
    Put,
    Delete,
}

impl WatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchAction::Put => "put",
            WatchAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One change delivered on a watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    /// State after the event; for deletes the key with an empty value
    pub node: Option<KVPair>,
    /// State before the event, when the backend reports it
    pub pre_node: Option<KVPair>,
}

impl WatchEvent {
    pub fn put(node: KVPair, pre_node: Option<KVPair>) -> Self {
        Self {
            action: WatchAction::Put,
            node: Some(node),
            pre_node,
        }
    }

    pub fn delete(node: Option<KVPair>, pre_node: Option<KVPair>) -> Self {
        Self {
            action: WatchAction::Delete,
            node,
            pre_node,
        }
    }

    /// Key the event refers to.
    pub fn key(&self) -> Option<&str> {
        self.node
            .as_ref()
            .or(self.pre_node.as_ref())
            .map(|pair| pair.key.as_str())
    }
}

/// Item delivered on a watch channel. An `Err` is always the last item.
pub type WatchResponse = Result<WatchEvent, StoreError>;

/// Receiving half handed to watch callers
pub type WatchReceiver = tokio::sync::mpsc::Receiver<WatchResponse>;

/// Capacity of the per-watch delivery channel
pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Options for write operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Zero means no expiration
    pub ttl: Duration,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }

    /// TTL of the write, `None` when the key never expires.
    pub fn ttl_of(opts: Option<&WriteOptions>) -> Option<Duration> {
        opts.map(|o| o.ttl).filter(|ttl| !ttl.is_zero())
    }
}

/// Options for watch operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Revision to resume from, 0 for "now"
    pub index: u64,
}

/// Options for distributed locks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Session TTL, zero selects the backend default
    pub ttl: Duration,
    /// Optional payload stored on the contender key
    pub value: Option<Bytes>,
}

/// TLS material handed to the native client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Client configuration passed through to backend constructors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub tls: Option<TlsConfig>,
    pub connection_timeout: Option<Duration>,
    pub username: String,
    pub password: String,
}

impl Config {
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }
}
