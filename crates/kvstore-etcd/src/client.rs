//! etcd v3 native client interface
//!
//! The adapter talks to etcd exclusively through [`EtcdClient`]. Types here
//! mirror the etcd v3 KV, Lease and Watch APIs: signed revisions, lease ids,
//! byte-prefix ranges and compare/then/else transactions.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use kvstore_common::Config;

use crate::error::Result;

// ============================================================================
// KV Models
// ============================================================================

/// Stored key-value record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub prev_kv: Option<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRangeResponse {
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
    pub revision: i64,
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    Greater,
    Less,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    Create(i64),
    Mod(i64),
    Value(Bytes),
    Lease(i64),
}

/// Compare predicate evaluated against the current state of `key`
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

    /// Evaluate against a record. A missing key has zero revisions and an
    /// empty value.
    pub fn evaluate(&self, kv: Option<&KeyValue>) -> bool {
        let empty = KeyValue::default();
        let kv = kv.unwrap_or(&empty);
        match &self.target {
            CompareTarget::Version(v) => compare_values(kv.version, *v, self.result),
            CompareTarget::Create(v) => compare_values(kv.create_revision, *v, self.result),
            CompareTarget::Mod(v) => compare_values(kv.mod_revision, *v, self.result),
            CompareTarget::Lease(v) => compare_values(kv.lease, *v, self.result),
            CompareTarget::Value(v) => compare_bytes(&kv.value, v, self.result),
        }
    }
}

fn compare_values(actual: i64, expected: i64, result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == expected,
        CompareResult::NotEqual => actual != expected,
        CompareResult::Greater => actual > expected,
        CompareResult::Less => actual < expected,
    }
}

fn compare_bytes(actual: &[u8], expected: &[u8], result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == expected,
        CompareResult::NotEqual => actual != expected,
        CompareResult::Greater => actual > expected,
        CompareResult::Less => actual < expected,
    }
}

/// Operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    Range {
        key: String,
        prefix: bool,
    },
    Put {
        key: String,
        value: Bytes,
        lease: i64,
    },
    DeleteRange {
        key: String,
        prefix: bool,
    },
}

#[derive(Debug, Clone)]
pub enum ResponseOp {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
}

#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: i64,
    pub responses: Vec<ResponseOp>,
}

// ============================================================================
// Lease Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrantResponse {
    pub id: i64,
    /// Granted TTL in seconds
    pub ttl: i64,
}

// ============================================================================
// Watch Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// One change in a watch response
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    /// State after the change. For deletes only the key and the deleting
    /// revision are set.
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub key: String,
    pub prefix: bool,
    /// Revision to start from, 0 for the next revision
    pub start_revision: i64,
    pub prev_kv: bool,
}

type WatchCancel = Box<dyn FnOnce() + Send>;

/// Server side of an established watch
///
/// Yields one batch of events per revision. The server-side watcher is
/// cancelled when the stream is dropped.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<Result<Vec<Event>>>,
    cancel: Option<WatchCancel>,
}

impl WatchStream {
    pub fn new(
        rx: mpsc::UnboundedReceiver<Result<Vec<Event>>>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next watch response, `None` once the server closed the stream.
    pub async fn message(&mut self) -> Option<Result<Vec<Event>>> {
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

// ============================================================================
// Client
// ============================================================================

/// etcd v3 client API consumed by the store
#[async_trait]
pub trait EtcdClient: Send + Sync {
    async fn range(&self, key: &str, prefix: bool) -> Result<RangeResponse>;

    async fn put(&self, key: &str, value: Bytes, lease: i64) -> Result<PutResponse>;

    async fn delete_range(&self, key: &str, prefix: bool) -> Result<DeleteRangeResponse>;

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse>;

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseGrantResponse>;

    /// Refresh a lease, returning the TTL it was reset to.
    async fn keep_alive_once(&self, id: i64) -> Result<i64>;

    /// Revoke a lease and delete every key attached to it.
    async fn revoke(&self, id: i64) -> Result<()>;

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream>;

    async fn compact(&self, revision: i64, physical: bool) -> Result<()>;

    async fn close(&self);
}

/// Connection options handed to a connector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub endpoints: Vec<String>,
    pub dial_timeout: Option<Duration>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ClientOptions {
    /// Build options for `endpoints`, passing `config` through untouched.
    pub fn from_config(endpoints: &[String], config: Option<&Config>) -> Self {
        let mut options = ClientOptions {
            endpoints: endpoints.to_vec(),
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
                options.dial_timeout = Some(timeout);
            }
            if config.has_auth() {
                options.username = Some(config.username.clone());
                options.password = Some(config.password.clone());
            }
        }

        options
    }
}

/// Opens client connections
#[async_trait]
pub trait EtcdConnector: Send + Sync {
    async fn connect(&self, options: ClientOptions) -> Result<std::sync::Arc<dyn EtcdClient>>;
}
