//! Native etcd client errors

use kvstore_common::StoreError;

/// Errors reported by an etcd client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EtcdError {
    #[error("etcd unavailable: {0}")]
    Unavailable(String),

    #[error("etcd authentication failed")]
    AuthFailed,

    #[error("requested lease not found")]
    LeaseNotFound,

    #[error("required revision has been compacted")]
    Compacted,

    #[error("required revision is a future revision")]
    FutureRevision,

    #[error("etcd client is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EtcdError>;

impl From<EtcdError> for StoreError {
    fn from(err: EtcdError) -> Self {
        StoreError::backend(err)
    }
}
