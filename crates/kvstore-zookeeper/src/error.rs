//! Native ZooKeeper client errors

use kvstore_common::StoreError;

/// Errors reported by a ZooKeeper client, named after the server codes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZkError {
    #[error("node does not exist")]
    NoNode,

    #[error("node already exists")]
    NodeExists,

    #[error("version conflict")]
    BadVersion,

    #[error("node has children")]
    NotEmpty,

    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,

    #[error("session has been expired by the server")]
    SessionExpired,

    #[error("connection to the server has been lost")]
    ConnectionLoss,

    #[error("client authentication failed")]
    AuthFailed,

    #[error("invalid arguments: {0}")]
    BadArguments(String),

    #[error("multi op {index} failed: {cause}")]
    MultiFailed { index: usize, cause: Box<ZkError> },
}

impl ZkError {
    /// Code of the failing operation, looking through `MultiFailed`.
    pub fn cause(&self) -> &ZkError {
        match self {
            ZkError::MultiFailed { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// True when the failure means the node state changed underneath the
    /// request, so re-reading and retrying can succeed.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self.cause(),
            ZkError::NoNode | ZkError::NodeExists | ZkError::BadVersion | ZkError::NotEmpty
        )
    }
}

pub type Result<T> = std::result::Result<T, ZkError>;

impl From<ZkError> for StoreError {
    fn from(err: ZkError) -> Self {
        StoreError::backend(err)
    }
}
