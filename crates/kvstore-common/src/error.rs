//! Error taxonomy shared by every backend
//!
//! Precondition failures are always reported with one of the canonical kinds
//! below, so callers never need to inspect backend-specific errors to tell a
//! lost CAS race from a missing key. Everything else coming out of a native
//! client is carried unchanged inside [`StoreError::Backend`].

/// Canonical store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found in store")]
    KeyNotFound,

    #[error("key exists in store")]
    KeyExists,

    #[error("unable to complete atomic operation, key modified")]
    KeyModified,

    #[error("previous K/V pair should be provided for the atomic operation")]
    PreviousNotSpecified,

    #[error("watch stream terminated by the backend")]
    WatchFail,

    #[error("lock is not held")]
    LockNotHeld,

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("backend storage not supported: '{0}'")]
    BackendNotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Wrap a native client error without altering it.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(anyhow::Error::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound)
    }

    /// True for cancellation or an expired deadline.
    pub fn is_context_error(&self) -> bool {
        matches!(self, StoreError::Cancelled | StoreError::DeadlineExceeded)
    }

    /// Downcast the wrapped native error, if this is a backend error.
    pub fn downcast_backend<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self {
            StoreError::Backend(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
