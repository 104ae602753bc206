//! kvstore - Backend-agnostic key-value coordination store
//!
//! This crate ties the backends together:
//! - `Backend` names of the built-in backends
//! - `StoreRegistry`, an explicit map from backend name to constructor
//! - `StoreSettings`, store selection loaded from a file and the environment
//!
//! The contract types are re-exported from `kvstore-common`.

pub mod backend;
pub mod registry;
pub mod settings;

// Re-exports for convenience
pub use backend::Backend;
pub use kvstore_common::*;
pub use registry::{Constructor, StoreFuture, StoreRegistry};
pub use settings::StoreSettings;

pub use kvstore_etcd as etcd;
pub use kvstore_zookeeper as zookeeper;
