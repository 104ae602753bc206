//! kvstore etcd - etcd v3 backend
//!
//! This crate provides:
//! - The native etcd v3 client interface (`EtcdClient`, `EtcdConnector`)
//! - `EtcdStore`, the `Store` implementation over that interface
//! - `EtcdLocker`, a lease-bound mutex
//! - `MemoryEtcd`, an in-process reference server

pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
pub mod store;
mod txn;
mod watch;

// Re-exports for convenience
pub use client::{ClientOptions, EtcdClient, EtcdConnector};
pub use error::EtcdError;
pub use lock::{DEFAULT_LOCK_TTL, EtcdLocker};
pub use memory::{MemoryEtcd, MemoryEtcdClient};
pub use store::{BACKEND_NAME, EtcdStore};
