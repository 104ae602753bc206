//! kvstore ZooKeeper - ZooKeeper backend
//!
//! This crate provides:
//! - The native ZooKeeper client interface (`ZkClient`, `ZkConnector`)
//! - `ZookeeperStore`, the `Store` implementation over znodes
//! - `ZookeeperLocker`, a session-bound mutex
//! - `MemoryZk`, an in-process reference server

pub mod client;
pub mod error;
pub mod lock;
pub mod memory;
pub mod store;
mod txn;
mod watch;

// Re-exports for convenience
pub use client::{ClientOptions, ZkClient, ZkConnector};
pub use error::ZkError;
pub use lock::{DEFAULT_LOCK_TTL, ZookeeperLocker};
pub use memory::{MemoryZk, MemoryZkClient};
pub use store::{BACKEND_NAME, ZookeeperStore};
