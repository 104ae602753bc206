//! kvstore Common - Shared types, traits, and key handling
//!
//! This crate provides the contract every kvstore backend implements:
//! - Key normalization
//! - `KVPair` and watch event model
//! - Error taxonomy
//! - Cancellation context
//! - `Store` / `Locker` traits and the transaction model
//! - The watch delivery loop shared by all backends

pub mod context;
pub mod error;
pub mod key;
pub mod model;
pub mod traits;
pub mod txn;
pub mod watch;

// Re-exports for convenience
pub use context::Context;
pub use error::{Result, StoreError};
pub use key::normalize;
pub use model::*;
pub use traits::{Locker, Store};
pub use txn::{
    Compare, CompareResult, CompareTarget, KeyState, Txn, TxnCommitter, TxnOp, TxnOpResponse,
    TxnRequest, TxnResponse,
};
pub use watch::{WatchSource, spawn_delivery};
