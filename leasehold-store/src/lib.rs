//! Lease Store for Leasehold
//!
//! This crate defines the capability set Leasehold needs from a
//! coordination service and ships an in-memory implementation of it.
//!
//! ## Features
//!
//! - **Leases** - Grant, renew and revoke TTL-bound leases
//! - **Atomic Create** - Create a key only if absent, attached to a lease
//! - **Owned Delete** - Delete a key only while it is attached to a given lease
//! - **Watches** - Subscribe to put/delete events on a key from a revision
//! - **In-Memory Backend** - A linearizable single-node store for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leasehold_store::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryStore::new();
//!
//!     let lease = store.grant_lease(10).await?;
//!     match store.create_if_absent("/locks/jobs", "worker-1", lease.id).await? {
//!         CreateOutcome::Created { revision } => println!("created at {}", revision),
//!         CreateOutcome::Exists { current, .. } => println!("held by {}", current.value),
//!     }
//!
//!     store.revoke_lease(lease.id).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryStore, StoreOp};
pub use store::{
    CreateOutcome, EventKind, KeyValue, LeaseGrant, LeaseId, LeaseStore, Revision, WatchEvent,
    Watcher,
};
