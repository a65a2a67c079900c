//! Lease-Backed Distributed Locks for Leasehold
//!
//! This crate provides mutual exclusion across processes on top of any
//! [`LeaseStore`](leasehold_store::LeaseStore).
//!
//! ## Features
//!
//! - **Atomic Acquisition** - The lock record is created with a single compare-and-create
//! - **Lease Renewal** - A background keep-alive holds the lock past its TTL
//! - **Watch-Based Waiting** - Contenders sleep until the record is deleted
//! - **Fencing Tokens** - Every holder gets a strictly larger token
//! - **Safe Release** - Only the record attached to the handle's own lease is deleted
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leasehold_lock::*;
//! use leasehold_store::InMemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     let lock = LeaseLock::builder("nightly-report")
//!         .with_holder("worker-1")
//!         .with_ttl(Duration::from_secs(10))
//!         .build(store)?;
//!
//!     let mut handle = lock.acquire().await?;
//!     let token = handle.fencing_token();
//!
//!     // Critical section; pass `token` along with every write
//!     println!("Lock acquired with token {}", token);
//!
//!     match handle.release().await? {
//!         ReleaseOutcome::LostOwnership => eprintln!("lease expired while held"),
//!         _ => println!("released"),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Watching for Lost Leases
//!
//! The library never interrupts caller code. A critical section that must
//! stop when the lease dies selects on [`LockHandle::lost`]:
//!
//! ```rust,ignore
//! tokio::select! {
//!     _ = do_work(handle.fencing_token()) => {}
//!     reason = handle.lost() => eprintln!("lock lost: {}", reason),
//! }
//! ```

pub mod config;
pub mod error;
pub mod fencing;
pub mod handle;
pub mod lock;
pub mod retry;
pub mod session;

pub use config::{DEFAULT_KEY_PREFIX, LockConfig, LockConfigBuilder};
pub use error::{LockError, LockResult};
pub use fencing::{FencingToken, FencingValidator, StaleToken};
pub use handle::{HandleState, LockHandle, ReleaseOutcome};
pub use lock::{DistributedLock, LeaseLock, LockBuilder, LockHolder};
pub use retry::Backoff;
pub use session::{DeathReason, LeaseSession, SessionMonitor, SessionState};
