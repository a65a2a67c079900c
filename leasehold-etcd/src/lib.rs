//! etcd Backend for Leasehold
//!
//! Implements [`LeaseStore`](leasehold_store::LeaseStore) against etcd's v3
//! JSON gateway, so no gRPC toolchain is needed.
//!
//! ## Features
//!
//! - **Leases** - `/v3/lease/grant`, `/v3/lease/keepalive`, `/v3/lease/revoke`
//! - **Transactions** - create-if-absent and lease-conditioned delete via `/v3/kv/txn`
//! - **Watches** - streaming `/v3/watch` pumped into a channel
//! - **Failover** - endpoints tried in order on connection errors
//! - **Authentication** - optional username/password tokens
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use leasehold_etcd::*;
//! use leasehold_store::LeaseStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let etcd = EtcdStore::new(EtcdConfig::from_env().build())?;
//!
//!     let lease = etcd.grant_lease(10).await?;
//!     let outcome = etcd.create_if_absent("/locks/jobs", "worker-1", lease.id).await?;
//!     println!("{:?}", outcome);
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
mod wire;

pub use client::EtcdStore;
pub use config::{EtcdConfig, EtcdConfigBuilder};
