// Leasehold - Lease-backed distributed mutual exclusion
//
// This library provides distributed locks with fencing tokens on top of a
// lease-capable linearizable key-value store such as etcd.

// Re-export the lock protocol
pub use leasehold_lock::*;

// Re-export the store layer
pub use leasehold_store;
pub use leasehold_store::{InMemoryStore, LeaseId, LeaseStore, StoreError, StoreResult};

// Re-export optional backends
#[cfg(feature = "etcd")]
pub use leasehold_etcd;

#[cfg(feature = "etcd")]
pub use leasehold_etcd::{EtcdConfig, EtcdStore};

/// Prelude for common imports.
///
/// ```rust,ignore
/// use leasehold::prelude::*;
/// ```
pub mod prelude {
    pub use leasehold_lock::{
        DistributedLock, FencingToken, FencingValidator, HandleState, LeaseLock, LockConfig,
        LockError, LockHandle, ReleaseOutcome,
    };
    pub use leasehold_store::{InMemoryStore, LeaseStore};

    #[cfg(feature = "etcd")]
    pub use leasehold_etcd::{EtcdConfig, EtcdStore};
}

/// Initialize tracing with JSON output.
///
/// The filter is read from `RUST_LOG` and defaults to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .init();
}

/// Initialize tracing with a custom log level.
pub fn init_tracing_with_level(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
        .init();
}
