//! Distributed locks over a lease store

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::fencing::FencingToken;
use crate::handle::LockHandle;
use crate::retry::{Backoff, with_retry};
use crate::session::LeaseSession;
use async_trait::async_trait;
use leasehold_store::{CreateOutcome, LeaseId, LeaseStore, Revision, StoreError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Distributed lock trait
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire the lock, waiting as long as it takes
    async fn acquire(&self) -> LockResult<LockHandle>;

    /// Try to acquire the lock (single round, no waiting)
    async fn try_acquire(&self) -> LockResult<Option<LockHandle>>;

    /// Acquire with timeout
    async fn acquire_timeout(&self, timeout: Duration) -> LockResult<LockHandle>;
}

/// Current owner of a lock as recorded in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Holder identity stored in the record
    pub holder: String,
    /// Fencing token of the current holder
    pub token: FencingToken,
    /// Lease the record is attached to
    pub lease: Option<LeaseId>,
}

enum Attempt {
    Acquired(LockHandle),
    Contended { revision: Revision, holder: String },
    LeaseLost,
}

/// Lease opened by an in-flight acquisition and not yet handed to a handle.
#[derive(Default)]
struct PendingLease(Mutex<Option<LeaseId>>);

impl PendingLease {
    fn set(&self, lease: LeaseId) {
        *self.0.lock() = Some(lease);
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }

    fn take(&self) -> Option<LeaseId> {
        self.0.lock().take()
    }
}

/// Lease-backed distributed lock.
///
/// The lock record is created atomically and attached to a lease, so a
/// holder that crashes blocks others for at most one TTL.
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    name: String,
    key: String,
    holder: String,
    config: LockConfig,
}

impl LeaseLock {
    /// Create new lease lock
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use leasehold_lock::{LeaseLock, LockConfig};
    /// use leasehold_store::InMemoryStore;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let store = Arc::new(InMemoryStore::new());
    /// let config = LockConfig::new(Duration::from_secs(10));
    /// let lock = LeaseLock::new(store, "reports", "worker-1", config)?;
    /// ```
    pub fn new(
        store: Arc<dyn LeaseStore>,
        name: impl Into<String>,
        holder: impl Into<String>,
        config: LockConfig,
    ) -> LockResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(LockError::InvalidName(name));
        }
        config.validate()?;

        Ok(Self {
            key: config.lock_key(&name),
            store,
            name,
            holder: holder.into(),
            config,
        })
    }

    /// Create a lock builder
    pub fn builder(name: impl Into<String>) -> LockBuilder {
        LockBuilder::new(name)
    }

    /// Get the lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the store key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the holder identity written into the lock record
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Look up who holds the lock right now.
    pub async fn current_holder(&self) -> LockResult<Option<LockHolder>> {
        let store = self.store.as_ref();
        let key = self.key.as_str();
        let record = with_retry("get", &self.config, || store.get(key)).await?;

        Ok(record.map(|kv| LockHolder {
            holder: kv.value,
            token: FencingToken::from_revision(kv.create_revision),
            lease: kv.lease,
        }))
    }

    /// Acquire the lock unless `cancel` resolves first.
    ///
    /// On cancellation any lease opened by the attempt is revoked before
    /// `LockError::Cancelled` is returned.
    pub async fn acquire_until<F>(&self, cancel: F) -> LockResult<LockHandle>
    where
        F: Future<Output = ()> + Send,
    {
        self.acquire_or(cancel, LockError::Cancelled).await
    }

    async fn acquire_or<F>(&self, cancel: F, interrupted: LockError) -> LockResult<LockHandle>
    where
        F: Future<Output = ()> + Send,
    {
        let pending = PendingLease::default();

        let result = tokio::select! {
            result = self.acquire_loop(&pending) => Some(result),
            _ = cancel => None,
        };

        match result {
            Some(result) => result,
            None => {
                if let Some(lease) = pending.take() {
                    if let Err(e) = self.store.revoke_lease(lease).await {
                        warn!(lock = %self.name, lease = %lease, error = %e, "Failed to revoke lease of interrupted acquisition");
                    }
                }
                debug!(lock = %self.name, error = %interrupted, "Acquisition interrupted");
                Err(interrupted)
            }
        }
    }

    async fn acquire_loop(&self, pending: &PendingLease) -> LockResult<LockHandle> {
        let mut backoff = Backoff::from_config(&self.config);

        loop {
            match self.attempt(pending).await {
                Ok(Attempt::Acquired(handle)) => return Ok(handle),
                Ok(Attempt::Contended { revision, holder }) => {
                    debug!(lock = %self.name, holder = %holder, revision, state = "waiting", "Lock held, waiting for release");
                    match self.wait_for_release(revision).await {
                        Ok(()) => backoff.reset(),
                        Err(e) if e.is_retryable() || matches!(e, StoreError::Compacted(_)) => {
                            let delay = backoff.next_delay();
                            debug!(lock = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "Watch interrupted, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(Attempt::LeaseLost) => {
                    debug!(lock = %self.name, "Lease vanished before the record was created, retrying");
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(lock = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "Acquisition attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One round: open a lease and try to create the record with it.
    async fn attempt(&self, pending: &PendingLease) -> LockResult<Attempt> {
        let session = LeaseSession::open(self.store.clone(), &self.config).await?;
        let lease = session.lease_id();
        pending.set(lease);
        trace!(lock = %self.name, lease = %lease, state = "attempting", "Attempting to create lock record");

        let store = self.store.as_ref();
        let (key, holder) = (self.key.as_str(), self.holder.as_str());
        let created = with_retry("create_if_absent", &self.config, || {
            store.create_if_absent(key, holder, lease)
        })
        .await;

        let token = match created {
            Ok(CreateOutcome::Created { revision }) => revision,
            // Our own earlier try went through but its response was lost
            Ok(CreateOutcome::Exists { current, .. }) if current.lease == Some(lease) => {
                current.create_revision
            }
            Ok(CreateOutcome::Exists { current, revision }) => {
                self.abandon(session, pending).await;
                return Ok(Attempt::Contended {
                    revision,
                    holder: current.value,
                });
            }
            Err(e) if e.is_lease_not_found() => {
                self.abandon(session, pending).await;
                return Ok(Attempt::LeaseLost);
            }
            Err(e) => {
                self.abandon(session, pending).await;
                return Err(e.into());
            }
        };

        let token = FencingToken::from_revision(token);
        info!(lock = %self.name, holder = %self.holder, token = %token, state = "acquired", "Acquired lock");

        let handle = LockHandle::new(
            self.store.clone(),
            self.config.clone(),
            self.name.clone(),
            self.key.clone(),
            self.holder.clone(),
            session,
            token,
        );
        pending.clear();
        Ok(Attempt::Acquired(handle))
    }

    async fn abandon(&self, mut session: LeaseSession, pending: &PendingLease) {
        match session.close().await {
            Ok(()) => pending.clear(),
            // Dropping the session retries the revoke in the background
            Err(e) => warn!(lock = %self.name, lease = %session.lease_id(), error = %e, "Failed to revoke contending lease"),
        }
    }

    async fn wait_for_release(&self, revision: Revision) -> Result<(), StoreError> {
        let mut watcher = self.store.watch(&self.key, revision + 1).await?;
        let event = watcher.next_delete().await?;
        trace!(lock = %self.name, revision = event.revision, "Lock record deleted");
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    async fn acquire(&self) -> LockResult<LockHandle> {
        self.acquire_until(std::future::pending::<()>()).await
    }

    async fn try_acquire(&self) -> LockResult<Option<LockHandle>> {
        let pending = PendingLease::default();
        match self.attempt(&pending).await? {
            Attempt::Acquired(handle) => Ok(Some(handle)),
            Attempt::Contended { holder, .. } => {
                debug!(lock = %self.name, holder = %holder, "Failed to acquire lock (already held)");
                Ok(None)
            }
            Attempt::LeaseLost => Ok(None),
        }
    }

    async fn acquire_timeout(&self, timeout: Duration) -> LockResult<LockHandle> {
        self.acquire_or(tokio::time::sleep(timeout), LockError::Timeout)
            .await
    }
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("config", &self.config)
            .finish()
    }
}

/// Distributed lock builder
pub struct LockBuilder {
    name: String,
    holder: Option<String>,
    config: LockConfig,
}

impl LockBuilder {
    /// Create new lock builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holder: None,
            config: LockConfig::default(),
        }
    }

    /// Set the holder identity. Defaults to a random UUID.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Set TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Set the key prefix
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the lock
    pub fn build(self, store: Arc<dyn LeaseStore>) -> LockResult<LeaseLock> {
        let holder = self.holder.unwrap_or_else(|| Uuid::new_v4().to_string());
        LeaseLock::new(store, self.name, holder, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleState, ReleaseOutcome};
    use leasehold_store::InMemoryStore;

    fn lock(store: &InMemoryStore, holder: &str) -> LeaseLock {
        LeaseLock::builder("jobs")
            .with_holder(holder)
            .with_ttl(Duration::from_secs(3))
            .build(Arc::new(store.clone()))
            .unwrap()
    }

    #[test]
    fn test_lock_builder() {
        let builder = LockBuilder::new("test-lock")
            .with_ttl(Duration::from_secs(60))
            .with_key_prefix("/app/");

        assert_eq!(builder.name, "test-lock");
        assert_eq!(builder.config.ttl, Duration::from_secs(60));

        let lock = builder.build(Arc::new(InMemoryStore::new())).unwrap();
        assert_eq!(lock.key(), "/app/test-lock");
        assert!(Uuid::parse_str(lock.holder()).is_ok());
    }

    #[test]
    fn test_rejects_empty_name() {
        let err = LeaseLock::builder("  ")
            .build(Arc::new(InMemoryStore::new()))
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidName(_)));
    }

    #[test]
    fn test_rejects_invalid_ttl() {
        let err = LeaseLock::builder("jobs")
            .with_ttl(Duration::from_millis(200))
            .build(Arc::new(InMemoryStore::new()))
            .unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_when_held() {
        let store = InMemoryStore::new();
        let a = lock(&store, "a");
        let b = lock(&store, "b");

        let mut handle = a.try_acquire().await.unwrap().unwrap();
        assert!(b.try_acquire().await.unwrap().is_none());
        assert_eq!(store.lease_count(), 1);

        let current = b.current_holder().await.unwrap().unwrap();
        assert_eq!(current.holder, "a");
        assert_eq!(current.token, handle.fencing_token());
        assert_eq!(current.lease, Some(handle.lease_id()));

        assert_eq!(handle.release().await.unwrap(), ReleaseOutcome::Released);
        assert!(b.current_holder().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_outlives_ttl() {
        let store = InMemoryStore::new();
        let handle = lock(&store, "a").acquire().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(handle.state(), HandleState::Held);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_releases() {
        let store = InMemoryStore::new();
        let handle = lock(&store, "a").acquire().await.unwrap();
        drop(handle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.lease_count(), 0);
    }
}
