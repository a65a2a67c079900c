//! Held locks and the release protocol

use crate::config::LockConfig;
use crate::error::LockResult;
use crate::fencing::FencingToken;
use crate::retry::with_retry;
use crate::session::{DeathReason, LeaseSession, SessionMonitor, SessionState};
use leasehold_store::{LeaseId, LeaseStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of releasing a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock record was removed
    Released,
    /// The record was no longer ours; the critical section may have run unguarded
    LostOwnership,
    /// The handle was already released
    AlreadyReleased,
}

/// Local view of a lock handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The lease is being renewed and the record is believed ours
    Held,
    /// The lease died; other holders may have taken over
    Lost(DeathReason),
    /// Released by its owner
    Released,
}

/// A held lock.
///
/// Owns one lease and the lock record attached to it. Dropping an unreleased
/// handle spawns a best-effort release.
pub struct LockHandle {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    name: String,
    key: String,
    holder: String,
    lease: LeaseId,
    token: FencingToken,
    session: Option<LeaseSession>,
    monitor: SessionMonitor,
}

impl LockHandle {
    pub(crate) fn new(
        store: Arc<dyn LeaseStore>,
        config: LockConfig,
        name: String,
        key: String,
        holder: String,
        session: LeaseSession,
        token: FencingToken,
    ) -> Self {
        Self {
            store,
            config,
            name,
            key,
            holder,
            lease: session.lease_id(),
            token,
            monitor: session.monitor(),
            session: Some(session),
        }
    }

    /// Get the lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the store key of the lock record
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the holder identity
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Get the lease backing this handle
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// Fencing token to present with every write to the protected resource.
    pub fn fencing_token(&self) -> FencingToken {
        self.token
    }

    /// Current local state.
    pub fn state(&self) -> HandleState {
        if self.session.is_none() {
            return HandleState::Released;
        }
        match self.monitor.state() {
            SessionState::Alive { .. } => HandleState::Held,
            SessionState::Dead(reason) => HandleState::Lost(reason),
        }
    }

    /// Check if the lock is still believed held
    pub fn is_held(&self) -> bool {
        self.state() == HandleState::Held
    }

    /// Subscribe to the backing session's state reports.
    pub fn monitor(&self) -> SessionMonitor {
        self.monitor.clone()
    }

    /// Resolves once the backing lease is gone.
    ///
    /// ```rust,ignore
    /// tokio::select! {
    ///     result = do_work(handle.fencing_token()) => result?,
    ///     reason = handle.lost() => warn!(%reason, "lost the lock"),
    /// }
    /// ```
    pub async fn lost(&self) -> DeathReason {
        self.monitor.clone().dead().await
    }

    /// Release the lock.
    ///
    /// Stops renewal, deletes the record only if it is still attached to this
    /// handle's lease, then revokes the lease.
    pub async fn release(&mut self) -> LockResult<ReleaseOutcome> {
        let Some(mut session) = self.session.take() else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };

        session.stop_keep_alive().await;

        let store = self.store.as_ref();
        let key = self.key.as_str();
        let lease = self.lease;
        let deleted =
            with_retry("delete_if_owned", &self.config, || store.delete_if_owned(key, lease)).await;
        let revoked = session.close().await;

        match (deleted, revoked) {
            (Ok(true), revoked) => {
                if let Err(e) = revoked {
                    warn!(lock = %self.name, lease = %lease, error = %e, "Failed to revoke released lease");
                }
                info!(lock = %self.name, token = %self.token, state = "released", "Released lock");
                Ok(ReleaseOutcome::Released)
            }
            (Ok(false), _) => {
                warn!(
                    lock = %self.name,
                    token = %self.token,
                    "Lock record no longer owned at release; lease expired while held"
                );
                Ok(ReleaseOutcome::LostOwnership)
            }
            (Err(e), Ok(())) => {
                debug!(lock = %self.name, error = %e, "Conditional delete failed; record removed with its lease");
                Ok(ReleaseOutcome::Released)
            }
            (Err(e), Err(_)) => {
                self.session = Some(session);
                Err(e.into())
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        // Best effort release on drop
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let lease = self.lease;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                session.stop_keep_alive().await;
                if let Err(e) = store.delete_if_owned(&key, lease).await {
                    warn!(key = %key, error = %e, "Failed to delete dropped lock record");
                }
                if let Err(e) = session.close().await {
                    warn!(key = %key, error = %e, "Failed to revoke dropped lock lease");
                }
            });
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .field("token", &self.token)
            .field("state", &self.state())
            .finish()
    }
}
