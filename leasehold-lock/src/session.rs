//! Lease sessions with background keep-alive

use crate::config::LockConfig;
use crate::error::LockResult;
use crate::retry::{Backoff, with_retry};
use leasehold_store::{LeaseId, LeaseStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, info, trace, warn};

/// Why a session stopped holding its lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    /// The TTL ran out without a successful renewal
    Expired,
    /// The store no longer knows the lease
    LeaseNotFound,
    /// Too many consecutive keep-alive failures
    RenewalFailed,
    /// The session was closed by its owner
    Closed,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DeathReason::Expired => "lease expired",
            DeathReason::LeaseNotFound => "lease not found",
            DeathReason::RenewalFailed => "renewal failed",
            DeathReason::Closed => "session closed",
        };
        f.write_str(reason)
    }
}

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The lease is believed alive
    Alive {
        /// Successful renewals so far
        renewals: u64,
    },
    /// The lease must be assumed gone
    Dead(DeathReason),
}

/// Receiving end of a session's state reports.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    receiver: watch::Receiver<SessionState>,
}

impl SessionMonitor {
    /// Latest state.
    pub fn state(&self) -> SessionState {
        *self.receiver.borrow()
    }

    /// Whether the lease is believed alive.
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), SessionState::Alive { .. })
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Option<SessionState> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }

    /// Wait until the session dies.
    pub async fn dead(&mut self) -> DeathReason {
        loop {
            let state = *self.receiver.borrow_and_update();
            if let SessionState::Dead(reason) = state {
                return reason;
            }
            if self.receiver.changed().await.is_err() {
                return DeathReason::Closed;
            }
        }
    }
}

/// One lease plus the task keeping it alive.
pub struct LeaseSession {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    lease: LeaseId,
    ttl: Duration,
    state: Arc<watch::Sender<SessionState>>,
    keep_alive: Option<JoinHandle<()>>,
    closed: bool,
}

impl LeaseSession {
    /// Grant a lease and start renewing it.
    pub async fn open(store: Arc<dyn LeaseStore>, config: &LockConfig) -> LockResult<Self> {
        let ttl_secs = config.ttl_secs();
        let lease_store = store.as_ref();
        let grant = with_retry("grant_lease", config, || lease_store.grant_lease(ttl_secs)).await?;

        let ttl = Duration::from_secs(u64::try_from(grant.ttl).unwrap_or(0).max(1));
        let interval = config.keep_alive_interval().min(ttl / 2);
        let (state, _) = watch::channel(SessionState::Alive { renewals: 0 });
        let state = Arc::new(state);

        let task = tokio::spawn(keep_alive_loop(KeepAlive {
            store: store.clone(),
            lease: grant.id,
            ttl,
            interval,
            max_failures: config.max_keep_alive_failures,
            backoff: Backoff::from_config(config),
            state: state.clone(),
        }));

        debug!(lease = %grant.id, ttl_secs = grant.ttl, interval_ms = interval.as_millis() as u64, "Lease session opened");

        Ok(Self {
            store,
            config: config.clone(),
            lease: grant.id,
            ttl,
            state,
            keep_alive: Some(task),
            closed: false,
        })
    }

    /// Lease identifier
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// TTL granted by the store
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Subscribe to state reports.
    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            receiver: self.state.subscribe(),
        }
    }

    /// Latest state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the lease is believed alive.
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), SessionState::Alive { .. })
    }

    /// Stop renewing without revoking. Returns once the loop has terminated.
    pub async fn stop_keep_alive(&mut self) {
        if let Some(task) = self.keep_alive.take() {
            task.abort();
            let _ = task.await;
        }

        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Alive { .. }) {
                *state = SessionState::Dead(DeathReason::Closed);
                true
            } else {
                false
            }
        });
    }

    /// Stop renewing and revoke the lease. Safe to call more than once.
    pub async fn close(&mut self) -> LockResult<()> {
        self.stop_keep_alive().await;
        if self.closed {
            return Ok(());
        }

        let lease = self.lease;
        let store = self.store.as_ref();
        with_retry("revoke_lease", &self.config, || store.revoke_lease(lease)).await?;
        self.closed = true;

        trace!(lease = %lease, "Lease session closed");
        Ok(())
    }
}

impl Drop for LeaseSession {
    fn drop(&mut self) {
        if let Some(task) = self.keep_alive.take() {
            task.abort();
        }
        if self.closed {
            return;
        }

        // Best effort revoke on drop
        let store = self.store.clone();
        let lease = self.lease;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = store.revoke_lease(lease).await {
                    warn!(lease = %lease, error = %e, "Failed to revoke dropped lease");
                }
            });
        }
    }
}

impl fmt::Debug for LeaseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseSession")
            .field("lease", &self.lease)
            .field("ttl", &self.ttl)
            .field("state", &self.state())
            .finish()
    }
}

struct KeepAlive {
    store: Arc<dyn LeaseStore>,
    lease: LeaseId,
    ttl: Duration,
    interval: Duration,
    max_failures: u32,
    backoff: Backoff,
    state: Arc<watch::Sender<SessionState>>,
}

async fn keep_alive_loop(mut ka: KeepAlive) {
    let mut deadline = Instant::now() + ka.ttl;
    let mut next_attempt = Instant::now() + ka.interval;
    let mut failures = 0u32;
    let mut renewals = 0u64;

    let reason = loop {
        tokio::select! {
            _ = sleep_until(next_attempt) => {}
            _ = sleep_until(deadline) => break DeathReason::Expired,
        }

        let sent_at = Instant::now();
        match timeout_at(deadline, ka.store.keep_alive(ka.lease)).await {
            Ok(Ok(ttl)) => {
                failures = 0;
                renewals += 1;
                ka.backoff.reset();
                // Measured from the send so the local deadline never trails the store's.
                deadline = sent_at + Duration::from_secs(u64::try_from(ttl).unwrap_or(0));
                next_attempt = sent_at + ka.interval;
                ka.state.send_replace(SessionState::Alive { renewals });
                trace!(lease = %ka.lease, renewals, "Lease renewed");
            }
            Ok(Err(e)) if e.is_lease_not_found() => break DeathReason::LeaseNotFound,
            Ok(Err(e)) => {
                failures += 1;
                warn!(lease = %ka.lease, failures, error = %e, "Lease keep-alive failed");
                if failures >= ka.max_failures {
                    break DeathReason::RenewalFailed;
                }
                next_attempt = (Instant::now() + ka.backoff.next_delay()).min(sent_at + ka.interval);
            }
            Err(_) => break DeathReason::Expired,
        }
    };

    match reason {
        DeathReason::RenewalFailed => error!(lease = %ka.lease, %reason, "Lease session dead"),
        _ => info!(lease = %ka.lease, %reason, "Lease session dead"),
    }
    ka.state.send_replace(SessionState::Dead(reason));
}
