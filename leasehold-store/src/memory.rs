//! In-memory lease store (for testing/development)

use crate::error::{StoreError, StoreResult};
use crate::store::{
    CreateOutcome, EventKind, KeyValue, LeaseGrant, LeaseId, LeaseStore, Revision, WATCH_BUFFER,
    WatchEvent, Watcher,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Number of events retained for watches that start in the past.
pub const HISTORY_LIMIT: usize = 1024;

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
    isolated: bool,
}

/// Store operations that tests can make fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GrantLease,
    RevokeLease,
    KeepAlive,
    CreateIfAbsent,
    DeleteIfOwned,
    Get,
    Watch,
}

struct WatchSender {
    key: String,
    sender: mpsc::Sender<StoreResult<WatchEvent>>,
}

struct State {
    revision: Revision,
    compacted: Revision,
    next_lease: i64,
    keys: HashMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
    watchers: Vec<WatchSender>,
    faults: HashMap<StoreOp, VecDeque<StoreError>>,
}

impl State {
    fn new() -> Self {
        Self {
            revision: 1,
            compacted: 0,
            next_lease: 1,
            keys: HashMap::new(),
            leases: HashMap::new(),
            history: VecDeque::new(),
            watchers: Vec::new(),
            faults: HashMap::new(),
        }
    }

    fn take_fault(&mut self, op: StoreOp) -> StoreResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                trace!(?op, error = %err, "Injected store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        while self.history.len() > HISTORY_LIMIT {
            if let Some(evicted) = self.history.pop_front() {
                self.compacted = evicted.revision;
            }
        }

        // A watcher that cannot keep up is dropped; its stream ends and the
        // subscriber re-reads the key.
        self.watchers.retain(|watcher| {
            watcher.key != event.key || watcher.sender.try_send(Ok(event.clone())).is_ok()
        });
    }

    fn remove_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };

        let owned: Vec<String> = entry
            .keys
            .into_iter()
            .filter(|key| self.keys.get(key).is_some_and(|kv| kv.lease == Some(lease)))
            .collect();

        if !owned.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            for key in owned {
                self.keys.remove(&key);
                self.publish(WatchEvent {
                    kind: EventKind::Delete,
                    key,
                    revision,
                    lease: None,
                });
            }
        }

        true
    }
}

struct Inner {
    state: Mutex<State>,
}

/// A single-node linearizable store with leases and watches.
///
/// Every operation runs under one lock, so operations are totally ordered.
/// Lease expiry is driven by `tokio::time` and therefore honours paused
/// test time.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Live lease identifiers.
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut leases: Vec<LeaseId> = self.inner.state.lock().leases.keys().copied().collect();
        leases.sort();
        leases
    }

    /// Number of keys.
    pub fn key_count(&self) -> usize {
        self.inner.state.lock().keys.len()
    }

    /// Make keep-alives for `lease` fail as if its holder were partitioned
    /// from the store. The lease then expires when its TTL runs out.
    pub fn isolate_lease(&self, lease: LeaseId) -> bool {
        match self.inner.state.lock().leases.get_mut(&lease) {
            Some(entry) => {
                entry.isolated = true;
                true
            }
            None => false,
        }
    }

    /// Make the next `times` calls of `op` fail with `error` before touching
    /// any state.
    pub fn fail_next(&self, op: StoreOp, error: StoreError, times: usize) {
        let mut state = self.inner.state.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    fn inject(&self, op: StoreOp) -> StoreResult<()> {
        self.inner.state.lock().take_fault(op)
    }

    fn spawn_reaper(&self, lease: LeaseId) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = inner.upgrade() else { return };
                    let state = inner.state.lock();
                    match state.leases.get(&lease) {
                        Some(entry) => entry.deadline,
                        None => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(inner) = inner.upgrade() else { return };
                let mut state = inner.state.lock();
                let expired = state
                    .leases
                    .get(&lease)
                    .map(|entry| entry.deadline <= Instant::now());

                match expired {
                    Some(true) => {
                        state.remove_lease(lease);
                        debug!(lease = %lease, "Lease expired");
                        return;
                    }
                    Some(false) => continue,
                    None => return,
                }
            }
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ttl_duration(ttl: i64) -> Duration {
    Duration::from_secs(u64::try_from(ttl).unwrap_or(0))
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseGrant> {
        self.inject(StoreOp::GrantLease)?;
        if ttl <= 0 {
            return Err(StoreError::Status {
                code: 3,
                message: format!("invalid lease TTL {}", ttl),
            });
        }

        let id = {
            let mut state = self.inner.state.lock();
            let id = LeaseId::new(state.next_lease);
            state.next_lease += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl_duration(ttl),
                    keys: HashSet::new(),
                    isolated: false,
                },
            );
            id
        };

        self.spawn_reaper(id);
        trace!(lease = %id, ttl, "Granted lease");

        Ok(LeaseGrant { id, ttl })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.inject(StoreOp::RevokeLease)?;
        if self.inner.state.lock().remove_lease(lease) {
            trace!(lease = %lease, "Revoked lease");
        }
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64> {
        let mut state = self.inner.state.lock();
        state.take_fault(StoreOp::KeepAlive)?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;

        if entry.isolated {
            return Err(StoreError::Unavailable(format!(
                "lease {} is partitioned from the store",
                lease
            )));
        }

        entry.deadline = Instant::now() + ttl_duration(entry.ttl);
        Ok(entry.ttl)
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<CreateOutcome> {
        let mut state = self.inner.state.lock();
        state.take_fault(StoreOp::CreateIfAbsent)?;

        if !state.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }

        if let Some(current) = state.keys.get(key) {
            return Ok(CreateOutcome::Exists {
                current: current.clone(),
                revision: state.revision,
            });
        }

        state.revision += 1;
        let revision = state.revision;
        state.keys.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                create_revision: revision,
                mod_revision: revision,
                lease: Some(lease),
            },
        );
        if let Some(entry) = state.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }
        state.publish(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            revision,
            lease: Some(lease),
        });

        Ok(CreateOutcome::Created { revision })
    }

    async fn delete_if_owned(&self, key: &str, lease: LeaseId) -> StoreResult<bool> {
        let mut state = self.inner.state.lock();
        state.take_fault(StoreOp::DeleteIfOwned)?;

        let owned = state
            .keys
            .get(key)
            .is_some_and(|kv| kv.lease == Some(lease));
        if !owned {
            return Ok(false);
        }

        state.revision += 1;
        let revision = state.revision;
        state.keys.remove(key);
        if let Some(entry) = state.leases.get_mut(&lease) {
            entry.keys.remove(key);
        }
        state.publish(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            revision,
            lease: None,
        });

        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.inject(StoreOp::Get)?;
        Ok(self.inner.state.lock().keys.get(key).cloned())
    }

    async fn watch(&self, key: &str, from_revision: Revision) -> StoreResult<Watcher> {
        let mut state = self.inner.state.lock();
        state.take_fault(StoreOp::Watch)?;

        if from_revision > 0 && from_revision <= state.compacted {
            return Err(StoreError::Compacted(state.compacted));
        }

        let replay: Vec<WatchEvent> = if from_revision > 0 {
            state
                .history
                .iter()
                .filter(|event| event.key == key && event.revision >= from_revision)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER + replay.len());
        for event in replay {
            if tx.try_send(Ok(event)).is_err() {
                return Err(StoreError::Unavailable("watch buffer exhausted".into()));
            }
        }

        state.watchers.retain(|watcher| !watcher.sender.is_closed());
        state.watchers.push(WatchSender {
            key: key.to_string(),
            sender: tx,
        });

        Ok(Watcher::new(key, rx))
    }
}
