//! The lease store contract

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store revision. Every mutation advances it by one.
pub type Revision = i64;

/// Buffer size of watch channels.
pub const WATCH_BUFFER: usize = 256;

/// Lease identifier assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wrap a raw lease identifier
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw identifier
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Lease identifier
    pub id: LeaseId,

    /// TTL actually granted, in seconds
    pub ttl: i64,
}

/// A key-value pair as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key
    pub key: String,

    /// Value
    pub value: String,

    /// Revision at which the key was created
    pub create_revision: Revision,

    /// Revision of the last modification
    pub mod_revision: Revision,

    /// Lease the key is attached to
    pub lease: Option<LeaseId>,
}

/// Result of an atomic create-if-absent transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key was created at `revision`.
    Created {
        /// Revision of the creation
        revision: Revision,
    },

    /// The key already existed; nothing was written.
    Exists {
        /// The record currently holding the key
        current: KeyValue,

        /// Store revision at which the comparison was evaluated
        revision: Revision,
    },
}

impl CreateOutcome {
    /// Whether the transaction created the key
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change to a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Kind of change
    pub kind: EventKind,

    /// Key that changed
    pub key: String,

    /// Revision of the change
    pub revision: Revision,

    /// Lease attached to the key (puts only)
    pub lease: Option<LeaseId>,
}

impl WatchEvent {
    /// Whether the event removed the key
    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}

/// A watch subscription.
///
/// Yields events in revision order. The stream ends when the store drops the
/// subscription; callers must then re-establish their view of the key.
pub struct Watcher {
    key: String,
    receiver: mpsc::Receiver<StoreResult<WatchEvent>>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Create a watcher fed by `receiver`.
    pub fn new(key: impl Into<String>, receiver: mpsc::Receiver<StoreResult<WatchEvent>>) -> Self {
        Self {
            key: key.into(),
            receiver,
            task: None,
        }
    }

    /// Attach the task pumping events into this watcher. It is aborted on drop.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Get the watched key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<StoreResult<WatchEvent>> {
        self.receiver.recv().await
    }

    /// Wait until the key is deleted.
    pub async fn next_delete(&mut self) -> StoreResult<WatchEvent> {
        loop {
            match self.recv().await {
                Some(Ok(event)) if event.is_delete() => return Ok(event),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(StoreError::Unavailable(format!(
                        "watch on {} closed",
                        self.key
                    )));
                }
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("key", &self.key).finish()
    }
}

/// A lease-capable, linearizable key-value store.
///
/// Every operation is evaluated by the store as a single linearizable step.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseGrant>;

    /// Revoke a lease, deleting every key attached to it. Unknown leases are a no-op.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// Renew a lease, returning the TTL it was renewed for.
    ///
    /// Fails with [`StoreError::LeaseNotFound`] if the lease is gone.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64>;

    /// Create `key` attached to `lease` only if the key does not exist.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<CreateOutcome>;

    /// Delete `key` only if it is still attached to `lease`.
    async fn delete_if_owned(&self, key: &str, lease: LeaseId) -> StoreResult<bool>;

    /// Read a key.
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Watch `key` for changes at or after `from_revision`.
    async fn watch(&self, key: &str, from_revision: Revision) -> StoreResult<Watcher>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_next_delete_skips_puts() {
        let (tx, rx) = mpsc::channel(4);
        let mut watcher = Watcher::new("/locks/a", rx);

        tx.send(Ok(WatchEvent {
            kind: EventKind::Put,
            key: "/locks/a".into(),
            revision: 5,
            lease: Some(LeaseId::new(1)),
        }))
        .await
        .unwrap();
        tx.send(Ok(WatchEvent {
            kind: EventKind::Delete,
            key: "/locks/a".into(),
            revision: 6,
            lease: None,
        }))
        .await
        .unwrap();

        let event = watcher.next_delete().await.unwrap();
        assert_eq!(event.revision, 6);
    }

    #[tokio::test]
    async fn test_watcher_closed_stream_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        let mut watcher = Watcher::new("/locks/a", rx);
        drop(tx);

        let err = watcher.next_delete().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_create_outcome() {
        assert!(CreateOutcome::Created { revision: 2 }.is_created());
    }
}
