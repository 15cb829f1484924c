//! Fair distributed mutex over store leases.
//!
//! Every contender writes `<lock_key>/<lease id in hex>` attached to its
//! session lease. The entry with the lowest create revision holds the lock;
//! everyone else waits for the deletion of the entry queued right before its
//! own, so the lock is handed over in arrival order.

use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Session, StorageClient};
use crate::{
    error::StorageError,
    protocol::{Compare, KeyValue, Revision, TxnOp},
};

/// Longest single park on a predecessor. Between slices the queue is re-read
/// and the cancellation token re-checked.
const WAIT_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct QueueEntry {
    key: Vec<u8>,
    create_revision: Revision,
}

pub struct DistributedMutex {
    client: StorageClient,
    session: Session,
    lock_key: String,
    held: Option<QueueEntry>,
}

impl Drop for DistributedMutex {
    // A mutex dropped without close (panicking or aborted holder) gives up
    // its session, so its queue entry cannot outlive it.
    fn drop(&mut self) {
        self.client.abandon_session(&self.session);
    }
}

impl DistributedMutex {
    pub(crate) fn new(client: StorageClient, session: Session, lock_key: &str) -> Self {
        Self {
            client,
            session,
            lock_key: lock_key.to_string(),
            held: None,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_locked(&self) -> bool {
        self.held.is_some()
    }

    /// Blocks until this mutex holds the lock.
    ///
    /// Returns [`StorageError::Cancelled`] if `cancel` fires first; the queue
    /// entry is removed before returning. Locking a mutex that is already
    /// held returns at once.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> Result<(), StorageError> {
        if self.held.is_some() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if self.session.is_expired() {
            return Err(self.session_expired());
        }

        let entry = self.enqueue().await?;
        match self.wait_for_turn(&entry, cancel).await {
            Ok(()) => {
                debug!(lock = %self.lock_key, lease = self.session.lease(), "lock acquired");
                self.held = Some(entry);
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = self.client.delete(&entry.key).await {
                    warn!(lock = %self.lock_key, error = %cleanup, "failed to leave lock queue");
                    return Err(cleanup);
                }
                Err(err)
            }
        }
    }

    /// Releases the lock.
    ///
    /// Fails with [`StorageError::LockNotHeld`] when this mutex never
    /// acquired it or its entry is already gone, e.g. because the session
    /// lease expired. A cancelled unlock leaves the mutex marked as held.
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<(), StorageError> {
        let Some(entry) = self.held.clone() else {
            return Err(self.not_held());
        };
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        // Only delete the entry this mutex created; a recreated key with the
        // same name belongs to a later acquisition.
        let release = self.client.txn(
            vec![Compare::CreateRevision {
                key: entry.key.clone(),
                revision: entry.create_revision,
            }],
            vec![TxnOp::Delete {
                key: entry.key.clone(),
            }],
        );
        let released = select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            result = release => result?.0,
        };

        self.held = None;
        if !released {
            return Err(self.not_held());
        }
        debug!(lock = %self.lock_key, lease = self.session.lease(), "lock released");
        Ok(())
    }

    /// Ends the session behind this mutex. A held lock is released with it.
    pub async fn close(self) -> Result<(), StorageError> {
        self.client.close_session(&self.session).await
    }

    fn queue_prefix(&self) -> String {
        format!("{}/", self.lock_key)
    }

    /// Writes this session's queue entry (or finds the one it wrote before)
    /// and returns it with its create revision.
    async fn enqueue(&self) -> Result<QueueEntry, StorageError> {
        let lease = self.session.lease();
        let key = format!("{}{lease:x}", self.queue_prefix()).into_bytes();

        self.client
            .txn(
                vec![Compare::Absent { key: key.clone() }],
                vec![TxnOp::Put {
                    key: key.clone(),
                    value: Vec::new(),
                    lease: Some(lease),
                }],
            )
            .await?;

        match self.client.get_entry(&key).await? {
            Some(kv) => Ok(QueueEntry {
                key,
                create_revision: kv.create_revision,
            }),
            None => Err(self.session_expired()),
        }
    }

    async fn wait_for_turn(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let prefix = self.queue_prefix();

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let queue = own_queue(self.client.range(&prefix).await?, prefix.len());
            if !queue.iter().any(|kv| kv.key == entry.key) {
                return Err(self.session_expired());
            }
            let Some(predecessor) = predecessor_of(&queue, entry.create_revision) else {
                return Ok(());
            };

            debug!(
                lock = %self.lock_key,
                waiting_on = %String::from_utf8_lossy(&predecessor.key),
                "waiting for predecessor"
            );
            select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = self.session.expired() => return Err(self.session_expired()),
                deleted = self.client.wait_deleted(&predecessor.key, WAIT_SLICE) => {
                    deleted?;
                }
            }
        }
    }

    fn not_held(&self) -> StorageError {
        StorageError::LockNotHeld {
            key: self.lock_key.clone(),
        }
    }

    fn session_expired(&self) -> StorageError {
        StorageError::SessionExpired {
            lease: self.session.lease(),
        }
    }
}

/// Keeps the entries queued directly under the prefix. Entries of a nested
/// lock such as `a/b` also start with `a/` but carry a further separator.
fn own_queue(mut queue: Vec<KeyValue>, prefix_len: usize) -> Vec<KeyValue> {
    queue.retain(|kv| !kv.key[prefix_len..].contains(&b'/'));
    queue
}

/// The entry queued immediately before `create_revision`, if any.
fn predecessor_of(queue: &[KeyValue], create_revision: Revision) -> Option<&KeyValue> {
    queue
        .iter()
        .filter(|kv| kv.create_revision < create_revision)
        .max_by_key(|kv| kv.create_revision)
}
