//! Ordered key space owned by the node worker.
//!
//! This is the state machine every request is applied to. Only the worker
//! task touches it, so there is no interior locking: linearizability comes
//! from the worker applying one request at a time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Compare, KeyValue, LeaseId, Revision, TxnOp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: Revision,
    mod_revision: Revision,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<Vec<u8>>,
}

/// Key space plus the leases keys may be attached to.
///
/// `BTreeMap` keeps keys in byte order, so prefix scans are a single range
/// walk and come back sorted.
#[derive(Debug, Default)]
pub struct KvState {
    entries: BTreeMap<Vec<u8>, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: Revision,
    next_lease: LeaseId,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<KeyValue> {
        self.entries.get(key).map(|entry| to_key_value(key, entry))
    }

    /// Every entry whose key starts with `prefix`, ascending by key.
    pub fn range(&self, prefix: &[u8]) -> Vec<KeyValue> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| to_key_value(key, entry))
            .collect()
    }

    pub fn put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Revision, StateError> {
        self.require_lease(lease)?;
        let revision = self.revision + 1;
        self.apply_put(key, value, lease, revision);
        self.revision = revision;
        Ok(revision)
    }

    /// Removes `key` if present. Missing keys are not an error and do not
    /// advance the revision.
    pub fn delete(&mut self, key: &[u8]) -> Revision {
        let revision = self.revision + 1;
        if self.apply_delete(key) {
            self.revision = revision;
        }
        self.revision
    }

    /// Applies `ops` iff every guard in `compare` holds. Nothing is written
    /// when a guard fails or a put names an unknown lease.
    pub fn txn(
        &mut self,
        compare: &[Compare],
        ops: Vec<TxnOp>,
    ) -> Result<(bool, Revision), StateError> {
        if !compare.iter().all(|guard| self.holds(guard)) {
            return Ok((false, self.revision));
        }

        for op in &ops {
            if let TxnOp::Put { lease, .. } = op {
                self.require_lease(*lease)?;
            }
        }

        let revision = self.revision + 1;
        let mut changed = false;
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.apply_put(key, value, lease, revision);
                    changed = true;
                }
                TxnOp::Delete { key } => changed |= self.apply_delete(&key),
            }
        }
        if changed {
            self.revision = revision;
        }

        Ok((true, self.revision))
    }

    pub fn grant_lease(&mut self, ttl: Duration, now: Instant) -> LeaseId {
        self.next_lease += 1;
        let id = self.next_lease;
        self.leases.insert(
            id,
            Lease {
                ttl,
                deadline: now + ttl,
                keys: BTreeSet::new(),
            },
        );
        id
    }

    /// Pushes the lease deadline one TTL into the future.
    pub fn keep_alive(&mut self, id: LeaseId, now: Instant) -> Result<Duration, StateError> {
        let lease = self
            .leases
            .get_mut(&id)
            .ok_or(StateError::LeaseNotFound(id))?;
        lease.deadline = now + lease.ttl;
        Ok(lease.ttl)
    }

    /// Drops the lease and every key attached to it in one revision.
    pub fn revoke_lease(&mut self, id: LeaseId) -> Result<Revision, StateError> {
        let lease = self
            .leases
            .remove(&id)
            .ok_or(StateError::LeaseNotFound(id))?;

        if !lease.keys.is_empty() {
            self.revision += 1;
            for key in &lease.keys {
                self.entries.remove(key);
            }
        }
        Ok(self.revision)
    }

    /// Revokes every lease whose deadline has passed.
    pub fn expire_leases(&mut self, now: Instant) -> Vec<LeaseId> {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            // Present by construction; the result only carries the revision.
            let _ = self.revoke_lease(*id);
        }
        expired
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            next_lease: self.next_lease,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| SnapshotEntry {
                    key: key.clone(),
                    value: entry.value.clone(),
                    create_revision: entry.create_revision,
                    mod_revision: entry.mod_revision,
                    lease: entry.lease,
                })
                .collect(),
            leases: self
                .leases
                .iter()
                .map(|(id, lease)| SnapshotLease {
                    id: *id,
                    ttl_ms: lease.ttl.as_millis() as u64,
                })
                .collect(),
        }
    }

    /// Rebuilds state from a snapshot. Restored leases get a full TTL from
    /// `now`, so their holders have one TTL to resume keepalives.
    pub fn restore(snapshot: Snapshot, now: Instant) -> Self {
        let mut state = KvState {
            revision: snapshot.revision,
            next_lease: snapshot.next_lease,
            ..KvState::default()
        };

        for lease in snapshot.leases {
            let ttl = Duration::from_millis(lease.ttl_ms);
            state.leases.insert(
                lease.id,
                Lease {
                    ttl,
                    deadline: now + ttl,
                    keys: BTreeSet::new(),
                },
            );
        }

        for entry in snapshot.entries {
            if let Some(id) = entry.lease {
                match state.leases.get_mut(&id) {
                    Some(lease) => {
                        lease.keys.insert(entry.key.clone());
                    }
                    None => continue,
                }
            }
            state.entries.insert(
                entry.key,
                Entry {
                    value: entry.value,
                    create_revision: entry.create_revision,
                    mod_revision: entry.mod_revision,
                    lease: entry.lease,
                },
            );
        }

        state
    }

    fn holds(&self, guard: &Compare) -> bool {
        match guard {
            Compare::Value { key, value } => self
                .entries
                .get(key)
                .is_some_and(|entry| entry.value == *value),
            Compare::Absent { key } => !self.entries.contains_key(key),
            Compare::CreateRevision { key, revision } => self
                .entries
                .get(key)
                .is_some_and(|entry| entry.create_revision == *revision),
        }
    }

    fn require_lease(&self, lease: Option<LeaseId>) -> Result<(), StateError> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(StateError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn apply_put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        revision: Revision,
    ) {
        let previous = self
            .entries
            .get(&key)
            .map(|existing| (existing.create_revision, existing.lease));
        let create_revision = match previous {
            Some((create_revision, previous_lease)) => {
                if previous_lease != lease {
                    self.detach(&key, previous_lease);
                }
                create_revision
            }
            None => revision,
        };

        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.insert(key.clone());
            }
        }

        self.entries.insert(
            key,
            Entry {
                value,
                create_revision,
                mod_revision: revision,
                lease,
            },
        );
    }

    fn apply_delete(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.detach(key, entry.lease);
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, key: &[u8], lease: Option<LeaseId>) {
        if let Some(lease) = lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
    }
}

fn to_key_value(key: &[u8], entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_vec(),
        value: entry.value.clone(),
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        lease: entry.lease,
    }
}

/// Serialisable image of [`KvState`], written to the data directory on close.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: Revision,
    pub next_lease: LeaseId,
    pub entries: Vec<SnapshotEntry>,
    pub leases: Vec<SnapshotLease>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotLease {
    pub id: LeaseId,
    pub ttl_ms: u64,
}
