//! Lease-backed client sessions.
//!
//! A session is one store lease plus a background task renewing it. Keys
//! written under the lease (mutex queue entries) live exactly as long as the
//! session: [`StorageClient::close_session`] revokes the lease at once, while
//! a holder that simply disappears stops renewing and the store expires the
//! lease one TTL later.
//!
//! [`StorageClient::close_session`]: super::StorageClient::close_session

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ClientInner, StorageClient};
use crate::{
    error::StorageError,
    protocol::{LeaseId, Request, Response},
};

pub type SessionId = u64;

/// Renewals are sent this many times per TTL.
const RENEWALS_PER_TTL: u32 = 3;
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(50);

/// Handle to an open session. Cloning shares the same lease.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    lease: LeaseId,
    ttl: Duration,
    expired: CancellationToken,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True once the store reported the lease gone.
    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Resolves when the store reports the lease gone.
    pub async fn expired(&self) {
        self.expired.cancelled().await
    }
}

struct SessionEntry {
    lease: LeaseId,
    keepalive: CancellationToken,
}

/// Open sessions of one client, keyed by session id.
pub(crate) struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, lease: LeaseId, keepalive: CancellationToken) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, SessionEntry { lease, keepalive });
        id
    }

    fn remove(&self, id: SessionId) -> Option<LeaseId> {
        self.lock().remove(&id).map(|entry| {
            entry.keepalive.cancel();
            entry.lease
        })
    }

    /// Stops every keepalive and hands back the leases to revoke.
    pub(crate) fn drain(&self) -> Vec<LeaseId> {
        self.lock()
            .drain()
            .map(|(_, entry)| {
                entry.keepalive.cancel();
                entry.lease
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SessionRegistry {
    // A client dropped without close stops renewing; the store then expires
    // its leases after one TTL.
    fn drop(&mut self) {
        for entry in self.lock().values() {
            entry.keepalive.cancel();
        }
    }
}

impl StorageClient {
    /// Grants a lease of the configured session TTL and starts renewing it.
    pub async fn open_session(&self) -> Result<Session, StorageError> {
        let ttl = self.inner.session_ttl;
        let response = self
            .call(Request::LeaseGrant {
                ttl_ms: ttl.as_millis() as u64,
            })
            .await?;
        let lease = match response {
            Response::Lease { lease, .. } => lease,
            other => return Err(super::unexpected("lease_grant", other)),
        };

        let keepalive = CancellationToken::new();
        let expired = CancellationToken::new();
        let id = self.inner.sessions.register(lease, keepalive.clone());

        tokio::spawn(keep_alive(
            std::sync::Arc::downgrade(&self.inner),
            lease,
            ttl,
            keepalive,
            expired.clone(),
        ));

        debug!(session = id, lease, ttl = ?ttl, "session opened");
        Ok(Session {
            id,
            lease,
            ttl,
            expired,
        })
    }

    /// Stops renewing and revokes the session lease, deleting every key
    /// attached to it.
    pub async fn close_session(&self, session: &Session) -> Result<(), StorageError> {
        let Some(lease) = self.inner.sessions.remove(session.id) else {
            return Ok(());
        };
        match self.call(Request::LeaseRevoke { lease }).await {
            Ok(_) | Err(StorageError::SessionExpired { .. }) => {
                debug!(session = session.id, lease, "session closed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Stops renewing `session` and revokes its lease in the background when
    /// a runtime is available. Without one, the store expires the lease one
    /// TTL later.
    pub(crate) fn abandon_session(&self, session: &Session) {
        let Some(lease) = self.inner.sessions.remove(session.id) else {
            return;
        };
        debug!(session = session.id, lease, "session abandoned");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.clone();
        runtime.spawn(async move {
            match client.call(Request::LeaseRevoke { lease }).await {
                Ok(_) | Err(StorageError::SessionExpired { .. }) | Err(StorageError::Closed) => {}
                Err(err) => warn!(lease, error = %err, "failed to revoke abandoned session"),
            }
        });
    }

    /// Number of sessions still registered with this client.
    pub fn open_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub(crate) async fn revoke_all_sessions(&self) -> Result<(), StorageError> {
        let mut first_error = None;
        for lease in self.inner.sessions.drain() {
            match self.call(Request::LeaseRevoke { lease }).await {
                Ok(_) | Err(StorageError::SessionExpired { .. }) => {}
                Err(err) => {
                    warn!(lease, error = %err, "failed to revoke session lease");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn keep_alive(
    client: Weak<ClientInner>,
    lease: LeaseId,
    ttl: Duration,
    stop: CancellationToken,
    expired: CancellationToken,
) {
    let period = (ttl / RENEWALS_PER_TTL).max(MIN_RENEW_PERIOD);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(period) => {}
        }

        let Some(inner) = client.upgrade() else {
            return;
        };
        let result = StorageClient { inner }
            .call(Request::LeaseKeepAlive { lease })
            .await;

        match result {
            Ok(Response::Lease { .. }) => {}
            Ok(other) => warn!(lease, response = ?other, "unexpected keepalive response"),
            Err(StorageError::SessionExpired { .. }) => {
                warn!(lease, "session lease expired");
                expired.cancel();
                return;
            }
            Err(StorageError::Closed) => return,
            // Transient; the lease survives until its TTL runs out.
            Err(err) => warn!(lease, error = %err, "lease keepalive failed"),
        }
    }
}
