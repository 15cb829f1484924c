//! Client side of the store protocol.
//!
//! [`StorageClient`] is a cheap, cloneable handle over a shared connection
//! pool. Every operation takes one pooled connection for exactly one
//! request and is bounded by the configured request timeout.

mod mutex;
mod pool;
mod session;

pub use mutex::DistributedMutex;
pub use session::{Session, SessionId};

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    config::{StorageClientConfig, endpoint_address},
    error::{ConfigError, StorageError},
    protocol::{Compare, ErrorCode, KeyValue, LeaseId, Request, Response, Revision, TxnOp},
};
use pool::ConnectionPool;
use session::SessionRegistry;

/// Node-reported counters, mostly for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub member: String,
    pub revision: Revision,
    pub keys: usize,
    pub leases: usize,
}

#[derive(Clone)]
pub struct StorageClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pool: ConnectionPool,
    request_timeout: Duration,
    session_ttl: Duration,
    sessions: SessionRegistry,
}

impl StorageClient {
    /// Connects to the first reachable endpoint. Fails once every endpoint
    /// was tried, each for at most `connection_timeout`.
    pub async fn connect(config: &StorageClientConfig) -> Result<Self, StorageError> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| endpoint_address(endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::InvalidEndpoint("no endpoints configured".to_string()).into());
        }

        let pool = ConnectionPool::new(endpoints, config.connection_timeout);
        let connection = pool.connect().await?;
        info!(endpoint = %connection.endpoint(), "storage client connected");
        pool.checkin(connection);

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                request_timeout: config.request_timeout,
                session_ttl: config.session_ttl,
                sessions: SessionRegistry::new(),
            }),
        })
    }

    /// Current value of `key`; `None` when absent. An empty value is present.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get_entry(key).await?.map(|kv| kv.value))
    }

    /// Like [`get`](Self::get) but with revisions and lease.
    pub async fn get_entry(&self, key: impl AsRef<[u8]>) -> Result<Option<KeyValue>, StorageError> {
        let request = Request::Get {
            key: key.as_ref().to_vec(),
        };
        match self.call(request).await? {
            Response::Value { kv } => Ok(kv),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), StorageError> {
        let request = Request::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            lease: None,
        };
        match self.call(request).await? {
            Response::Done { .. } => Ok(()),
            other => Err(unexpected("put", other)),
        }
    }

    /// Removes `key`. Deleting an absent key succeeds.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), StorageError> {
        let request = Request::Delete {
            key: key.as_ref().to_vec(),
        };
        match self.call(request).await? {
            Response::Done { .. } => Ok(()),
            other => Err(unexpected("delete", other)),
        }
    }

    /// Values of every key starting with `prefix`, ordered by key. Empty when
    /// nothing matches.
    pub async fn get_by_key_prefix(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        Ok(self
            .range(prefix)
            .await?
            .into_iter()
            .map(|kv| kv.value)
            .collect())
    }

    /// Every entry whose key starts with `prefix`, ordered by key.
    pub async fn range(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<KeyValue>, StorageError> {
        let request = Request::Range {
            prefix: prefix.as_ref().to_vec(),
        };
        match self.call(request).await? {
            Response::Range { kvs } => Ok(kvs),
            other => Err(unexpected("range", other)),
        }
    }

    /// Writes `value` only if `key` is absent. Returns whether it was written.
    pub async fn put_if_absent(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<bool, StorageError> {
        let key = key.as_ref().to_vec();
        let (written, _) = self
            .txn(
                vec![Compare::Absent { key: key.clone() }],
                vec![TxnOp::Put {
                    key,
                    value: value.as_ref().to_vec(),
                    lease: None,
                }],
            )
            .await?;
        Ok(written)
    }

    /// Replaces `expect` with `update` iff `key` currently holds exactly
    /// `expect`. Returns whether the swap happened.
    pub async fn compare_and_swap(
        &self,
        key: impl AsRef<[u8]>,
        expect: impl AsRef<[u8]>,
        update: impl AsRef<[u8]>,
    ) -> Result<bool, StorageError> {
        let key = key.as_ref().to_vec();
        let (swapped, _) = self
            .txn(
                vec![Compare::Value {
                    key: key.clone(),
                    value: expect.as_ref().to_vec(),
                }],
                vec![TxnOp::Put {
                    key,
                    value: update.as_ref().to_vec(),
                    lease: None,
                }],
            )
            .await?;
        Ok(swapped)
    }

    /// Writes every pair of `write` iff every pair of `compare` holds, as one
    /// atomic step. Keys that only appear in `write` are written without a
    /// guard of their own. Returns whether the guards held.
    pub async fn transaction<C, W, CK, CV, WK, WV>(
        &self,
        compare: C,
        write: W,
    ) -> Result<bool, StorageError>
    where
        C: IntoIterator<Item = (CK, CV)>,
        W: IntoIterator<Item = (WK, WV)>,
        CK: AsRef<[u8]>,
        CV: AsRef<[u8]>,
        WK: AsRef<[u8]>,
        WV: AsRef<[u8]>,
    {
        let compare = compare
            .into_iter()
            .map(|(key, value)| Compare::Value {
                key: key.as_ref().to_vec(),
                value: value.as_ref().to_vec(),
            })
            .collect();
        let success = write
            .into_iter()
            .map(|(key, value)| TxnOp::Put {
                key: key.as_ref().to_vec(),
                value: value.as_ref().to_vec(),
                lease: None,
            })
            .collect();

        let (succeeded, _) = self.txn(compare, success).await?;
        Ok(succeeded)
    }

    pub async fn status(&self) -> Result<StoreStatus, StorageError> {
        match self.call(Request::Status).await? {
            Response::Status {
                member,
                revision,
                keys,
                leases,
            } => Ok(StoreStatus {
                member,
                revision,
                keys,
                leases,
            }),
            other => Err(unexpected("status", other)),
        }
    }

    /// Opens a fresh session and binds a mutex named `lock_key` to it.
    pub async fn new_mutex(&self, lock_key: &str) -> Result<DistributedMutex, StorageError> {
        let session = self.open_session().await?;
        Ok(DistributedMutex::new(self.clone(), session, lock_key))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Revokes every session lease and drops all pooled connections. Every
    /// later operation fails with [`StorageError::Closed`]. Closing twice is
    /// harmless.
    pub async fn close(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Ok(());
        }
        let revoked = self.revoke_all_sessions().await;
        if self.inner.pool.close() {
            info!("storage client closed");
        }
        revoked
    }

    pub(crate) async fn txn(
        &self,
        compare: Vec<Compare>,
        success: Vec<TxnOp>,
    ) -> Result<(bool, Revision), StorageError> {
        match self.call(Request::Txn { compare, success }).await? {
            Response::Txn {
                succeeded,
                revision,
            } => Ok((succeeded, revision)),
            other => Err(unexpected("txn", other)),
        }
    }

    /// Parks on the store until `key` is gone or `wait` elapses. Returns
    /// whether the key is gone.
    pub(crate) async fn wait_deleted(
        &self,
        key: &[u8],
        wait: Duration,
    ) -> Result<bool, StorageError> {
        let request = Request::WaitDeleted {
            key: key.to_vec(),
            timeout_ms: wait.as_millis() as u64,
        };
        match self
            .call_with_timeout(request, wait + self.inner.request_timeout)
            .await?
        {
            Response::Wait { deleted } => Ok(deleted),
            other => Err(unexpected("wait_deleted", other)),
        }
    }

    async fn call(&self, request: Request) -> Result<Response, StorageError> {
        self.call_with_timeout(request, self.inner.request_timeout)
            .await
    }

    async fn call_with_timeout(
        &self,
        request: Request,
        limit: Duration,
    ) -> Result<Response, StorageError> {
        let operation = request.operation();
        let pool = &self.inner.pool;
        if pool.is_closed() {
            return Err(StorageError::Closed);
        }

        let response = timeout(limit, exchange(pool, &request))
            .await
            .map_err(|_| StorageError::Timeout {
                operation,
                timeout: limit,
            })??;

        match response {
            Response::Error {
                code: ErrorCode::LeaseNotFound,
                ..
            } => Err(StorageError::SessionExpired {
                lease: request_lease(&request).unwrap_or_default(),
            }),
            Response::Error { message, .. } => Err(StorageError::Server(message)),
            response => Ok(response),
        }
    }
}

/// One request on a pooled connection. The connection goes back to the pool
/// only after a complete response; dropping this future mid-flight drops it.
async fn exchange(pool: &ConnectionPool, request: &Request) -> Result<Response, StorageError> {
    let mut connection = pool.checkout().await?;
    match connection.round_trip(request).await {
        Ok(response) => {
            pool.checkin(connection);
            Ok(response)
        }
        Err(err) => {
            debug!(
                endpoint = %connection.endpoint(),
                operation = request.operation(),
                error = %err,
                "request failed"
            );
            Err(err)
        }
    }
}

fn request_lease(request: &Request) -> Option<LeaseId> {
    match request {
        Request::Put { lease, .. } => *lease,
        Request::LeaseKeepAlive { lease } | Request::LeaseRevoke { lease } => Some(*lease),
        Request::Txn { success, .. } => success.iter().find_map(|op| match op {
            TxnOp::Put { lease, .. } => *lease,
            TxnOp::Delete { .. } => None,
        }),
        _ => None,
    }
}

fn unexpected(operation: &'static str, response: Response) -> StorageError {
    StorageError::UnexpectedResponse {
        operation,
        response: format!("{response:?}"),
    }
}
