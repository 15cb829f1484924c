//! Worker task that owns the node's key space.
//!
//! Connection handlers never touch [`KvState`] directly. They send a
//! [`Request`] with a oneshot reply channel and the worker applies requests
//! one at a time, which is what makes CAS and transactions atomic with
//! respect to every other writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::{KvState, StateError};
use crate::protocol::{ErrorCode, Request, Response, Revision};

/// Lease expiry is checked on every tick, so a lease outlives its TTL by at
/// most this much.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_QUEUE_DEPTH: usize = 256;

struct Command {
    request: Request,
    respond_to: oneshot::Sender<Response>,
}

/// Cloneable handle used by connection handlers to reach the worker.
#[derive(Clone)]
pub struct StateHandle {
    request_tx: mpsc::Sender<Command>,
    revision_rx: watch::Receiver<Revision>,
}

impl StateHandle {
    /// Applies `request` and waits for the worker's answer.
    pub async fn execute(&self, request: Request) -> Response {
        let (respond_to, response) = oneshot::channel();
        if self
            .request_tx
            .send(Command {
                request,
                respond_to,
            })
            .await
            .is_err()
        {
            return unavailable();
        }
        response.await.unwrap_or_else(|_| unavailable())
    }

    /// Receiver that changes whenever the store revision moves.
    pub fn revisions(&self) -> watch::Receiver<Revision> {
        self.revision_rx.clone()
    }
}

/// Spawns the worker. The join handle yields the final state once
/// `shutdown` fires, so the caller can persist it.
pub fn spawn_worker(
    member: String,
    state: KvState,
    shutdown: CancellationToken,
) -> (StateHandle, JoinHandle<KvState>) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (revision_tx, revision_rx) = watch::channel(state.revision());

    let worker = Worker {
        member: member.into(),
        state,
        request_rx,
        revision_tx,
    };
    let task = tokio::spawn(worker.run(shutdown));

    (
        StateHandle {
            request_tx,
            revision_rx,
        },
        task,
    )
}

struct Worker {
    member: Arc<str>,
    state: KvState,
    request_rx: mpsc::Receiver<Command>,
    revision_tx: watch::Sender<Revision>,
}

impl Worker {
    async fn run(mut self, shutdown: CancellationToken) -> KvState {
        let mut ticker = time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.request_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.expire_leases(),
            }
        }

        debug!(member = %self.member, revision = self.state.revision(), "worker stopped");
        self.state
    }

    fn handle(&mut self, command: Command) {
        let response = self.apply(command.request);
        // The requester may have timed out and gone away; the write stands.
        let _ = command.respond_to.send(response);
        self.publish_revision();
    }

    fn apply(&mut self, request: Request) -> Response {
        match request {
            Request::Get { key } => Response::Value {
                kv: self.state.get(&key),
            },
            Request::Range { prefix } => Response::Range {
                kvs: self.state.range(&prefix),
            },
            Request::Put { key, value, lease } => match self.state.put(key, value, lease) {
                Ok(revision) => Response::Done { revision },
                Err(err) => state_error(err),
            },
            Request::Delete { key } => Response::Done {
                revision: self.state.delete(&key),
            },
            Request::Txn { compare, success } => match self.state.txn(&compare, success) {
                Ok((succeeded, revision)) => Response::Txn {
                    succeeded,
                    revision,
                },
                Err(err) => state_error(err),
            },
            Request::LeaseGrant { ttl_ms } => {
                if ttl_ms == 0 {
                    return Response::Error {
                        code: ErrorCode::InvalidRequest,
                        message: "lease ttl must be positive".to_string(),
                    };
                }
                let lease = self
                    .state
                    .grant_lease(Duration::from_millis(ttl_ms), Instant::now());
                debug!(member = %self.member, lease, ttl_ms, "lease granted");
                Response::Lease { lease, ttl_ms }
            }
            Request::LeaseKeepAlive { lease } => {
                match self.state.keep_alive(lease, Instant::now()) {
                    Ok(ttl) => Response::Lease {
                        lease,
                        ttl_ms: ttl.as_millis() as u64,
                    },
                    Err(err) => state_error(err),
                }
            }
            Request::LeaseRevoke { lease } => match self.state.revoke_lease(lease) {
                Ok(revision) => {
                    debug!(member = %self.member, lease, "lease revoked");
                    Response::Revoked { revision }
                }
                Err(err) => state_error(err),
            },
            // Point-in-time check; connection handlers park on the revision
            // watch and ask again.
            Request::WaitDeleted { key, .. } => Response::Wait {
                deleted: self.state.get(&key).is_none(),
            },
            Request::Status => Response::Status {
                member: self.member.to_string(),
                revision: self.state.revision(),
                keys: self.state.len(),
                leases: self.state.lease_count(),
            },
        }
    }

    fn expire_leases(&mut self) {
        let expired = self.state.expire_leases(Instant::now());
        if !expired.is_empty() {
            info!(member = %self.member, ?expired, "leases expired");
            self.publish_revision();
        }
    }

    fn publish_revision(&self) {
        let revision = self.state.revision();
        self.revision_tx.send_if_modified(|current| {
            if *current == revision {
                return false;
            }
            *current = revision;
            true
        });
    }
}

fn state_error(err: StateError) -> Response {
    match err {
        StateError::LeaseNotFound(_) => Response::Error {
            code: ErrorCode::LeaseNotFound,
            message: err.to_string(),
        },
    }
}

fn unavailable() -> Response {
    Response::Error {
        code: ErrorCode::Unavailable,
        message: "store is shutting down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Compare, TxnOp};

    #[tokio::test]
    async fn applies_requests_in_order() {
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_worker("test".into(), KvState::new(), shutdown.clone());

        let put = handle
            .execute(Request::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                lease: None,
            })
            .await;
        assert_eq!(put, Response::Done { revision: 1 });

        let swap = handle
            .execute(Request::Txn {
                compare: vec![Compare::Value {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                }],
                success: vec![TxnOp::Put {
                    key: b"k".to_vec(),
                    value: b"w".to_vec(),
                    lease: None,
                }],
            })
            .await;
        assert_eq!(
            swap,
            Response::Txn {
                succeeded: true,
                revision: 2
            }
        );
        assert_eq!(*handle.revisions().borrow(), 2);

        shutdown.cancel();
        let state = task.await.expect("worker joins");
        assert_eq!(state.get(b"k").map(|kv| kv.value), Some(b"w".to_vec()));
    }

    #[tokio::test]
    async fn unknown_lease_is_reported() {
        let shutdown = CancellationToken::new();
        let (handle, _task) = spawn_worker("test".into(), KvState::new(), shutdown.clone());

        let response = handle.execute(Request::LeaseKeepAlive { lease: 42 }).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::LeaseNotFound,
                ..
            }
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn stopped_worker_answers_unavailable() {
        let shutdown = CancellationToken::new();
        let (handle, task) = spawn_worker("test".into(), KvState::new(), shutdown.clone());
        shutdown.cancel();
        task.await.expect("worker joins");

        let response = handle.execute(Request::Status).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Unavailable,
                ..
            }
        ));
    }
}
