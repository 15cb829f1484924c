use std::{io, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::StateHandle;
use crate::protocol::{ErrorCode, Request, Response, read_message, write_message};

/// Accepts client connections and forwards their requests to the worker.
pub struct ClientListener {
    listener: TcpListener,
    state: StateHandle,
}

impl ClientListener {
    pub fn new(listener: TcpListener, state: StateHandle) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` fires, then waits for every connection task
    /// to finish before returning.
    pub async fn run_until(self, shutdown: CancellationToken) {
        let ClientListener { listener, state } = self;
        let mut connections = JoinSet::new();

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &shutdown, &mut connections);
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("client listener stopped");
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &StateHandle,
    shutdown: &CancellationToken,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let state = state.clone();
            let shutdown = shutdown.clone();
            connections.spawn(async move {
                debug!(peer = %peer, "client connected");
                if let Err(err) = handle_connection(stream, state, shutdown).await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: StateHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let message = select! {
            _ = shutdown.cancelled() => break,
            message = read_message::<_, Request>(&mut reader) => message,
        };

        let request = match message {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                let response = Response::Error {
                    code: ErrorCode::InvalidRequest,
                    message: err.to_string(),
                };
                write_message(&mut writer, &response).await?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let response = match request {
            Request::WaitDeleted { key, timeout_ms } => select! {
                _ = shutdown.cancelled() => break,
                response = wait_deleted(&state, key, Duration::from_millis(timeout_ms)) => response,
            },
            request => state.execute(request).await,
        };

        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

/// Parks until `key` is absent or `timeout` elapses, re-checking on every
/// revision change.
async fn wait_deleted(state: &StateHandle, key: Vec<u8>, timeout: Duration) -> Response {
    let mut revisions = state.revisions();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        // Mark the current revision seen before checking, so a delete landing
        // between the check and the wait still wakes us.
        revisions.borrow_and_update();

        let response = state
            .execute(Request::WaitDeleted {
                key: key.clone(),
                timeout_ms: 0,
            })
            .await;
        match response {
            Response::Wait { deleted: false } => {}
            other => return other,
        }

        select! {
            _ = &mut deadline => return Response::Wait { deleted: false },
            changed = revisions.changed() => {
                if changed.is_err() {
                    return Response::Error {
                        code: ErrorCode::Unavailable,
                        message: "store is shutting down".to_string(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{state::KvState, worker::spawn_worker};

    #[tokio::test]
    async fn wait_wakes_on_delete() {
        let shutdown = CancellationToken::new();
        let (state, _task) = spawn_worker("test".into(), KvState::new(), shutdown.clone());
        state
            .execute(Request::Put {
                key: b"k".to_vec(),
                value: Vec::new(),
                lease: None,
            })
            .await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                wait_deleted(&state, b"k".to_vec(), Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        state.execute(Request::Delete { key: b"k".to_vec() }).await;

        let response = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task");
        assert_eq!(response, Response::Wait { deleted: true });
        shutdown.cancel();
    }

    #[tokio::test]
    async fn wait_gives_up_after_timeout() {
        let shutdown = CancellationToken::new();
        let (state, _task) = spawn_worker("test".into(), KvState::new(), shutdown.clone());
        state
            .execute(Request::Put {
                key: b"k".to_vec(),
                value: Vec::new(),
                lease: None,
            })
            .await;

        let response = wait_deleted(&state, b"k".to_vec(), Duration::from_millis(100)).await;
        assert_eq!(response, Response::Wait { deleted: false });
        shutdown.cancel();
    }
}
