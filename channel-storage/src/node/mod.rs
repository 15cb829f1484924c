//! Store node lifecycle.
//!
//! A [`StoreNode`] owns everything a running member needs: the worker that
//! holds the key space, the client listener, the peer listener and the data
//! directory the key space is persisted to. [`StoreNode::start`] brings all
//! of it up, [`StoreNode::close`] tears it down and writes the snapshot.

pub mod cluster;
pub mod peer;
pub mod persist;
pub mod server;
pub mod state;
pub mod worker;

use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StorageNodeConfig;
use crate::error::NodeError;
use cluster::ClusterMembership;
use peer::PeerListener;
use server::ClientListener;
use state::KvState;

pub struct StoreNode {
    config: StorageNodeConfig,
    running: Option<RunningNode>,
}

struct RunningNode {
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
    listeners: JoinSet<()>,
    worker: JoinHandle<KvState>,
}

impl StoreNode {
    pub fn new(config: StorageNodeConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    /// Builds a node from `config` and starts it.
    pub async fn start_new(config: StorageNodeConfig) -> Result<Self, NodeError> {
        let mut node = Self::new(config);
        node.start().await?;
        Ok(node)
    }

    pub fn config(&self) -> &StorageNodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address clients connect to, once started.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.client_addr)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.peer_addr)
    }

    /// Client endpoint URL in the form the client config expects.
    pub fn client_endpoint(&self) -> Option<String> {
        self.client_addr().map(|addr| format!("http://{addr}"))
    }

    /// Starts serving. A disabled node does nothing: the store is then
    /// expected to be managed outside this process.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        let config = &self.config;
        if !config.enabled {
            info!(member = %config.id, "storage node disabled, expecting an external store");
            return Ok(());
        }
        if let Some(running) = &self.running {
            return Err(NodeError::AlreadyRunning(running.client_addr));
        }

        let cluster = ClusterMembership::parse(&config.cluster)?;
        cluster.require_member(&config.id)?;

        persist::prepare_data_dir(&config.data_dir, &config.id, &config.token).await?;
        let state = match persist::load_snapshot(&config.data_dir).await? {
            Some(snapshot) => {
                let state = KvState::restore(snapshot, Instant::now());
                info!(
                    member = %config.id,
                    revision = state.revision(),
                    keys = state.len(),
                    "restored snapshot"
                );
                state
            }
            None => KvState::new(),
        };

        // Both listeners are bound before anything is spawned, so a failure
        // on the second drops the first and nothing is left listening.
        let client_listener = bind("client", config.client_listen_addr()).await?;
        let peer_listener = bind("peer", config.peer_listen_addr()).await?;
        let client_addr = listener_addr("client", &client_listener)?;
        let peer_addr = listener_addr("peer", &peer_listener)?;

        let shutdown = CancellationToken::new();
        let (handle, worker) = worker::spawn_worker(config.id.clone(), state, shutdown.clone());

        let mut listeners = JoinSet::new();
        listeners.spawn(ClientListener::new(client_listener, handle).run_until(shutdown.clone()));
        listeners.spawn(
            PeerListener::new(
                peer_listener,
                config.id.clone(),
                config.token.clone(),
                cluster.clone(),
            )
            .run_until(shutdown.clone()),
        );
        listeners.spawn(peer::announce(
            cluster,
            config.id.clone(),
            config.token.clone(),
            shutdown.clone(),
        ));

        info!(
            member = %config.id,
            client = %client_addr,
            peer = %peer_addr,
            data_dir = ?config.data_dir,
            "storage node started"
        );

        self.running = Some(RunningNode {
            client_addr,
            peer_addr,
            shutdown,
            listeners,
            worker,
        });
        Ok(())
    }

    /// Stops serving, waits for every task, then persists the key space.
    /// Closing a node that is not running is a no-op.
    pub async fn close(&mut self) -> Result<(), NodeError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        while let Some(result) = running.listeners.join_next().await {
            if let Err(err) = result {
                warn!(member = %self.config.id, error = %err, "node task ended abnormally");
            }
        }

        let state = running
            .worker
            .await
            .map_err(|err| NodeError::Task(err.to_string()))?;
        persist::write_snapshot(&self.config.data_dir, &state.snapshot()).await?;

        info!(
            member = %self.config.id,
            revision = state.revision(),
            keys = state.len(),
            "storage node stopped"
        );
        Ok(())
    }
}

impl Drop for StoreNode {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            warn!(member = %self.config.id, "storage node dropped without close; state not flushed");
            running.shutdown.cancel();
        }
    }
}

async fn bind(role: &'static str, addr: String) -> Result<TcpListener, NodeError> {
    TcpListener::bind(&addr)
        .await
        .map_err(|source| NodeError::Bind { role, addr, source })
}

fn listener_addr(role: &'static str, listener: &TcpListener) -> Result<SocketAddr, NodeError> {
    listener.local_addr().map_err(|source| NodeError::Bind {
        role,
        addr: "<unknown>".to_string(),
        source,
    })
}
