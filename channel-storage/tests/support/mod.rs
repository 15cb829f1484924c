#![allow(dead_code)]

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use channel_storage::{
    client::StorageClient,
    config::{StorageClientConfig, StorageNodeConfig},
    node::StoreNode,
};
use tempfile::TempDir;

/// Single-member node config on ephemeral ports, storing under `dir`.
pub fn node_config(dir: &Path) -> StorageNodeConfig {
    StorageNodeConfig {
        id: "storage-1".to_string(),
        host: "127.0.0.1".to_string(),
        client_port: 0,
        peer_port: 0,
        token: "test-token".to_string(),
        cluster: "storage-1=http://127.0.0.1:0".to_string(),
        data_dir: dir.join("storage-1"),
        enabled: true,
    }
}

pub fn client_config(node: &StoreNode) -> Result<StorageClientConfig> {
    let addr = node.client_addr().context("node is not running")?;
    Ok(StorageClientConfig {
        connection_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        ..StorageClientConfig::for_endpoint(addr)
    })
}

/// A running node plus a client connected to it, both private to one test.
pub struct Fixture {
    pub node: StoreNode,
    pub client: StorageClient,
    dir: TempDir,
}

impl Fixture {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    /// Like [`start`](Self::start) but lets the test adjust the client
    /// config before connecting.
    pub async fn start_with(tweak: impl FnOnce(&mut StorageClientConfig)) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let node = StoreNode::start_new(node_config(dir.path()))
            .await
            .context("failed to start node")?;
        let mut config = client_config(&node)?;
        tweak(&mut config);
        let client = StorageClient::connect(&config)
            .await
            .context("failed to connect client")?;
        Ok(Self { node, client, dir })
    }

    /// Another client on the same node, as a second process would have.
    pub async fn connect_client(&self) -> Result<StorageClient> {
        Ok(StorageClient::connect(&client_config(&self.node)?).await?)
    }

    pub async fn connect_client_with(
        &self,
        tweak: impl FnOnce(&mut StorageClientConfig),
    ) -> Result<StorageClient> {
        let mut config = client_config(&self.node)?;
        tweak(&mut config);
        Ok(StorageClient::connect(&config).await?)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub async fn teardown(mut self) -> Result<()> {
        self.client.close().await?;
        self.node.close().await?;
        Ok(())
    }
}
