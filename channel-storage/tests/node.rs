mod support;

use anyhow::{Context, Result, anyhow};
use channel_storage::{
    client::StorageClient,
    config::StorageNodeConfig,
    error::NodeError,
    node::{StoreNode, peer},
    protocol::PeerMessage,
};
use tokio::net::TcpListener;

use support::{client_config, node_config};

async fn start_error(config: StorageNodeConfig) -> Result<NodeError> {
    match StoreNode::start_new(config).await {
        Ok(mut node) => {
            node.close().await?;
            Err(anyhow!("node started although it should not"))
        }
        Err(err) => Ok(err),
    }
}

#[tokio::test]
async fn disabled_node_does_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageNodeConfig {
        enabled: false,
        ..node_config(dir.path())
    };
    let data_dir = config.data_dir.clone();

    let mut node = StoreNode::start_new(config).await?;
    assert!(!node.is_running());
    assert_eq!(node.client_addr(), None);
    assert!(!data_dir.exists());

    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn occupied_port_fails_to_bind() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let occupied = TcpListener::bind("127.0.0.1:0").await?;
    let config = StorageNodeConfig {
        client_port: occupied.local_addr()?.port(),
        ..node_config(dir.path())
    };

    let err = start_error(config).await?;
    assert!(
        matches!(err, NodeError::Bind { role: "client", .. }),
        "unexpected error: {err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn malformed_cluster_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;

    for cluster in [
        "",
        "storage-1",
        "storage-1=not-a-url",
        "storage-1=http://127.0.0.1:2380,storage-1=http://127.0.0.1:2390",
    ] {
        let config = StorageNodeConfig {
            cluster: cluster.to_string(),
            ..node_config(dir.path())
        };
        let err = start_error(config).await?;
        assert!(
            matches!(err, NodeError::InvalidCluster { .. }),
            "cluster {cluster:?} gave {err:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn node_must_be_listed_in_cluster() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageNodeConfig {
        cluster: "storage-2=http://127.0.0.1:2380".to_string(),
        ..node_config(dir.path())
    };

    let err = start_error(config).await?;
    assert!(matches!(err, NodeError::NotAMember { .. }), "unexpected error: {err:?}");
    Ok(())
}

#[tokio::test]
async fn second_start_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut node = StoreNode::start_new(node_config(dir.path())).await?;

    let err = node.start().await.expect_err("node is already running");
    assert!(matches!(err, NodeError::AlreadyRunning(_)), "unexpected error: {err:?}");

    node.close().await?;
    node.close().await?;
    assert!(!node.is_running());
    Ok(())
}

#[tokio::test]
async fn data_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let mut node = StoreNode::start_new(node_config(dir.path())).await?;
    let client = StorageClient::connect(&client_config(&node)?).await?;
    client.put("/payment-channel/persisted", "yes").await?;
    client.put("scratch", "gone").await?;
    client.delete("scratch").await?;
    client.close().await?;
    node.close().await?;

    let mut node = StoreNode::start_new(node_config(dir.path())).await?;
    let client = StorageClient::connect(&client_config(&node)?).await?;
    assert_eq!(
        client.get("/payment-channel/persisted").await?,
        Some(b"yes".to_vec())
    );
    assert_eq!(client.get("scratch").await?, None);
    assert_eq!(client.status().await?.keys, 1);

    client.close().await?;
    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn data_dir_belongs_to_one_member() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut node = StoreNode::start_new(node_config(dir.path())).await?;
    node.close().await?;

    let config = StorageNodeConfig {
        id: "storage-2".to_string(),
        cluster: "storage-2=http://127.0.0.1:0".to_string(),
        ..node_config(dir.path())
    };
    let err = start_error(config).await?;
    assert!(matches!(err, NodeError::MemberMismatch { .. }), "unexpected error: {err:?}");
    Ok(())
}

#[tokio::test]
async fn peers_are_checked_against_token_and_membership() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StorageNodeConfig {
        cluster: "storage-1=http://127.0.0.1:0,storage-2=http://127.0.0.1:1".to_string(),
        ..node_config(dir.path())
    };
    let token = config.token.clone();
    let mut node = StoreNode::start_new(config).await?;
    let peer_addr = node.peer_addr().context("peer listener")?.to_string();

    let reply = peer::handshake(&peer_addr, "storage-2", &token).await?;
    assert_eq!(
        reply,
        PeerMessage::Welcome {
            member: "storage-1".to_string()
        }
    );

    let reply = peer::handshake(&peer_addr, "storage-2", "wrong-token").await?;
    assert!(matches!(reply, PeerMessage::Rejected { .. }), "unexpected reply: {reply:?}");

    let reply = peer::handshake(&peer_addr, "intruder", &token).await?;
    assert!(matches!(reply, PeerMessage::Rejected { .. }), "unexpected reply: {reply:?}");

    node.close().await?;
    Ok(())
}

#[tokio::test]
async fn clients_fail_once_node_is_closed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut node = StoreNode::start_new(node_config(dir.path())).await?;
    let client = StorageClient::connect(&client_config(&node)?).await?;
    client.put("key", "value").await?;

    node.close().await?;
    assert!(client.get("key").await.is_err());

    client.close().await?;
    Ok(())
}
