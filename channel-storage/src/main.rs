use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use channel_storage::{
    cli::{Cli, Command, EndpointArgs, ServeArgs},
    client::StorageClient,
    config::{StorageClientConfig, StorageConfig},
    node::StoreNode,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Get(args) => {
            let client = connect(&args.endpoint).await?;
            let value = client.get(&args.key).await;
            client.close().await?;
            match value? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => bail!("key '{}' not found", args.key),
            }
        }
        Command::Put(args) => {
            let client = connect(&args.endpoint).await?;
            let result = client.put(&args.key, &args.value).await;
            client.close().await?;
            result?;
        }
        Command::Delete(args) => {
            let client = connect(&args.endpoint).await?;
            let result = client.delete(&args.key).await;
            client.close().await?;
            result?;
        }
        Command::List(args) => {
            let client = connect(&args.endpoint).await?;
            let entries = client.range(&args.prefix).await;
            client.close().await?;
            for kv in entries? {
                println!(
                    "{}={}",
                    String::from_utf8_lossy(&kv.key),
                    String::from_utf8_lossy(&kv.value)
                );
            }
        }
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => StorageConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => StorageConfig::default(),
    };

    let mut node = StoreNode::start_new(config.payment_channel_storage_server)
        .await
        .context("failed to start storage node")?;
    let Some(addr) = node.client_addr() else {
        println!("storage node disabled");
        return Ok(());
    };
    println!("storage node listening on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down storage node");

    if let Err(err) = node.close().await {
        warn!("storage node stopped with error: {err:?}");
        return Err(err.into());
    }
    Ok(())
}

async fn connect(args: &EndpointArgs) -> Result<StorageClient> {
    StorageClient::connect(&StorageClientConfig {
        endpoints: vec![args.endpoint.clone()],
        ..StorageClientConfig::default()
    })
    .await
    .with_context(|| format!("failed to connect to {}", args.endpoint))
}
