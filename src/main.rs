// MeshDB node server entry point.

use meshdb::config::ClusterConfig;
use meshdb::error::{DbError, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let (config_path, node_id) = parse_args()?;
    let config = ClusterConfig::load(&config_path)?;
    tracing::info!(
        "meshdb {} - node {} starting ({} nodes configured)",
        meshdb::VERSION,
        node_id,
        config.nodes.len()
    );

    // Storage or bind failures surface here and exit non-zero.
    let node = meshdb::node::start(config, node_id).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(DbError::from)?;
    node.stop();
    Ok(())
}

fn parse_args() -> Result<(String, u64)> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut node_id = None;

    let mut iter = args.iter().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--config" => config_path = iter.next().cloned(),
            "--node-id" => node_id = iter.next().and_then(|v| v.parse().ok()),
            other => {
                return Err(DbError::Configuration(format!(
                    "unknown argument {}; usage: meshdb-node --config <file> --node-id <n>",
                    other
                )))
            }
        }
    }

    match (config_path, node_id) {
        (Some(config_path), Some(node_id)) => Ok((config_path, node_id)),
        _ => Err(DbError::Configuration(
            "usage: meshdb-node --config <file> --node-id <n>".to_string(),
        )),
    }
}
