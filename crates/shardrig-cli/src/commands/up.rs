//! Up command - stands the cluster up and keeps it running until Ctrl+C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shardrig::{
    EphemeralPortAllocator, JsonLineDriver, ShardedClusterFixture, TeardownMode,
};
use tracing::info;

use super::load_topology;

pub async fn run(topology_path: &str, data_dir: &str, timeout_secs: u64) -> Result<()> {
    let topology = load_topology(topology_path)?;
    let deadline = Duration::from_secs(timeout_secs);

    let mut cluster = ShardedClusterFixture::new(
        topology,
        Path::new(data_dir),
        Arc::new(JsonLineDriver::new()),
        Arc::new(EphemeralPortAllocator::new()),
    )
    .context("Invalid topology")?;

    info!("Starting cluster processes...");
    cluster.setup().await.context("Cluster setup failed")?;
    if let Err(err) = cluster.await_ready(deadline).await {
        // Leave nothing behind when wiring fails.
        let _ = cluster.teardown(TeardownMode::Kill).await;
        return Err(err).context("Cluster did not become ready");
    }

    print_cluster(&cluster)?;

    println!();
    println!("Cluster is ready. Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;

    info!("Stopping cluster...");
    cluster
        .teardown(TeardownMode::Graceful)
        .await
        .context("Cluster teardown failed")?;

    println!();
    println!("Cluster stopped gracefully.");
    Ok(())
}

fn print_cluster(cluster: &ShardedClusterFixture) -> Result<()> {
    println!();
    println!("Shardrig cluster");
    println!();
    println!(
        "  Connection:     {}",
        cluster
            .connection_string()
            .context("Cluster has no routers")?
    );
    for node in cluster.node_info() {
        println!(
            "  {:<16}port {:<6} pid {}",
            node.name, node.port, node.pid
        );
    }
    Ok(())
}
