//! Validate command - checks a topology file without starting processes.

use anyhow::{Context, Result};

use super::load_topology;

pub fn run(path: &str) -> Result<()> {
    let topology = load_topology(path)?;
    topology
        .validate()
        .with_context(|| format!("Topology file {path} is invalid"))?;

    let shard_nodes = topology
        .nodes_per_shard
        .map_or("standalone".to_string(), |count| {
            format!("{count}-node replica set")
        });

    println!("Topology OK");
    println!();
    println!("  Shards:         {} ({shard_nodes} each)", topology.shard_count);
    println!("  Routers:        {}", topology.router_count);
    println!("  Config nodes:   {}", topology.config_nodes);
    println!("  Balancer:       {}", on_off(topology.enable_balancer));
    println!("  Autosplit:      {}", on_off(topology.enable_autosplit));
    if !topology.enable_sharding.is_empty() {
        println!("  Sharded DBs:    {}", topology.enable_sharding.join(", "));
    }

    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}
