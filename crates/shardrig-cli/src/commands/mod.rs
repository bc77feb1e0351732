//! CLI command implementations.

pub mod up;
pub mod validate;

use std::fs;

use anyhow::{Context, Result};
use shardrig::Topology;

/// Loads and parses a topology file.
pub fn load_topology(path: &str) -> Result<Topology> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read topology file {path}"))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse topology file {path}"))
}
