//! Topology specification.
//!
//! An immutable description of the cluster to stand up: how many shards,
//! how many nodes per shard, how many routers, and the option overrides
//! each component receives. Validation runs before any process starts; a
//! bad topology never spawns anything.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::admin::AuthOptions;
use crate::error::{Error, Result};
use crate::options::OptionMap;

/// Reserved consensus group name for the config replica set.
pub const CONFIG_SET_NAME: &str = "config-rs";

/// Consensus group name for the shard at `index`.
pub fn shard_set_name(index: usize) -> String {
    format!("shard-rs{index}")
}

/// Immutable topology parameters for one sharded cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Number of shards.
    pub shard_count: usize,

    /// Replica-set size per shard. Absent selects standalone shards; zero
    /// is a configuration error, never the standalone path.
    pub nodes_per_shard: Option<u32>,

    /// Number of router processes.
    pub router_count: usize,

    /// Members in the config replica set.
    pub config_nodes: usize,

    /// Databases to enable sharding on, in order.
    pub enable_sharding: Vec<String>,

    /// Whether the balancer stays enabled. When false, the balancer is
    /// stopped before any shard is registered.
    pub enable_balancer: bool,

    /// Whether automatic chunk splitting stays enabled.
    pub enable_autosplit: bool,

    /// Server executable for config and shard nodes.
    pub server_executable: PathBuf,

    /// Router executable.
    pub router_executable: PathBuf,

    /// Per-node server executable overrides for mixed binary versions,
    /// ordered shard-major. Length must equal
    /// `shard_count * nodes_per_shard`.
    pub version_assignment: Option<Vec<PathBuf>>,

    /// Passthrough options for every server node.
    pub server_options: OptionMap,

    /// Passthrough options for every router.
    pub router_options: OptionMap,

    /// Extra server options for config nodes only; overrides
    /// `server_options` on conflict.
    pub configsvr_options: OptionMap,

    /// Extra server options for shard nodes only; overrides
    /// `server_options` on conflict.
    pub shard_options: OptionMap,

    /// Credentials for administrative sessions.
    pub auth: Option<AuthOptions>,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            shard_count: 1,
            nodes_per_shard: Some(1),
            router_count: 1,
            config_nodes: 1,
            enable_sharding: Vec::new(),
            enable_balancer: true,
            enable_autosplit: true,
            server_executable: PathBuf::new(),
            router_executable: PathBuf::new(),
            version_assignment: None,
            server_options: OptionMap::new(),
            router_options: OptionMap::new(),
            configsvr_options: OptionMap::new(),
            shard_options: OptionMap::new(),
            auth: None,
        }
    }
}

impl Topology {
    /// Validates the topology. Called by the orchestrator before anything
    /// is allocated or spawned.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Configuration(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.router_count == 0 {
            return Err(Error::Configuration(
                "router_count must be at least 1".to_string(),
            ));
        }
        if self.config_nodes == 0 {
            return Err(Error::Configuration(
                "config_nodes must be at least 1".to_string(),
            ));
        }
        if self.nodes_per_shard == Some(0) {
            return Err(Error::Configuration(
                "nodes_per_shard must be at least 1; omit it entirely for \
                 standalone shards"
                    .to_string(),
            ));
        }
        if self.server_executable.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "server_executable must be set".to_string(),
            ));
        }
        if self.router_executable.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "router_executable must be set".to_string(),
            ));
        }

        if let Some(versions) = &self.version_assignment {
            let Some(nodes_per_shard) = self.nodes_per_shard else {
                return Err(Error::Configuration(
                    "version_assignment cannot be combined with standalone \
                     shards"
                        .to_string(),
                ));
            };
            let expected = self.shard_count * nodes_per_shard as usize;
            if versions.len() != expected {
                return Err(Error::Configuration(format!(
                    "version_assignment has {} entries but the topology has \
                     {expected} shard nodes ({} shards x {nodes_per_shard} \
                     nodes)",
                    versions.len(),
                    self.shard_count
                )));
            }
        }

        self.server_options.ensure_no_reserved("server")?;
        self.router_options.ensure_no_reserved("router")?;
        self.configsvr_options.ensure_no_reserved("config server")?;
        self.shard_options.ensure_no_reserved("shard")?;

        Ok(())
    }

    /// Executables for the nodes of the shard at `index`: the version
    /// assignment slice when one was supplied, the default server
    /// executable otherwise.
    pub fn shard_executables(&self, index: usize) -> Vec<PathBuf> {
        let nodes = self.nodes_per_shard.map_or(1, |count| count as usize);
        match &self.version_assignment {
            Some(versions) => versions[index * nodes..(index + 1) * nodes].to_vec(),
            None => vec![self.server_executable.clone(); nodes],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::KEY_DATA_DIR;

    fn valid() -> Topology {
        Topology {
            shard_count: 2,
            nodes_per_shard: Some(1),
            server_executable: PathBuf::from("/usr/bin/dbserver"),
            router_executable: PathBuf::from("/usr/bin/dbrouter"),
            ..Topology::default()
        }
    }

    #[test]
    fn test_valid_topology() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_nodes_per_shard_is_configuration_error() {
        let mut topology = valid();
        topology.nodes_per_shard = Some(0);

        let err = topology.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("standalone"));
    }

    #[test]
    fn test_absent_nodes_per_shard_selects_standalone() {
        let mut topology = valid();
        topology.nodes_per_shard = None;
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_version_assignment_length_must_match() {
        let mut topology = valid();
        topology.version_assignment = Some(vec![
            PathBuf::from("/opt/v1/dbserver"),
            PathBuf::from("/opt/v1/dbserver"),
            PathBuf::from("/opt/v2/dbserver"),
        ]);

        let err = topology.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("3 entries"));
    }

    #[test]
    fn test_version_assignment_matching_length_accepted() {
        let mut topology = valid();
        topology.nodes_per_shard = Some(2);
        topology.version_assignment = Some(vec![
            PathBuf::from("/opt/v1/dbserver"),
            PathBuf::from("/opt/v2/dbserver"),
            PathBuf::from("/opt/v1/dbserver"),
            PathBuf::from("/opt/v2/dbserver"),
        ]);

        assert!(topology.validate().is_ok());
        assert_eq!(
            topology.shard_executables(1),
            vec![
                PathBuf::from("/opt/v1/dbserver"),
                PathBuf::from("/opt/v2/dbserver"),
            ]
        );
    }

    #[test]
    fn test_version_assignment_with_standalone_shards_rejected() {
        let mut topology = valid();
        topology.nodes_per_shard = None;
        topology.version_assignment = Some(vec![PathBuf::from("/opt/v1/dbserver"); 2]);

        let err = topology.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_reserved_option_keys_rejected() {
        let mut topology = valid();
        topology.shard_options.set(KEY_DATA_DIR, "/somewhere");

        let err = topology.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut topology = valid();
        topology.shard_count = 0;
        assert!(matches!(
            topology.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_shard_set_names_derive_from_index() {
        assert_eq!(shard_set_name(0), "shard-rs0");
        assert_eq!(shard_set_name(3), "shard-rs3");
    }
}
