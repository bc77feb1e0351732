//! Process option maps.
//!
//! Callers hand each fixture an opaque mapping of option keys to primitive
//! values, passed through verbatim as process configuration. The
//! orchestrator injects its own mandatory keys (data directory, cluster
//! role, replica-set name, the router's config-server address); supplying a
//! reserved key explicitly is a configuration error.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Data directory path, injected per node.
pub const KEY_DATA_DIR: &str = "data-dir";

/// Listening port. May be pre-assigned by the caller; allocated otherwise.
pub const KEY_PORT: &str = "port";

/// Consensus group name, injected per replica-set member.
pub const KEY_REPLSET_NAME: &str = "replset-name";

/// Cluster role marker (`config` or `shard`), injected per node.
pub const KEY_CLUSTER_ROLE: &str = "cluster-role";

/// Config replica set address, injected per router.
pub const KEY_CONFIG_ADDR: &str = "config-address";

/// Keys only the orchestrator may set.
pub const RESERVED_KEYS: &[&str] = &[
    KEY_DATA_DIR,
    KEY_REPLSET_NAME,
    KEY_CLUSTER_ROLE,
    KEY_CONFIG_ADDR,
];

/// A primitive option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Boolean flag. `true` renders as a bare `--key`; `false` is omitted.
    Bool(bool),

    /// Integer value.
    Int(i64),

    /// String value.
    String(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u16> for OptionValue {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Ordered map of process options, rendered deterministically to argv.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionMap(BTreeMap<String, OptionValue>);

impl OptionMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Sets `key` only if it is not already present.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    /// True if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlays `other` onto this map; entries in `other` win.
    pub fn merge(&mut self, other: &OptionMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Returns a copy with `other` overlaid.
    pub fn merged(&self, other: &OptionMap) -> OptionMap {
        let mut combined = self.clone();
        combined.merge(other);
        combined
    }

    /// Rejects maps that name a reserved key. `context` names the option
    /// group for the error message.
    pub fn ensure_no_reserved(&self, context: &str) -> Result<()> {
        for key in RESERVED_KEYS {
            if self.0.contains_key(*key) {
                return Err(Error::Configuration(format!(
                    "option `{key}` is injected by the orchestrator and cannot \
                     be supplied in {context} options"
                )));
            }
        }
        Ok(())
    }

    /// The pre-assigned port, if one was supplied.
    pub fn port(&self) -> Option<u16> {
        match self.0.get(KEY_PORT) {
            Some(OptionValue::Int(port)) => u16::try_from(*port).ok(),
            _ => None,
        }
    }

    /// Renders the map as command-line arguments: `--key value` pairs in key
    /// order, bare `--key` for `Bool(true)`, nothing for `Bool(false)`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.0 {
            match value {
                OptionValue::Bool(true) => args.push(format!("--{key}")),
                OptionValue::Bool(false) => {}
                other => {
                    args.push(format!("--{key}"));
                    args.push(other.to_string());
                }
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_key_rejected() {
        let mut options = OptionMap::new();
        options.set(KEY_DATA_DIR, "/tmp/elsewhere");

        let err = options.ensure_no_reserved("shard").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("data-dir"));
        assert!(text.contains("shard"));
    }

    #[test]
    fn test_passthrough_keys_accepted() {
        let mut options = OptionMap::new();
        options.set("storage-engine", "wired");
        options.set(KEY_PORT, 20000u16);

        assert!(options.ensure_no_reserved("router").is_ok());
        assert_eq!(options.port(), Some(20000));
    }

    #[test]
    fn test_args_rendering() {
        let mut options = OptionMap::new();
        options.set("verbose", true);
        options.set("quiet", false);
        options.set(KEY_PORT, 20017u16);
        options.set("name", "alpha");

        assert_eq!(
            options.to_args(),
            vec!["--name", "alpha", "--port", "20017", "--verbose"]
        );
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = OptionMap::new();
        base.set("cache-mb", 128i64);
        base.set("verbose", true);

        let mut overlay = OptionMap::new();
        overlay.set("cache-mb", 256i64);

        let combined = base.merged(&overlay);
        assert_eq!(combined.get("cache-mb"), Some(&OptionValue::Int(256)));
        assert_eq!(combined.get("verbose"), Some(&OptionValue::Bool(true)));
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let mut options = OptionMap::new();
        options.set("wait-ms", 1000i64);
        options.set_default("wait-ms", 30000i64);
        options.set_default("retries", 3i64);

        assert_eq!(options.get("wait-ms"), Some(&OptionValue::Int(1000)));
        assert_eq!(options.get("retries"), Some(&OptionValue::Int(3)));
    }
}
