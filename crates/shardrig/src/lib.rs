//! # Shardrig
//!
//! Test-fixture orchestration for sharded database clusters.
//!
//! Shardrig stands up a complete multi-process topology on one machine (a
//! config replica set, a configurable number of shard groups, and query
//! routers), wires the pieces together, and tears everything down again
//! without leaking processes. It exists so functional tests can treat an
//! entire cluster as one fixture with a deterministic lifecycle:
//!
//! - **One contract** - every component satisfies [`Fixture`]: set up,
//!   await readiness under a deadline, report pids, tear down
//! - **Strict wiring order** - config before shards before routers, shard
//!   registration only against a ready cluster
//! - **Teardown that never leaks** - routers, then shards, then config;
//!   one failure never skips the rest
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardrig::{
//!     DEFAULT_READY_TIMEOUT, EphemeralPortAllocator, JsonLineDriver,
//!     ShardedClusterFixture, TeardownMode, Topology,
//! };
//!
//! let topology = Topology {
//!     shard_count: 2,
//!     server_executable: "/opt/db/bin/server".into(),
//!     router_executable: "/opt/db/bin/router".into(),
//!     ..Topology::default()
//! };
//!
//! let mut cluster = ShardedClusterFixture::new(
//!     topology,
//!     tmp_dir.path(),
//!     Arc::new(JsonLineDriver::new()),
//!     Arc::new(EphemeralPortAllocator::new()),
//! )?;
//! cluster.setup().await?;
//! cluster.await_ready(DEFAULT_READY_TIMEOUT).await?;
//!
//! // ... run the test against cluster.connection_string()? ...
//!
//! cluster.teardown(TeardownMode::Graceful).await?;
//! ```

mod admin;
mod alloc;
mod cluster;
mod error;
mod fixture;
mod node;
mod options;
mod process;
mod replset;
mod router;
mod topology;

pub use admin::{
    ADMIN_TIMEOUT, AdminCall, AuthOptions, COORDINATION_COMMANDS, Driver, JsonLineDriver,
    RecordingDriver, ReplSetMember, Session,
};
pub use alloc::{EphemeralPortAllocator, PortAllocator, SequentialPortAllocator};
pub use cluster::{BALANCER_TIMEOUT_MS, ShardGroup, ShardedClusterFixture};
pub use error::{Error, Result};
pub use fixture::{
    DEFAULT_READY_TIMEOUT, Fixture, LifecycleState, NodeInfo, READY_POLL_INTERVAL, TeardownHandler,
    TeardownMode, TeardownOutcome,
};
pub use node::{NodeConfig, NodeFixture};
pub use options::{
    KEY_CLUSTER_ROLE, KEY_CONFIG_ADDR, KEY_DATA_DIR, KEY_PORT, KEY_REPLSET_NAME, OptionMap,
    OptionValue, RESERVED_KEYS,
};
pub use replset::{ReplSetConfig, ReplicaSetFixture};
pub use router::{RouterConfig, RouterFixture};
pub use topology::{CONFIG_SET_NAME, Topology, shard_set_name};
