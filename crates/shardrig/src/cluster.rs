//! Sharded-cluster orchestrator.
//!
//! Owns the config replica set, the shard groups, and the routers, and
//! drives them through the lifecycle contract in a fixed order: config
//! first, shards next, routers last, then the wiring pass that registers
//! every shard and primes session caches. Teardown runs the same order in
//! reverse and never short-circuits, so one stubborn process cannot leave
//! its siblings running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::admin::{ADMIN_TIMEOUT, Driver, Session};
use crate::alloc::PortAllocator;
use crate::error::{Error, Result};
use crate::fixture::{
    Fixture, LifecycleState, NodeInfo, TeardownHandler, TeardownMode, TeardownOutcome,
};
use crate::node::{NodeConfig, NodeFixture};
use crate::options::KEY_CLUSTER_ROLE;
use crate::replset::{ReplSetConfig, ReplicaSetFixture};
use crate::router::{RouterConfig, RouterFixture};
use crate::topology::{CONFIG_SET_NAME, Topology, shard_set_name};

/// Bound on balancer start/stop round trips.
pub const BALANCER_TIMEOUT_MS: u64 = 60_000;

/// Shard migrations wait this long for the migration lock unless the caller
/// overrides the option.
const MIGRATION_LOCK_WAIT_MS: i64 = 30_000;

const KEY_MIGRATION_LOCK_WAIT: &str = "migration-lock-wait-ms";

/// One shard: either a standalone node or a replica set, per the topology's
/// `nodes_per_shard`.
pub enum ShardGroup {
    /// Single server process, no consensus group.
    Standalone(NodeFixture),

    /// Replicated shard.
    ReplicaSet(ReplicaSetFixture),
}

impl ShardGroup {
    /// Address whose session cache must be primed for this shard: the node
    /// itself when standalone, the elected primary otherwise.
    fn session_cache_target(&self) -> Result<String> {
        match self {
            Self::Standalone(node) => node.connection_string(),
            Self::ReplicaSet(set) => set
                .primary_address()
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Lifecycle(format!("shard {} has no elected primary", set.name()))
                }),
        }
    }
}

#[async_trait]
impl Fixture for ShardGroup {
    fn name(&self) -> &str {
        match self {
            Self::Standalone(node) => node.name(),
            Self::ReplicaSet(set) => set.name(),
        }
    }

    fn state(&self) -> LifecycleState {
        match self {
            Self::Standalone(node) => node.state(),
            Self::ReplicaSet(set) => set.state(),
        }
    }

    async fn setup(&mut self) -> Result<()> {
        match self {
            Self::Standalone(node) => node.setup().await,
            Self::ReplicaSet(set) => set.setup().await,
        }
    }

    async fn await_ready(&mut self, deadline: Duration) -> Result<()> {
        match self {
            Self::Standalone(node) => node.await_ready(deadline).await,
            Self::ReplicaSet(set) => set.await_ready(deadline).await,
        }
    }

    fn pids(&mut self) -> Vec<u32> {
        match self {
            Self::Standalone(node) => node.pids(),
            Self::ReplicaSet(set) => set.pids(),
        }
    }

    fn is_running(&mut self) -> bool {
        match self {
            Self::Standalone(node) => node.is_running(),
            Self::ReplicaSet(set) => set.is_running(),
        }
    }

    async fn teardown(&mut self, mode: TeardownMode) -> TeardownOutcome {
        match self {
            Self::Standalone(node) => node.teardown(mode).await,
            Self::ReplicaSet(set) => set.teardown(mode).await,
        }
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        match self {
            Self::Standalone(node) => node.node_info(),
            Self::ReplicaSet(set) => set.node_info(),
        }
    }

    fn connection_string(&self) -> Result<String> {
        match self {
            Self::Standalone(node) => node.connection_string(),
            Self::ReplicaSet(set) => set.connection_string(),
        }
    }
}

/// The whole sharded-cluster fixture.
pub struct ShardedClusterFixture {
    topology: Topology,
    data_dir: PathBuf,
    driver: Arc<dyn Driver>,
    allocator: Arc<dyn PortAllocator>,
    configsvr: Option<ReplicaSetFixture>,
    shards: Vec<ShardGroup>,
    routers: Vec<RouterFixture>,
    state: LifecycleState,
}

impl ShardedClusterFixture {
    /// Validates `topology` and creates the fixture. No sub-fixtures exist
    /// until `setup()`.
    pub fn new(
        topology: Topology,
        base_dir: &Path,
        driver: Arc<dyn Driver>,
        allocator: Arc<dyn PortAllocator>,
    ) -> Result<Self> {
        topology.validate()?;

        Ok(Self {
            topology,
            data_dir: base_dir.join("cluster"),
            driver,
            allocator,
            configsvr: None,
            shards: Vec::new(),
            routers: Vec::new(),
            state: LifecycleState::NotStarted,
        })
    }

    /// Fixture identifier.
    pub fn name(&self) -> &str {
        "sharded-cluster"
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Allocates sub-fixtures and starts every config and shard process.
    ///
    /// Idempotent: sub-fixtures that already exist are reused, and only
    /// those still in `NotStarted` are set up, so a retried call never
    /// double-spawns.
    pub async fn setup(&mut self) -> Result<()> {
        self.state = LifecycleState::SettingUp;

        if self.configsvr.is_none() {
            self.configsvr = Some(self.build_configsvr()?);
        }
        while self.shards.len() < self.topology.shard_count {
            let index = self.shards.len();
            let shard = self.build_shard(index)?;
            self.shards.push(shard);
        }

        let configsvr = self
            .configsvr
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("config replica set missing".to_string()))?;
        if configsvr.state() == LifecycleState::NotStarted {
            if let Err(err) = configsvr.setup().await {
                self.state = LifecycleState::Failed;
                return Err(err);
            }
        }
        for shard in &mut self.shards {
            if shard.state() == LifecycleState::NotStarted {
                if let Err(err) = shard.setup().await {
                    self.state = LifecycleState::Failed;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Blocks until every component is serving and the cluster is fully
    /// wired: shards registered, sharding enabled, session caches primed.
    pub async fn await_ready(&mut self, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        self.state = LifecycleState::AwaitingReady;

        if let Err(err) = self.wire(start, deadline).await {
            self.state = LifecycleState::Failed;
            return Err(err);
        }

        self.state = LifecycleState::Ready;
        info!(
            shards = self.shards.len(),
            routers = self.routers.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sharded cluster ready"
        );
        Ok(())
    }

    async fn wire(&mut self, start: Instant, deadline: Duration) -> Result<()> {
        let remaining = |start: Instant| deadline.saturating_sub(start.elapsed());

        let configsvr = self
            .configsvr
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("await_ready() called before setup()".to_string()))?;
        configsvr.await_ready(remaining(start)).await?;

        for shard in &mut self.shards {
            shard.await_ready(remaining(start)).await?;
        }

        // Routers are constructed here rather than in setup() so they are
        // always pointed at a config server already known to be reachable.
        if self.routers.is_empty() {
            let config_address = self
                .configsvr
                .as_ref()
                .ok_or_else(|| Error::Lifecycle("config replica set missing".to_string()))?
                .connection_string()?;
            for index in 0..self.topology.router_count {
                self.routers.push(RouterFixture::new(
                    RouterConfig {
                        name: format!("router{index}"),
                        executable: self.topology.router_executable.clone(),
                        config_address: config_address.clone(),
                        options: self.topology.router_options.clone(),
                    },
                    Arc::clone(&self.driver),
                    Arc::clone(&self.allocator),
                ));
            }
        }
        for router in &mut self.routers {
            if router.state() == LifecycleState::NotStarted {
                router.setup().await?;
            }
            router.await_ready(remaining(start)).await?;
        }

        let mut admin = self.admin_session().await?;

        if !self.topology.enable_balancer {
            admin.balancer_stop(BALANCER_TIMEOUT_MS).await?;
            info!("balancer disabled");
        }
        if !self.topology.enable_autosplit {
            admin.disable_autosplit().await?;
            info!("autosplit disabled");
        }

        for shard in &self.shards {
            admin.add_shard(&shard.connection_string()?).await?;
        }

        // Registration writes must be visible on every config member before
        // anything reads routing metadata through a fresh session.
        self.configsvr
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("config replica set missing".to_string()))?
            .await_last_op_committed()
            .await?;

        for database in &self.topology.enable_sharding {
            admin.enable_sharding(database).await?;
            info!(%database, "sharding enabled");
        }

        let mut cache_targets = Vec::with_capacity(self.shards.len() + 1);
        let config_primary = self
            .configsvr
            .as_ref()
            .and_then(|set| set.primary_address())
            .ok_or_else(|| {
                Error::Lifecycle("config replica set has no elected primary".to_string())
            })?;
        cache_targets.push(config_primary.to_string());
        for shard in &self.shards {
            cache_targets.push(shard.session_cache_target()?);
        }
        for target in cache_targets {
            let mut session = self.session(&target).await?;
            session.refresh_session_cache().await?;
        }

        Ok(())
    }

    /// All process ids owned by the cluster, config first.
    pub fn pids(&mut self) -> Vec<u32> {
        let mut pids = Vec::new();
        if let Some(configsvr) = self.configsvr.as_mut() {
            pids.extend(configsvr.pids());
        }
        for shard in &mut self.shards {
            pids.extend(shard.pids());
        }
        for router in &mut self.routers {
            pids.extend(router.pids());
        }
        pids
    }

    /// True iff every component process is alive.
    pub fn is_running(&mut self) -> bool {
        self.configsvr
            .as_mut()
            .is_some_and(ReplicaSetFixture::is_running)
            && self.shards.iter_mut().all(Fixture::is_running)
            && self.routers.iter_mut().all(RouterFixture::is_running)
    }

    /// Stops the whole cluster under `mode`: routers first, shards next,
    /// config last.
    ///
    /// Under [`TeardownMode::Graceful`] with the balancer enabled, the
    /// balancer is stopped first so no migration is mid-flight when shard
    /// processes receive their signal; a failure there is logged and
    /// teardown proceeds. Every component is attempted regardless of earlier
    /// failures; the aggregate error lists each component that did not stop
    /// cleanly.
    pub async fn teardown(&mut self, mode: TeardownMode) -> Result<()> {
        if !self.is_running() && self.state == LifecycleState::Ready {
            warn!("cluster teardown requested, but not all processes are running");
        }
        self.state = LifecycleState::TearingDown;

        if self.topology.enable_balancer && mode.runs_coordination() && !self.routers.is_empty() {
            match self.admin_session().await {
                Ok(mut admin) => {
                    if let Err(err) = admin.balancer_stop(BALANCER_TIMEOUT_MS).await {
                        warn!("failed to stop balancer before teardown: {err}");
                    }
                }
                Err(err) => warn!("no admin session for balancer stop: {err}"),
            }
        }

        let mut handler = TeardownHandler::new();
        for router in &mut self.routers {
            handler.teardown(router, mode).await;
        }
        for shard in &mut self.shards {
            handler.teardown(shard, mode).await;
        }
        if let Some(configsvr) = self.configsvr.as_mut() {
            handler.teardown(configsvr, mode).await;
        }

        self.state = if handler.was_successful() {
            LifecycleState::Stopped
        } else {
            LifecycleState::Failed
        };
        handler.into_result()
    }

    /// Node info for every running process: shards, then routers, then the
    /// config replica set.
    pub fn node_info(&self) -> Vec<NodeInfo> {
        let mut info = Vec::new();
        for shard in &self.shards {
            info.extend(shard.node_info());
        }
        for router in &self.routers {
            info.extend(router.node_info());
        }
        if let Some(configsvr) = &self.configsvr {
            info.extend(configsvr.node_info());
        }
        info
    }

    /// Comma-separated router addresses.
    pub fn connection_string(&self) -> Result<String> {
        if self.routers.is_empty() {
            return Err(Error::Lifecycle(
                "connection_string() called before the cluster became ready".to_string(),
            ));
        }
        let addresses: Vec<String> = self
            .routers
            .iter()
            .map(RouterFixture::connection_string)
            .collect::<Result<_>>()?;
        Ok(addresses.join(","))
    }

    /// Starts the balancer, bounded by `max_time_ms`.
    pub async fn start_balancer(&mut self, max_time_ms: u64) -> Result<()> {
        let mut admin = self.admin_session().await?;
        admin.balancer_start(max_time_ms).await
    }

    /// Stops the balancer, bounded by `max_time_ms`.
    pub async fn stop_balancer(&mut self, max_time_ms: u64) -> Result<()> {
        let mut admin = self.admin_session().await?;
        admin.balancer_stop(max_time_ms).await
    }

    async fn admin_session(&self) -> Result<Box<dyn Session>> {
        let router = self.routers.first().ok_or_else(|| {
            Error::Lifecycle("no router available for an admin session".to_string())
        })?;
        self.session(&router.connection_string()?).await
    }

    async fn session(&self, address: &str) -> Result<Box<dyn Session>> {
        let mut session = self.driver.connect(address, ADMIN_TIMEOUT).await?;
        if let Some(auth) = &self.topology.auth {
            session.authenticate(auth).await?;
        }
        Ok(session)
    }

    fn build_configsvr(&self) -> Result<ReplicaSetFixture> {
        ReplicaSetFixture::new(
            ReplSetConfig {
                set_name: CONFIG_SET_NAME.to_string(),
                configsvr: true,
                data_dir: self.data_dir.join("config"),
                executables: vec![
                    self.topology.server_executable.clone();
                    self.topology.config_nodes
                ],
                options: self
                    .topology
                    .server_options
                    .merged(&self.topology.configsvr_options),
                auth: self.topology.auth.clone(),
            },
            Arc::clone(&self.driver),
            Arc::clone(&self.allocator),
        )
    }

    fn build_shard(&self, index: usize) -> Result<ShardGroup> {
        let mut options = self
            .topology
            .server_options
            .merged(&self.topology.shard_options);
        options.set_default(KEY_MIGRATION_LOCK_WAIT, MIGRATION_LOCK_WAIT_MS);
        let data_dir = self.data_dir.join(format!("shard{index}"));

        match self.topology.nodes_per_shard {
            Some(_) => {
                let set = ReplicaSetFixture::new(
                    ReplSetConfig {
                        set_name: shard_set_name(index),
                        configsvr: false,
                        data_dir,
                        executables: self.topology.shard_executables(index),
                        options,
                        auth: self.topology.auth.clone(),
                    },
                    Arc::clone(&self.driver),
                    Arc::clone(&self.allocator),
                )?;
                Ok(ShardGroup::ReplicaSet(set))
            }
            None => {
                options.set(KEY_CLUSTER_ROLE, "shard");
                Ok(ShardGroup::Standalone(NodeFixture::new(
                    NodeConfig {
                        name: format!("shard{index}"),
                        executable: self.topology.server_executable.clone(),
                        data_dir,
                        options,
                    },
                    Arc::clone(&self.driver),
                    Arc::clone(&self.allocator),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RecordingDriver;
    use crate::alloc::SequentialPortAllocator;

    fn topology() -> Topology {
        Topology {
            shard_count: 2,
            server_executable: PathBuf::from("/usr/bin/dbserver"),
            router_executable: PathBuf::from("/usr/bin/dbrouter"),
            ..Topology::default()
        }
    }

    fn fixture(topology: Topology) -> Result<ShardedClusterFixture> {
        ShardedClusterFixture::new(
            topology,
            Path::new("/tmp/unused"),
            Arc::new(RecordingDriver::new()),
            Arc::new(SequentialPortAllocator::starting_at(20000)),
        )
    }

    #[test]
    fn test_invalid_topology_rejected_before_any_allocation() {
        let mut bad = topology();
        bad.router_count = 0;
        assert!(matches!(fixture(bad), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_new_cluster_owns_nothing() {
        let mut cluster = fixture(topology()).unwrap();
        assert_eq!(cluster.state(), LifecycleState::NotStarted);
        assert!(cluster.pids().is_empty());
        assert!(!cluster.is_running());
        assert!(cluster.node_info().is_empty());
    }

    #[test]
    fn test_connection_string_requires_routers() {
        let cluster = fixture(topology()).unwrap();
        assert!(matches!(
            cluster.connection_string(),
            Err(Error::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_await_ready_before_setup_is_lifecycle_error() {
        let mut cluster = fixture(topology()).unwrap();
        let err = cluster
            .await_ready(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(cluster.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_teardown_before_setup_is_noop_success() {
        let mut cluster = fixture(topology()).unwrap();
        assert!(cluster.teardown(TeardownMode::Graceful).await.is_ok());
        assert_eq!(cluster.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_standalone_shard_injects_role() {
        let mut spec = topology();
        spec.nodes_per_shard = None;
        let cluster = fixture(spec).unwrap();

        let shard = cluster.build_shard(0).unwrap();
        match shard {
            ShardGroup::Standalone(node) => assert_eq!(node.name(), "shard0"),
            ShardGroup::ReplicaSet(_) => panic!("expected standalone shard"),
        }
    }
}
