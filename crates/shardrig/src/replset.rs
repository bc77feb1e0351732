//! Replica-set fixture: a named group of node fixtures plus consensus
//! bootstrap.
//!
//! Consensus internals belong to the servers; this fixture only drives the
//! external lifecycle contract: start every member, initiate the set
//! through the driver, wait for a primary, and expose the write-visibility
//! barrier the orchestrator needs between wiring steps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::admin::{ADMIN_TIMEOUT, AuthOptions, Driver, ReplSetMember, Session};
use crate::alloc::PortAllocator;
use crate::error::{Error, Result};
use crate::fixture::{
    Fixture, LifecycleState, NodeInfo, READY_POLL_INTERVAL, TeardownMode, TeardownOutcome,
};
use crate::node::{NodeConfig, NodeFixture};
use crate::options::{KEY_CLUSTER_ROLE, KEY_REPLSET_NAME, OptionMap};

/// Configuration for a replica-set fixture.
#[derive(Debug, Clone)]
pub struct ReplSetConfig {
    /// Consensus group name; also the fixture name.
    pub set_name: String,

    /// Whether this set stores replicated cluster config metadata.
    pub configsvr: bool,

    /// Base data directory; each member gets a subdirectory.
    pub data_dir: PathBuf,

    /// One executable per member. The length fixes the member count, which
    /// lets mixed binary versions assign a different build per node.
    pub executables: Vec<PathBuf>,

    /// Passthrough options shared by every member.
    pub options: OptionMap,

    /// Credentials for administrative sessions, if the deployment requires
    /// them.
    pub auth: Option<AuthOptions>,
}

/// Fixture wrapping one replica set of server processes.
pub struct ReplicaSetFixture {
    config: ReplSetConfig,
    driver: Arc<dyn Driver>,
    members: Vec<NodeFixture>,
    primary: Option<String>,
    state: LifecycleState,
}

impl ReplicaSetFixture {
    /// Creates the fixture and its member node fixtures. No resources are
    /// allocated until `setup()`.
    pub fn new(
        config: ReplSetConfig,
        driver: Arc<dyn Driver>,
        allocator: Arc<dyn PortAllocator>,
    ) -> Result<Self> {
        if config.executables.is_empty() {
            return Err(Error::Configuration(format!(
                "replica set {} must have at least one member",
                config.set_name
            )));
        }
        config
            .options
            .ensure_no_reserved(&format!("replica set {}", config.set_name))?;

        let role = if config.configsvr { "config" } else { "shard" };
        let members = config
            .executables
            .iter()
            .enumerate()
            .map(|(index, executable)| {
                let mut options = config.options.clone();
                options.set(KEY_REPLSET_NAME, config.set_name.as_str());
                options.set(KEY_CLUSTER_ROLE, role);

                NodeFixture::new(
                    NodeConfig {
                        name: format!("{}-node{index}", config.set_name),
                        executable: executable.clone(),
                        data_dir: config.data_dir.join(format!("node{index}")),
                        options,
                    },
                    Arc::clone(&driver),
                    Arc::clone(&allocator),
                )
            })
            .collect();

        Ok(Self {
            config,
            driver,
            members,
            primary: None,
            state: LifecycleState::NotStarted,
        })
    }

    /// Number of members in the set.
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Address of the current primary, once a primary has been elected.
    pub fn primary_address(&self) -> Option<&str> {
        self.primary.as_deref()
    }

    /// Blocks until the set's last committed operation has reached every
    /// member. Required before a later-constructed router may read cluster
    /// metadata, so it never observes a snapshot stale relative to earlier
    /// registration writes.
    pub async fn await_last_op_committed(&mut self) -> Result<()> {
        let primary = self.primary.clone().ok_or_else(|| {
            Error::Lifecycle(format!(
                "replica set {} has no elected primary",
                self.config.set_name
            ))
        })?;
        let mut session = self.admin_session(&primary).await?;
        session.await_last_op_committed().await
    }

    /// Opens an administrative session against `address`, authenticating
    /// when the deployment requires credentials.
    async fn admin_session(&self, address: &str) -> Result<Box<dyn Session>> {
        let mut session = self.driver.connect(address, ADMIN_TIMEOUT).await?;
        if let Some(auth) = &self.config.auth {
            session.authenticate(auth).await?;
        }
        Ok(session)
    }
}

#[async_trait]
impl Fixture for ReplicaSetFixture {
    fn name(&self) -> &str {
        &self.config.set_name
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    async fn setup(&mut self) -> Result<()> {
        if self.state != LifecycleState::NotStarted {
            return Err(Error::Lifecycle(format!(
                "setup() called on replica set {} in state {}",
                self.config.set_name, self.state
            )));
        }
        self.state = LifecycleState::SettingUp;

        for member in &mut self.members {
            if let Err(err) = member.setup().await {
                self.state = LifecycleState::Failed;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn await_ready(&mut self, deadline: Duration) -> Result<()> {
        if self.state == LifecycleState::Ready {
            return Ok(());
        }
        if self.state == LifecycleState::NotStarted {
            return Err(Error::Lifecycle(format!(
                "await_ready() called on replica set {} before setup()",
                self.config.set_name
            )));
        }
        self.state = LifecycleState::AwaitingReady;
        let start = Instant::now();

        for member in &mut self.members {
            let remaining = deadline.saturating_sub(start.elapsed());
            if let Err(err) = member.await_ready(remaining).await {
                self.state = LifecycleState::Failed;
                return Err(err);
            }
        }

        // Bootstrap consensus through the first member, then wait for an
        // elected primary.
        let member_spec: Vec<ReplSetMember> = self
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                Ok(ReplSetMember {
                    index,
                    address: member.connection_string()?,
                })
            })
            .collect::<Result<_>>()?;
        let first_address = member_spec[0].address.clone();

        let mut session = self.admin_session(&first_address).await?;
        session
            .replset_initiate(&self.config.set_name, self.config.configsvr, &member_spec)
            .await?;
        debug!(set = %self.config.set_name, "initiated replica set");

        loop {
            if let Some(primary) = session.primary().await? {
                self.primary = Some(primary);
                break;
            }
            if start.elapsed() >= deadline {
                self.state = LifecycleState::Failed;
                return Err(Error::ReadinessTimeout {
                    name: self.config.set_name.clone(),
                    elapsed: start.elapsed(),
                    last_state: LifecycleState::AwaitingReady,
                });
            }
            sleep(READY_POLL_INTERVAL).await;
        }

        self.state = LifecycleState::Ready;
        info!(
            set = %self.config.set_name,
            primary = self.primary.as_deref().unwrap_or("unknown"),
            "replica set ready"
        );
        Ok(())
    }

    fn pids(&mut self) -> Vec<u32> {
        self.members
            .iter_mut()
            .flat_map(NodeFixture::pids)
            .collect()
    }

    fn is_running(&mut self) -> bool {
        !self.members.is_empty() && self.members.iter_mut().all(NodeFixture::is_running)
    }

    async fn teardown(&mut self, mode: TeardownMode) -> TeardownOutcome {
        self.state = LifecycleState::TearingDown;

        let mut failures = Vec::new();
        for member in &mut self.members {
            let outcome = member.teardown(mode).await;
            if !outcome.success {
                failures.push(format!("{}: {}", outcome.name, outcome.message));
            }
        }

        if failures.is_empty() {
            self.state = LifecycleState::Stopped;
            TeardownOutcome::success(&self.config.set_name, "stopped all members")
        } else {
            self.state = LifecycleState::Failed;
            TeardownOutcome::failure(&self.config.set_name, failures.join("; "))
        }
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        self.members
            .iter()
            .flat_map(NodeFixture::node_info)
            .collect()
    }

    fn connection_string(&self) -> Result<String> {
        let addresses: Vec<String> = self
            .members
            .iter()
            .map(NodeFixture::connection_string)
            .collect::<Result<_>>()?;
        Ok(format!("{}/{}", self.config.set_name, addresses.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RecordingDriver;
    use crate::alloc::SequentialPortAllocator;

    fn config(members: usize) -> ReplSetConfig {
        ReplSetConfig {
            set_name: "shard-rs0".to_string(),
            configsvr: false,
            data_dir: PathBuf::from("/tmp/unused"),
            executables: vec![PathBuf::from("/bin/true"); members],
            options: OptionMap::new(),
            auth: None,
        }
    }

    fn fixture(members: usize) -> Result<ReplicaSetFixture> {
        ReplicaSetFixture::new(
            config(members),
            Arc::new(RecordingDriver::new()),
            Arc::new(SequentialPortAllocator::starting_at(21000)),
        )
    }

    #[test]
    fn test_zero_members_rejected() {
        match fixture(0) {
            Err(err) => assert!(matches!(err, Error::Configuration(_))),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn test_reserved_options_rejected() {
        let mut bad = config(1);
        bad.options.set(KEY_REPLSET_NAME, "other");

        let result = ReplicaSetFixture::new(
            bad,
            Arc::new(RecordingDriver::new()),
            Arc::new(SequentialPortAllocator::starting_at(21000)),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_await_ready_requires_setup() {
        let mut set = fixture(3).unwrap();
        let err = set.await_ready(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }

    #[tokio::test]
    async fn test_teardown_before_setup_is_noop_success() {
        let mut set = fixture(3).unwrap();
        let outcome = set.teardown(TeardownMode::Kill).await;

        assert!(outcome.success);
        assert_eq!(outcome.name, "shard-rs0");
    }

    #[test]
    fn test_member_count_follows_executables() {
        let set = fixture(3).unwrap();
        assert_eq!(set.num_members(), 3);
        assert!(set.primary_address().is_none());
    }
}
