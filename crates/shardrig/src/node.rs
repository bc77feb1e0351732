//! Standalone server-process fixture.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::admin::Driver;
use crate::alloc::PortAllocator;
use crate::error::{Error, Result};
use crate::fixture::{
    Fixture, LifecycleState, NodeInfo, READY_POLL_INTERVAL, TeardownMode, TeardownOutcome,
};
use crate::options::{KEY_DATA_DIR, KEY_PORT, OptionMap};
use crate::process::ServerProcess;

/// Connection timeout for each readiness probe, kept short so polling
/// tracks the requested deadline closely.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for a single server-process fixture.
///
/// `options` is the fully composed map: caller passthrough plus whatever
/// keys the orchestrator injected (cluster role, replica-set name). The
/// data directory and port are injected at `setup()`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Fixture name, used in logs and diagnostics.
    pub name: String,

    /// Server executable to spawn.
    pub executable: PathBuf,

    /// Data directory for this node.
    pub data_dir: PathBuf,

    /// Process options.
    pub options: OptionMap,
}

/// Fixture wrapping one standalone server process.
pub struct NodeFixture {
    config: NodeConfig,
    driver: Arc<dyn Driver>,
    allocator: Arc<dyn PortAllocator>,
    port: Option<u16>,
    process: Option<ServerProcess>,
    state: LifecycleState,
}

impl NodeFixture {
    /// Creates a fixture that has not yet allocated any resources.
    pub fn new(config: NodeConfig, driver: Arc<dyn Driver>, allocator: Arc<dyn PortAllocator>) -> Self {
        Self {
            config,
            driver,
            allocator,
            port: None,
            process: None,
            state: LifecycleState::NotStarted,
        }
    }

    /// The port this node listens on, once resolved by `setup()`.
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

#[async_trait]
impl Fixture for NodeFixture {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> LifecycleState {
        self.state
    }

    async fn setup(&mut self) -> Result<()> {
        if self.state != LifecycleState::NotStarted {
            return Err(Error::Lifecycle(format!(
                "setup() called on {} in state {}",
                self.config.name, self.state
            )));
        }
        self.state = LifecycleState::SettingUp;

        let port = match self.config.options.port() {
            Some(port) => port,
            None => self.allocator.next_port()?,
        };
        self.port = Some(port);

        std::fs::create_dir_all(&self.config.data_dir)?;

        let mut options = self.config.options.clone();
        options.set(KEY_PORT, port);
        options.set(KEY_DATA_DIR, self.config.data_dir.display().to_string());

        match ServerProcess::spawn(&self.config.executable, &options.to_args()) {
            Ok(process) => {
                info!(
                    name = %self.config.name,
                    port,
                    pid = process.pid(),
                    "started server process"
                );
                self.process = Some(process);
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Failed;
                Err(err)
            }
        }
    }

    async fn await_ready(&mut self, deadline: Duration) -> Result<()> {
        if self.state == LifecycleState::Ready {
            return Ok(());
        }
        if self.process.is_none() {
            return Err(Error::Lifecycle(format!(
                "await_ready() called on {} before setup()",
                self.config.name
            )));
        }
        let port = self.port.ok_or_else(|| {
            Error::Lifecycle(format!("{} has no port assigned", self.config.name))
        })?;

        self.state = LifecycleState::AwaitingReady;
        let address = format!("localhost:{port}");
        let start = Instant::now();

        loop {
            // A crashed process fails immediately; never wait out the deadline.
            if let Some(status) = self.process.as_mut().and_then(ServerProcess::poll) {
                self.state = LifecycleState::Failed;
                return Err(Error::ProcessExited {
                    name: self.config.name.clone(),
                    code: status.code(),
                });
            }

            match self.driver.connect(&address, PROBE_TIMEOUT).await {
                Ok(mut session) => {
                    if session.ping().await.is_ok() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(name = %self.config.name, "probe failed: {err}");
                }
            }

            if start.elapsed() >= deadline {
                self.state = LifecycleState::Failed;
                return Err(Error::ReadinessTimeout {
                    name: self.config.name.clone(),
                    elapsed: start.elapsed(),
                    last_state: LifecycleState::AwaitingReady,
                });
            }
            sleep(READY_POLL_INTERVAL).await;
        }

        self.state = LifecycleState::Ready;
        info!(name = %self.config.name, %address, "server ready");
        Ok(())
    }

    fn pids(&mut self) -> Vec<u32> {
        if let Some(process) = self.process.as_mut() {
            if process.is_alive() {
                return vec![process.pid()];
            }
        }
        Vec::new()
    }

    fn is_running(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|process| process.is_alive())
    }

    async fn teardown(&mut self, mode: TeardownMode) -> TeardownOutcome {
        let Some(process) = self.process.as_mut() else {
            return TeardownOutcome::success(&self.config.name, "never started");
        };
        self.state = LifecycleState::TearingDown;

        if let Some(status) = process.poll() {
            self.state = LifecycleState::Stopped;
            return TeardownOutcome::failure(
                &self.config.name,
                format!("expected to be running, but had exited with {status}"),
            );
        }

        if let Err(err) = process.stop(mode) {
            self.state = LifecycleState::Failed;
            return TeardownOutcome::failure(
                &self.config.name,
                format!("failed to signal process: {err}"),
            );
        }

        match process.wait().await {
            Ok(status) => {
                self.state = LifecycleState::Stopped;
                if ServerProcess::exit_matches_mode(status, mode) {
                    TeardownOutcome::success(&self.config.name, "stopped")
                } else {
                    TeardownOutcome::failure(
                        &self.config.name,
                        format!("exited with {status}"),
                    )
                }
            }
            Err(err) => {
                self.state = LifecycleState::Failed;
                TeardownOutcome::failure(
                    &self.config.name,
                    format!("failed to reap process: {err}"),
                )
            }
        }
    }

    fn node_info(&self) -> Vec<NodeInfo> {
        match (&self.process, self.port) {
            (Some(process), Some(port)) => vec![NodeInfo {
                name: self.config.name.clone(),
                port,
                pid: process.pid(),
            }],
            _ => Vec::new(),
        }
    }

    fn connection_string(&self) -> Result<String> {
        let port = self.port.ok_or_else(|| {
            Error::Lifecycle(format!(
                "connection_string() called on {} before setup()",
                self.config.name
            ))
        })?;
        Ok(format!("localhost:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RecordingDriver;
    use crate::alloc::SequentialPortAllocator;

    fn unstarted_node() -> NodeFixture {
        NodeFixture::new(
            NodeConfig {
                name: "node0".to_string(),
                executable: PathBuf::from("/bin/true"),
                data_dir: PathBuf::from("/tmp/unused"),
                options: OptionMap::new(),
            },
            Arc::new(RecordingDriver::new()),
            Arc::new(SequentialPortAllocator::starting_at(20000)),
        )
    }

    #[test]
    fn test_connection_string_requires_setup() {
        let node = unstarted_node();
        assert!(matches!(
            node.connection_string(),
            Err(Error::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_teardown_before_setup_is_noop_success() {
        let mut node = unstarted_node();
        let outcome = node.teardown(TeardownMode::Graceful).await;

        assert!(outcome.success);
        assert_eq!(outcome.name, "node0");
        assert!(node.pids().is_empty());
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_await_ready_before_setup_is_lifecycle_error() {
        let mut node = unstarted_node();
        let err = node.await_ready(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }
}
