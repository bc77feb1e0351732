//! The fixture lifecycle protocol.
//!
//! Every process wrapper in a cluster topology, whether a standalone node,
//! a replica set, or a router, satisfies the same contract: set up once, await
//! readiness under a deadline, report owned pids, and tear down under a
//! caller-chosen mode without raising. Teardown outcomes are aggregated by
//! [`TeardownHandler`] so one failure can never leave sibling processes
//! running.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::Serialize;

use crate::error::{Error, Result};

/// Interval between readiness probes.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default deadline for [`Fixture::await_ready`].
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a fixture.
///
/// `Failed` is absorbing and reachable from any non-terminal state. No
/// fixture may be asked to serve traffic before reaching `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, no resources allocated.
    NotStarted,

    /// Allocating resources and spawning processes.
    SettingUp,

    /// Processes started, readiness not yet confirmed.
    AwaitingReady,

    /// Serving and confirmed live.
    Ready,

    /// Teardown in progress.
    TearingDown,

    /// All owned processes stopped.
    Stopped,

    /// A process crashed or an operation failed.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotStarted => "not-started",
            Self::SettingUp => "setting-up",
            Self::AwaitingReady => "awaiting-ready",
            Self::Ready => "ready",
            Self::TearingDown => "tearing-down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// How teardown stops the underlying processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Ordinary stop signal; cluster-level coordination (balancer shutdown)
    /// runs first.
    Graceful,

    /// Immediate forceful termination; skips coordination calls that would
    /// touch on-disk state.
    Kill,

    /// Signal intended to produce a diagnostic core dump; also skips
    /// coordination calls.
    Abort,
}

impl TeardownMode {
    /// The Unix signal delivered to child processes under this mode.
    pub fn signal(self) -> Signal {
        match self {
            Self::Graceful => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Abort => Signal::SIGABRT,
        }
    }

    /// Whether cluster-level coordination calls run before processes are
    /// signalled.
    pub fn runs_coordination(self) -> bool {
        matches!(self, Self::Graceful)
    }
}

impl fmt::Display for TeardownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Graceful => "graceful",
            Self::Kill => "kill",
            Self::Abort => "abort",
        };
        f.write_str(text)
    }
}

/// Per-fixture teardown record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownOutcome {
    /// Fixture identifier.
    pub name: String,

    /// Whether the fixture stopped cleanly.
    pub success: bool,

    /// Diagnostic message.
    pub message: String,
}

impl TeardownOutcome {
    /// A successful outcome.
    pub fn success(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            message: message.into(),
        }
    }

    /// A failed outcome.
    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            message: message.into(),
        }
    }
}

/// Read-only snapshot of one running process, published once its fixture is
/// ready. Consumed by test runners for diagnostics, never mutated by the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Process name, derived from its fixture.
    pub name: String,

    /// Listening port.
    pub port: u16,

    /// Operating-system process id.
    pub pid: u32,
}

/// Uniform lifecycle contract for every sub-fixture in a topology.
#[async_trait]
pub trait Fixture: Send {
    /// Fixture identifier, used in logs and teardown outcomes.
    fn name(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> LifecycleState;

    /// Allocates resources (ports, data directories) and starts the
    /// underlying processes. Calling after the fixture reached `Ready` or
    /// later is a programming error.
    async fn setup(&mut self) -> Result<()>;

    /// Blocks until the fixture is confirmed serving or `deadline` elapses.
    ///
    /// Polls at [`READY_POLL_INTERVAL`] and checks the process exit status
    /// each iteration so a crashed process fails immediately instead of
    /// waiting out the deadline.
    async fn await_ready(&mut self, deadline: Duration) -> Result<()>;

    /// All process ids currently owned. Never blocks; empty if nothing is
    /// running.
    fn pids(&mut self) -> Vec<u32>;

    /// True iff every owned process is still alive.
    fn is_running(&mut self) -> bool;

    /// Stops all owned processes under `mode` and waits for exit.
    ///
    /// Safe to call on a fixture that was never set up (no-op success).
    /// Failure is reported in the outcome, never raised, so callers can
    /// aggregate.
    async fn teardown(&mut self, mode: TeardownMode) -> TeardownOutcome;

    /// Node info snapshots for every running process.
    fn node_info(&self) -> Vec<NodeInfo>;

    /// Address other processes use to reach this fixture.
    ///
    /// Errors if called before `setup()` resolved a port.
    fn connection_string(&self) -> Result<String>;
}

/// Aggregates per-fixture teardown outcomes across a topology without
/// short-circuiting on first failure.
#[derive(Debug, Default)]
pub struct TeardownHandler {
    outcomes: Vec<TeardownOutcome>,
}

impl TeardownHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tears down `fixture` and records the outcome.
    pub async fn teardown<F: Fixture + ?Sized>(&mut self, fixture: &mut F, mode: TeardownMode) {
        let outcome = fixture.teardown(mode).await;
        if outcome.success {
            tracing::debug!(fixture = %outcome.name, "teardown succeeded");
        } else {
            tracing::error!(fixture = %outcome.name, "teardown failed: {}", outcome.message);
        }
        self.outcomes.push(outcome);
    }

    /// True iff every recorded outcome succeeded.
    pub fn was_successful(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.success)
    }

    /// Recorded outcomes, in teardown order.
    pub fn outcomes(&self) -> &[TeardownOutcome] {
        &self.outcomes
    }

    /// Consumes the handler: `Ok` when all outcomes succeeded, otherwise an
    /// aggregate error carrying every recorded outcome.
    pub fn into_result(self) -> Result<()> {
        if self.was_successful() {
            Ok(())
        } else {
            Err(Error::ClusterTeardown(self.outcomes))
        }
    }
}
