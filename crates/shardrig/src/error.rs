//! Error types for fixture orchestration.

use std::time::Duration;

use thiserror::Error;

use crate::fixture::{LifecycleState, TeardownOutcome};

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while standing up, wiring, or tearing down a cluster.
///
/// Construction-time and wiring-time errors propagate immediately and abort
/// the calling operation. Teardown never short-circuits: per-fixture failures
/// are collected and surfaced once as [`Error::ClusterTeardown`] after every
/// fixture has been asked to stop.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid topology parameters, detected before any process starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A process could not be spawned.
    #[error("failed to start `{command}`: {source}")]
    Startup {
        /// The attempted command line, for diagnosis.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A process died before becoming ready.
    #[error("{name} exited before becoming ready (exit code {code:?})")]
    ProcessExited {
        /// Fixture that owned the process.
        name: String,
        /// Exit code, if the process exited rather than died from a signal.
        code: Option<i32>,
    },

    /// Deadline exceeded while polling for readiness.
    #[error("{name} was not ready after {elapsed:?} (last state: {last_state})")]
    ReadinessTimeout {
        /// Fixture that failed to become ready.
        name: String,
        /// Time spent polling.
        elapsed: Duration,
        /// Lifecycle state last observed.
        last_state: LifecycleState,
    },

    /// One or more per-fixture teardowns failed.
    ///
    /// Carries every recorded outcome; the display form names only the
    /// failing fixtures.
    #[error("cluster teardown failed: {}", failure_summary(.0))]
    ClusterTeardown(Vec<TeardownOutcome>),

    /// A coordination call against the cluster failed.
    #[error("coordination call failed: {0}")]
    Driver(String),

    /// A lifecycle operation was invoked in the wrong state.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn failure_summary(outcomes: &[TeardownOutcome]) -> String {
    outcomes
        .iter()
        .filter(|outcome| !outcome.success)
        .map(|outcome| format!("{}: {}", outcome.name, outcome.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_error_names_only_failures() {
        let err = Error::ClusterTeardown(vec![
            TeardownOutcome::success("router0", "stopped"),
            TeardownOutcome::failure("shard1", "exited with code 7"),
        ]);

        let text = err.to_string();
        assert!(text.contains("shard1: exited with code 7"));
        assert!(!text.contains("router0"));
    }
}
