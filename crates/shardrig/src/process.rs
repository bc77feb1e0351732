//! Child-process management for fixtures.
//!
//! Each [`ServerProcess`] is owned by exactly one fixture; processes and
//! data directories are never shared. Stop signals are chosen by the
//! teardown mode, and an exit caused by the very signal we delivered counts
//! as a clean stop.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fixture::TeardownMode;

/// A spawned server process.
#[derive(Debug)]
pub struct ServerProcess {
    command_line: String,
    child: Child,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl ServerProcess {
    /// Spawns `executable` with `args`.
    ///
    /// Fails with [`Error::Startup`] carrying the attempted command line if
    /// the process cannot be spawned.
    pub fn spawn(executable: &Path, args: &[String]) -> Result<Self> {
        let command_line = format!("{} {}", executable.display(), args.join(" "));

        let child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| Error::Startup {
                command: command_line.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| Error::Startup {
            command: command_line.clone(),
            source: std::io::Error::other("process exited before its pid could be read"),
        })?;

        debug!(pid, command = %command_line, "spawned process");

        Ok(Self {
            command_line,
            child,
            pid,
            exit_status: None,
        })
    }

    /// Operating-system process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command line used to spawn the process.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Returns the exit status if the process has terminated, without
    /// blocking.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(pid = self.pid, "failed to poll process status: {err}");
                None
            }
        }
    }

    /// True while the process has not terminated.
    pub fn is_alive(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Delivers the stop signal for `mode`. No-op if the process already
    /// exited.
    pub fn stop(&mut self, mode: TeardownMode) -> Result<()> {
        if self.poll().is_some() {
            return Ok(());
        }
        debug!(pid = self.pid, signal = %mode, "signalling process");
        signal::kill(Pid::from_raw(self.pid as i32), mode.signal())
            .map_err(|errno| Error::Io(errno.into()))?;
        Ok(())
    }

    /// Waits for the process to exit and returns its status.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// True when `status` is consistent with a stop under `mode`: a clean
    /// exit, or death by the very signal that mode delivers.
    pub fn exit_matches_mode(status: ExitStatus, mode: TeardownMode) -> bool {
        status.success() || status.signal() == Some(mode.signal() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script_args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_spawn_and_poll_running() {
        let mut process = ServerProcess::spawn(&shell(), &script_args("sleep 30")).unwrap();

        assert!(process.is_alive());
        assert_ne!(process.pid(), 0);

        process.stop(TeardownMode::Kill).unwrap();
        let status = process.wait().await.unwrap();
        assert!(ServerProcess::exit_matches_mode(status, TeardownMode::Kill));
    }

    #[tokio::test]
    async fn test_spawn_failure_carries_command_line() {
        let missing = PathBuf::from("/nonexistent/server-binary");
        let err = ServerProcess::spawn(&missing, &[]).unwrap_err();

        match err {
            Error::Startup { command, .. } => {
                assert!(command.contains("/nonexistent/server-binary"));
            }
            other => panic!("expected Startup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_graceful_stop_matches_mode() {
        let mut process = ServerProcess::spawn(&shell(), &script_args("sleep 30")).unwrap();

        process.stop(TeardownMode::Graceful).unwrap();
        let status = process.wait().await.unwrap();
        assert!(ServerProcess::exit_matches_mode(
            status,
            TeardownMode::Graceful
        ));
        assert!(!ServerProcess::exit_matches_mode(
            status,
            TeardownMode::Abort
        ));
    }

    #[tokio::test]
    async fn test_exited_process_reports_status() {
        let mut process = ServerProcess::spawn(&shell(), &script_args("exit 3")).unwrap();

        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(!process.is_alive());
        assert!(!ServerProcess::exit_matches_mode(
            status,
            TeardownMode::Graceful
        ));

        // Stopping an already-exited process is a no-op.
        process.stop(TeardownMode::Graceful).unwrap();
    }
}
