//! The coordination-call surface.
//!
//! The orchestrator issues a small, closed set of administrative calls:
//! shard registration, sharding enablement, balancer control, session-cache
//! priming, and replica-set bootstrap. Wire encoding belongs to the driver;
//! the orchestrator only chooses call, target, and order. [`Driver`] is the
//! seam: production runs use [`JsonLineDriver`] (or an embedder-supplied
//! implementation), orchestration tests use [`RecordingDriver`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};

/// Timeout for administrative sessions opened during wiring and bootstrap.
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials for the administrative connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOptions {
    /// User to authenticate as.
    pub username: String,

    /// Password.
    pub password: String,

    /// Authentication database.
    pub database: String,

    /// Authentication mechanism name.
    pub mechanism: String,
}

/// One member in a replica-set bootstrap call.
#[derive(Debug, Clone, Serialize)]
pub struct ReplSetMember {
    /// Member index within the set.
    pub index: usize,

    /// Member address (`host:port`).
    pub address: String,
}

/// Opens administrative sessions against cluster processes.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Connects to `address` within `timeout`.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Session>>;
}

/// An administrative session against one process.
///
/// Calls are synchronous requests against the cluster and are not retried
/// here; callers decide whether a failed wiring pass is rerun from scratch.
#[async_trait]
pub trait Session: Send {
    /// Liveness probe.
    async fn ping(&mut self) -> Result<()>;

    /// Authenticates the session.
    async fn authenticate(&mut self, auth: &AuthOptions) -> Result<()>;

    /// Registers a shard with the router layer.
    async fn add_shard(&mut self, connection_string: &str) -> Result<()>;

    /// Enables sharding on a database.
    async fn enable_sharding(&mut self, database: &str) -> Result<()>;

    /// Starts the balancer, bounded by `max_time_ms`.
    async fn balancer_start(&mut self, max_time_ms: u64) -> Result<()>;

    /// Stops the balancer, bounded by `max_time_ms`.
    async fn balancer_stop(&mut self, max_time_ms: u64) -> Result<()>;

    /// Writes the disabled autosplit setting into cluster metadata with a
    /// majority-acknowledged upsert; idempotent.
    async fn disable_autosplit(&mut self) -> Result<()>;

    /// Refreshes the distributed-session cache on the target.
    async fn refresh_session_cache(&mut self) -> Result<()>;

    /// Starts consensus for a named replica set.
    async fn replset_initiate(
        &mut self,
        set_name: &str,
        configsvr: bool,
        members: &[ReplSetMember],
    ) -> Result<()>;

    /// Address of the set's current primary, if one has been elected.
    async fn primary(&mut self) -> Result<Option<String>>;

    /// Blocks until the set's last committed operation has reached every
    /// member.
    async fn await_last_op_committed(&mut self) -> Result<()>;
}

/// Coordination calls as recorded by [`RecordingDriver`], excluding probes
/// and bootstrap traffic.
pub const COORDINATION_COMMANDS: &[&str] = &[
    "add-shard",
    "enable-sharding",
    "balancer-start",
    "balancer-stop",
    "disable-autosplit",
    "refresh-session-cache",
    "await-last-committed",
];

/// A recorded administrative call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCall {
    /// Address the session was connected to.
    pub target: String,

    /// Call name.
    pub command: String,

    /// Call argument, when the call has one.
    pub argument: Option<String>,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Mutex<Vec<AdminCall>>,
    refuse_ping: Mutex<HashSet<String>>,
}

/// Driver stub that records every call in issue order.
///
/// Every call succeeds; `ping` can be refused per address to keep a fixture
/// from being observed ready. Used by orchestration tests to assert call
/// ordering without real servers.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    state: Arc<RecordingState>,
}

impl RecordingDriver {
    /// Creates an empty recording driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `ping` fail for sessions connected to `address`.
    pub fn refuse_ping(&self, address: impl Into<String>) {
        self.state
            .refuse_ping
            .lock()
            .expect("recording state poisoned")
            .insert(address.into());
    }

    /// Every recorded call, including probes and bootstrap traffic.
    pub fn calls(&self) -> Vec<AdminCall> {
        self.state
            .calls
            .lock()
            .expect("recording state poisoned")
            .clone()
    }

    /// Recorded coordination calls only (see [`COORDINATION_COMMANDS`]).
    pub fn coordination_calls(&self) -> Vec<AdminCall> {
        self.calls()
            .into_iter()
            .filter(|call| COORDINATION_COMMANDS.contains(&call.command.as_str()))
            .collect()
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn Session>> {
        Ok(Box::new(RecordingSession {
            target: address.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct RecordingSession {
    target: String,
    state: Arc<RecordingState>,
}

impl RecordingSession {
    fn record(&self, command: &str, argument: Option<String>) {
        self.state
            .calls
            .lock()
            .expect("recording state poisoned")
            .push(AdminCall {
                target: self.target.clone(),
                command: command.to_string(),
                argument,
            });
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn ping(&mut self) -> Result<()> {
        self.record("ping", None);
        let refused = self
            .state
            .refuse_ping
            .lock()
            .expect("recording state poisoned")
            .contains(&self.target);
        if refused {
            Err(Error::Driver(format!("{} refused ping", self.target)))
        } else {
            Ok(())
        }
    }

    async fn authenticate(&mut self, auth: &AuthOptions) -> Result<()> {
        self.record("authenticate", Some(auth.username.clone()));
        Ok(())
    }

    async fn add_shard(&mut self, connection_string: &str) -> Result<()> {
        self.record("add-shard", Some(connection_string.to_string()));
        Ok(())
    }

    async fn enable_sharding(&mut self, database: &str) -> Result<()> {
        self.record("enable-sharding", Some(database.to_string()));
        Ok(())
    }

    async fn balancer_start(&mut self, max_time_ms: u64) -> Result<()> {
        self.record("balancer-start", Some(max_time_ms.to_string()));
        Ok(())
    }

    async fn balancer_stop(&mut self, max_time_ms: u64) -> Result<()> {
        self.record("balancer-stop", Some(max_time_ms.to_string()));
        Ok(())
    }

    async fn disable_autosplit(&mut self) -> Result<()> {
        self.record("disable-autosplit", None);
        Ok(())
    }

    async fn refresh_session_cache(&mut self) -> Result<()> {
        self.record("refresh-session-cache", None);
        Ok(())
    }

    async fn replset_initiate(
        &mut self,
        set_name: &str,
        _configsvr: bool,
        _members: &[ReplSetMember],
    ) -> Result<()> {
        self.record("replset-initiate", Some(set_name.to_string()));
        Ok(())
    }

    async fn primary(&mut self) -> Result<Option<String>> {
        self.record("replset-primary", None);
        Ok(Some(self.target.clone()))
    }

    async fn await_last_op_committed(&mut self) -> Result<()> {
        self.record("await-last-committed", None);
        Ok(())
    }
}

/// Driver speaking newline-delimited JSON: one request object per line, one
/// response object per line with an `ok` field.
///
/// A convenience default so the CLI can drive cooperating servers; any
/// embedder with a real wire driver supplies its own [`Driver`] instead.
#[derive(Debug, Default)]
pub struct JsonLineDriver;

impl JsonLineDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for JsonLineDriver {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Session>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Driver(format!("timed out connecting to {address}")))?
            .map_err(|err| Error::Driver(format!("failed to connect to {address}: {err}")))?;
        let (read_half, write_half) = stream.into_split();

        Ok(Box::new(JsonLineSession {
            address: address.to_string(),
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }))
    }
}

struct JsonLineSession {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl JsonLineSession {
    async fn command(&mut self, body: Value) -> Result<Value> {
        let mut line = body.to_string();
        line.push('\n');

        tokio::time::timeout(self.timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::Driver(format!("timed out writing to {}", self.address)))?
            .map_err(|err| Error::Driver(format!("write to {} failed: {err}", self.address)))?;

        let mut response = String::new();
        let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut response))
            .await
            .map_err(|_| Error::Driver(format!("timed out reading from {}", self.address)))?
            .map_err(|err| Error::Driver(format!("read from {} failed: {err}", self.address)))?;
        if read == 0 {
            return Err(Error::Driver(format!(
                "{} closed the connection",
                self.address
            )));
        }

        let value: Value = serde_json::from_str(response.trim()).map_err(|err| {
            Error::Driver(format!("invalid response from {}: {err}", self.address))
        })?;

        if value.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(value)
        } else {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("command rejected");
            Err(Error::Driver(format!("{}: {message}", self.address)))
        }
    }
}

#[async_trait]
impl Session for JsonLineSession {
    async fn ping(&mut self) -> Result<()> {
        self.command(json!({"cmd": "ping"})).await.map(|_| ())
    }

    async fn authenticate(&mut self, auth: &AuthOptions) -> Result<()> {
        self.command(json!({
            "cmd": "auth",
            "username": auth.username,
            "password": auth.password,
            "database": auth.database,
            "mechanism": auth.mechanism,
        }))
        .await
        .map(|_| ())
    }

    async fn add_shard(&mut self, connection_string: &str) -> Result<()> {
        self.command(json!({"cmd": "addShard", "connectionString": connection_string}))
            .await
            .map(|_| ())
    }

    async fn enable_sharding(&mut self, database: &str) -> Result<()> {
        self.command(json!({"cmd": "enableSharding", "database": database}))
            .await
            .map(|_| ())
    }

    async fn balancer_start(&mut self, max_time_ms: u64) -> Result<()> {
        self.command(json!({"cmd": "balancerStart", "maxTimeMs": max_time_ms}))
            .await
            .map(|_| ())
    }

    async fn balancer_stop(&mut self, max_time_ms: u64) -> Result<()> {
        self.command(json!({"cmd": "balancerStop", "maxTimeMs": max_time_ms}))
            .await
            .map(|_| ())
    }

    async fn disable_autosplit(&mut self) -> Result<()> {
        self.command(json!({
            "cmd": "updateSetting",
            "id": "autosplit",
            "enabled": false,
            "writeConcern": "majority",
        }))
        .await
        .map(|_| ())
    }

    async fn refresh_session_cache(&mut self) -> Result<()> {
        self.command(json!({"cmd": "refreshSessionCache"}))
            .await
            .map(|_| ())
    }

    async fn replset_initiate(
        &mut self,
        set_name: &str,
        configsvr: bool,
        members: &[ReplSetMember],
    ) -> Result<()> {
        self.command(json!({
            "cmd": "replSetInitiate",
            "set": set_name,
            "configsvr": configsvr,
            "members": members,
        }))
        .await
        .map(|_| ())
    }

    async fn primary(&mut self) -> Result<Option<String>> {
        let response = self.command(json!({"cmd": "replSetPrimary"})).await?;
        Ok(response
            .get("primary")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn await_last_op_committed(&mut self) -> Result<()> {
        self.command(json!({"cmd": "awaitLastOpCommitted"}))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_driver_preserves_order() {
        let driver = RecordingDriver::new();

        let mut session = driver.connect("localhost:20000", Duration::from_secs(1)).await.unwrap();
        session.balancer_stop(60_000).await.unwrap();
        session.add_shard("shard-rs0/localhost:20001").await.unwrap();
        session.enable_sharding("testdb").await.unwrap();

        let calls = driver.coordination_calls();
        let commands: Vec<_> = calls.iter().map(|call| call.command.as_str()).collect();
        assert_eq!(commands, vec!["balancer-stop", "add-shard", "enable-sharding"]);
        assert_eq!(calls[1].argument.as_deref(), Some("shard-rs0/localhost:20001"));
    }

    #[tokio::test]
    async fn test_recording_driver_refuses_ping() {
        let driver = RecordingDriver::new();
        driver.refuse_ping("localhost:20002");

        let mut refused = driver.connect("localhost:20002", Duration::from_secs(1)).await.unwrap();
        assert!(refused.ping().await.is_err());

        let mut open = driver.connect("localhost:20003", Duration::from_secs(1)).await.unwrap();
        assert!(open.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_primary_is_connected_target() {
        let driver = RecordingDriver::new();
        let mut session = driver.connect("localhost:20000", Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            session.primary().await.unwrap().as_deref(),
            Some("localhost:20000")
        );
    }

    #[tokio::test]
    async fn test_json_line_driver_rejects_closed_port() {
        let driver = JsonLineDriver::new();
        // Reserve a port and drop the listener so nothing is accepting.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = driver
            .connect(&format!("127.0.0.1:{port}"), Duration::from_millis(250))
            .await;
        assert!(result.is_err());
    }
}
