//! Top-level client owning the whole subsystem lifecycle.
//!
//! [`McpClient`] ties the pieces together: it loads the registry, spins up
//! the [`Runner`], connects sessions through the [`SessionManager`], and
//! exposes the discovered tools as [`BridgedTool`] callables. Both
//! `initialize` and `cleanup` are idempotent, and `cleanup` also runs on
//! drop so a forgotten client cannot leak server subprocesses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge::{build_callables, BridgedTool};
use crate::error::McpError;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::session::{SessionConfig, SessionManager};

/// Lifecycle state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created but not yet initialized.
    Idle,
    /// Sessions are (possibly) live and tools are available.
    Running,
    /// Cleaned up; a fresh `initialize` starts over.
    CleanedUp,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the JSON server registry.
    pub config_path: PathBuf,
    /// Handshake identity and per-request timeout for sessions.
    pub session: SessionConfig,
    /// Per-server allowance for spawning and connecting, added on top of
    /// the session request deadlines when bounding startup.
    pub connect_timeout: Duration,
    /// Bound on disconnecting all sessions during cleanup.
    pub cleanup_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("mcp_config.json"),
            session: SessionConfig::default(),
            connect_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Outer bound for one tool call: the session request timeout plus a
    /// grace second, so remote timeouts surface as session envelopes
    /// rather than runner timeouts.
    fn call_bound(&self) -> Duration {
        Duration::from_millis(self.session.request_timeout_ms) + Duration::from_secs(1)
    }

    /// Outer bound for startup. Each server may spend the connect timeout
    /// plus up to two request deadlines (handshake, then tool discovery)
    /// before its session times out internally and is skipped, so the
    /// outer bound must strictly exceed that. A hung server then costs
    /// time but never turns a fail-soft startup into an error.
    fn startup_bound(&self, servers: usize) -> Duration {
        let per_server = self.connect_timeout
            + Duration::from_millis(self.session.request_timeout_ms).saturating_mul(2)
            + Duration::from_secs(1);
        per_server.saturating_mul(servers.max(1) as u32)
    }
}

/// Synchronous facade over the MCP subsystem.
pub struct McpClient {
    config: ClientConfig,
    state: ClientState,
    runner: Option<Arc<Runner>>,
    manager: Option<Arc<Mutex<SessionManager>>>,
    tools: Vec<BridgedTool>,
}

impl McpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ClientState::Idle,
            runner: None,
            manager: None,
            tools: Vec::new(),
        }
    }

    /// Convenience constructor with defaults for everything but the
    /// registry path.
    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self::new(ClientConfig {
            config_path: path.into(),
            ..Default::default()
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Tools discovered at initialization, empty before then.
    pub fn tools(&self) -> &[BridgedTool] {
        &self.tools
    }

    /// Look up a bridged tool by its composite `mcp_<server>_<tool>`
    /// name.
    pub fn find_tool(&self, name: &str) -> Option<&BridgedTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// Load the registry, connect to every server, and build the tool
    /// set.
    ///
    /// Idempotent: calling again while running returns the already
    /// discovered tools. After `cleanup`, calling again starts over from
    /// scratch. Server-level failures are fail-soft; only subsystem-level
    /// failures (the runner thread not coming up) are errors.
    pub fn initialize(&mut self) -> Result<Vec<BridgedTool>, McpError> {
        if self.state == ClientState::Running {
            return Ok(self.tools.clone());
        }

        let registry = Registry::load(&self.config.config_path);
        if registry.is_empty() {
            info!("no MCP servers configured");
            self.state = ClientState::Running;
            return Ok(Vec::new());
        }

        let runner = Arc::new(Runner::new()?);
        let manager = Arc::new(Mutex::new(SessionManager::new(self.config.session.clone())));

        let startup_bound = self.config.startup_bound(registry.len());

        let startup_manager = Arc::clone(&manager);
        let (started, tools) = runner.block_on(
            async move {
                let mut guard = startup_manager.lock().await;
                let started = guard.start_all(&registry).await;
                let tools = guard.collect_tools().await;
                (started, tools)
            },
            startup_bound,
        )?;

        info!(
            servers = started.len(),
            tools = tools.len(),
            "MCP subsystem initialized"
        );

        self.tools = build_callables(
            tools,
            Arc::clone(&manager),
            Arc::clone(&runner),
            self.config.call_bound(),
        );
        self.runner = Some(runner);
        self.manager = Some(manager);
        self.state = ClientState::Running;

        Ok(self.tools.clone())
    }

    /// Disconnect every session and stop the runner.
    ///
    /// Idempotent and infallible: teardown problems are logged, never
    /// surfaced.
    pub fn cleanup(&mut self) {
        if self.state != ClientState::Running {
            self.state = ClientState::CleanedUp;
            return;
        }

        self.tools.clear();

        if let (Some(runner), Some(manager)) = (self.runner.take(), self.manager.take()) {
            let shutdown_manager = Arc::clone(&manager);
            let result = runner.block_on(
                async move {
                    let mut guard = shutdown_manager.lock().await;
                    guard.stop_all().await;
                },
                self.config.cleanup_timeout,
            );
            if let Err(e) = result {
                warn!(error = %e, "MCP session teardown did not finish cleanly");
            }
            runner.shutdown();
        }

        self.state = ClientState::CleanedUp;
        info!("MCP subsystem cleaned up");
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_initialize_without_config_file() {
        let mut client = McpClient::with_config_path("/nonexistent/mcp.json");
        assert_eq!(client.state(), ClientState::Idle);

        let tools = client.initialize().unwrap();
        assert!(tools.is_empty());
        assert_eq!(client.state(), ClientState::Running);
    }

    #[test]
    fn test_double_initialize_is_idempotent() {
        let mut client = McpClient::with_config_path("/nonexistent/mcp.json");
        client.initialize().unwrap();
        let tools = client.initialize().unwrap();
        assert!(tools.is_empty());
        assert_eq!(client.state(), ClientState::Running);
    }

    #[test]
    fn test_cleanup_before_initialize_is_noop() {
        let mut client = McpClient::with_config_path("/nonexistent/mcp.json");
        client.cleanup();
        client.cleanup();
        assert_eq!(client.state(), ClientState::CleanedUp);
    }

    #[test]
    fn test_unreachable_server_is_fail_soft() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"mcpServers": {"broken": {"command": "nonexistent_command_12345"}}}"#,
        )
        .unwrap();

        let mut client = McpClient::with_config_path(file.path());
        let tools = client.initialize().unwrap();
        assert!(tools.is_empty());
        assert_eq!(client.state(), ClientState::Running);

        client.cleanup();
        assert_eq!(client.state(), ClientState::CleanedUp);
        assert!(client.tools().is_empty());
    }

    #[test]
    fn test_hung_server_is_fail_soft() {
        // `sleep` spawns fine but never answers the handshake, so the
        // session's own request timeout must fail it and startup must
        // carry on without it.
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"mcpServers": {"mute": {"command": "sleep", "args": ["30"]}}}"#)
            .unwrap();

        let config = ClientConfig {
            config_path: file.path().to_path_buf(),
            session: SessionConfig {
                request_timeout_ms: 200,
                ..Default::default()
            },
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let mut client = McpClient::new(config);
        let tools = client.initialize().unwrap();
        assert!(tools.is_empty());
        assert_eq!(client.state(), ClientState::Running);
        // Well under the startup bound: the handshake timeout fired, not
        // the runner's.
        assert!(started.elapsed() < Duration::from_secs(10));

        client.cleanup();
        assert_eq!(client.state(), ClientState::CleanedUp);
    }

    #[test]
    fn test_reinitialize_after_cleanup() {
        let mut client = McpClient::with_config_path("/nonexistent/mcp.json");
        client.initialize().unwrap();
        client.cleanup();
        assert_eq!(client.state(), ClientState::CleanedUp);

        client.initialize().unwrap();
        assert_eq!(client.state(), ClientState::Running);
    }
}
