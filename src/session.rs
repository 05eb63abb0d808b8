//! Per-server MCP sessions and the session manager.
//!
//! A [`Session`] owns one transport connection to one server: it performs
//! the initialize handshake, discovers tools, and correlates concurrent
//! requests with responses via a pending-request map keyed by request id.
//! Background tasks drive the transport streams; `call_tool` and friends
//! just park on a oneshot channel with a timeout.
//!
//! The [`SessionManager`] holds every live session keyed by server name.
//! It is the error boundary of the subsystem: whatever goes wrong below it
//! (disconnected server, remote tool failure, malformed response, timeout)
//! comes back from [`SessionManager::call_tool`] as a [`ToolOutcome`]
//! failure envelope, never as an `Err`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::McpError;
use crate::registry::Registry;
use crate::transport::{McpTransport, TransportFactory, TransportStreams};
use crate::types::{
    methods, CallToolResult, McpMessage, McpNotification, McpRequest, McpResponse, RemoteTool,
    ResponsePayload, ServerCapabilities, ToolOutcome, ToolSpec, PROTOCOL_VERSION,
};

/// Configuration shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Client name advertised during the handshake.
    pub client_name: String,
    /// Client version advertised during the handshake.
    pub client_version: String,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "mcp-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Negotiated state for one connection.
#[derive(Debug, Default)]
struct SessionState {
    /// Local identifier for correlating log lines, not the wire-level
    /// session id HTTP servers assign.
    session_id: String,
    server_capabilities: Option<ServerCapabilities>,
    server_name: Option<String>,
    server_version: Option<String>,
    /// Discovered tools keyed by name; re-discovery replaces the map.
    tools: HashMap<String, ToolSpec>,
    is_active: bool,
}

/// Pending request parked on its response channel.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<McpResponse, McpError>>,
}

/// One client session over one transport connection.
pub struct Session {
    server: String,
    config: SessionConfig,
    transport: Box<dyn McpTransport>,
    state: Arc<RwLock<SessionState>>,
    request_id_counter: AtomicI64,
    pending_requests: Arc<Mutex<HashMap<Value, PendingRequest>>>,
    is_connected: Arc<AtomicBool>,
    background_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::UnboundedSender<()>>>>,
    write_tx: Arc<Mutex<Option<mpsc::UnboundedSender<McpMessage>>>>,
}

impl Session {
    pub fn new(
        server: impl Into<String>,
        config: SessionConfig,
        transport: Box<dyn McpTransport>,
    ) -> Self {
        Self {
            server: server.into(),
            config,
            transport,
            state: Arc::new(RwLock::new(SessionState {
                session_id: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            })),
            request_id_counter: AtomicI64::new(1),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            is_connected: Arc::new(AtomicBool::new(false)),
            background_handle: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(Mutex::new(None)),
            write_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Server name this session is bound to.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    /// Connect, perform the initialize handshake, and discover tools.
    pub async fn start(&mut self) -> Result<(), McpError> {
        if self.is_connected() {
            return Err(McpError::session("Session already active"));
        }

        {
            let state = self.state.read().await;
            info!(server = %self.server, session = %state.session_id, "connecting to MCP server");
        }

        let streams = self.transport.connect().await?;
        self.start_message_handler(streams).await;
        self.is_connected.store(true, Ordering::Relaxed);

        match self.initialize_session().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Handshake failed; tear down so the transport does not
                // leak a half-open connection or child process.
                let _ = self.stop().await;
                Err(e)
            }
        }
    }

    /// Disconnect and release the transport. Safe to call when already
    /// stopped.
    pub async fn stop(&mut self) -> Result<(), McpError> {
        if !self.is_connected() && self.background_handle.lock().await.is_none() {
            return Ok(());
        }

        info!(server = %self.server, "disconnecting from MCP server");

        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.background_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        self.write_tx.lock().await.take();

        self.transport.disconnect().await?;

        let mut state = self.state.write().await;
        state.is_active = false;
        self.is_connected.store(false, Ordering::Relaxed);

        Ok(())
    }

    /// Tools discovered from this server, as last listed.
    pub async fn tools(&self) -> Vec<ToolSpec> {
        let state = self.state.read().await;
        state.tools.values().cloned().collect()
    }

    /// Re-run `tools/list` and replace the discovered tool set.
    pub async fn discover_tools(&mut self) -> Result<Vec<ToolSpec>, McpError> {
        let response = self.send_request(methods::LIST_TOOLS, None).await?;

        let result = match response.payload {
            ResponsePayload::Success { result } => result,
            ResponsePayload::Error { error } => {
                return Err(McpError::protocol(format!(
                    "tools/list failed: {}",
                    error.message
                )))
            }
        };

        let tools: Vec<ToolSpec> = match result.get("tools") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                McpError::serialization(format!("Failed to parse tool list: {}", e))
            })?,
            None => Vec::new(),
        };

        let mut state = self.state.write().await;
        state.tools.clear();
        for tool in &tools {
            debug!(server = %self.server, tool = %tool.name, "discovered tool");
            state.tools.insert(tool.name.clone(), tool.clone());
        }
        info!(server = %self.server, count = state.tools.len(), "tool discovery complete");

        Ok(tools)
    }

    /// Execute a tool on this server.
    ///
    /// The tool must be in the discovered set. Returns the raw call result
    /// including the `isError` flag; folding into the outcome envelope is
    /// the manager's job.
    pub async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, McpError> {
        {
            let state = self.state.read().await;
            if !state.is_active {
                return Err(McpError::session("Session not initialized"));
            }
            if !state.tools.contains_key(tool_name) {
                return Err(McpError::protocol(format!("Tool not found: {}", tool_name)));
            }
        }

        let params = json!({
            "name": tool_name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });

        let response = self.send_request(methods::CALL_TOOL, Some(params)).await?;

        match response.payload {
            ResponsePayload::Success { result } => {
                serde_json::from_value(result).map_err(|e| {
                    McpError::serialization(format!("Failed to parse tool result: {}", e))
                })
            }
            ResponsePayload::Error { error } => Err(McpError::tool_execution(
                tool_name,
                format!("{} (code {})", error.message, error.code),
            )),
        }
    }

    async fn start_message_handler(&mut self, streams: TransportStreams) {
        let TransportStreams {
            mut read_stream,
            write_stream,
        } = streams;

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        self.shutdown_tx.lock().await.replace(shutdown_tx);

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<McpMessage>();
        self.write_tx.lock().await.replace(write_tx);

        let write_handle = tokio::spawn(async move {
            let mut sink = write_stream;
            while let Some(msg) = write_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!("Failed to send message: {}", e);
                    break;
                }
            }
        });

        let pending_requests = self.pending_requests.clone();
        let is_connected = self.is_connected.clone();
        let server = self.server.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read_stream.next() => {
                        match msg {
                            Some(Ok(message)) => {
                                Self::handle_message(&server, message, &pending_requests).await;
                            }
                            Some(Err(e)) => {
                                error!(server = %server, "error reading message: {}", e);
                                break;
                            }
                            None => {
                                warn!(server = %server, "message stream ended");
                                break;
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        debug!(server = %server, "received shutdown signal");
                        break;
                    }
                }
            }

            is_connected.store(false, Ordering::Relaxed);
            write_handle.abort();

            // Fail every in-flight request so callers unblock promptly.
            let mut requests = pending_requests.lock().await;
            for (_, pending) in requests.drain() {
                let _ = pending
                    .response_tx
                    .send(Err(McpError::connection_lost("Connection closed")));
            }
        });

        self.background_handle.lock().await.replace(handle);
    }

    async fn handle_message(
        server: &str,
        message: McpMessage,
        pending_requests: &Arc<Mutex<HashMap<Value, PendingRequest>>>,
    ) {
        match message {
            McpMessage::Response(response) => {
                let id = response.id.clone();
                let mut requests = pending_requests.lock().await;
                if let Some(pending) = requests.remove(&id) {
                    let _ = pending.response_tx.send(Ok(response));
                } else {
                    warn!(server = %server, "received response for unknown request ID: {:?}", id);
                }
            }
            McpMessage::Request(request) => {
                // Servers don't send requests to clients in this protocol
                // revision.
                warn!(server = %server, "received unexpected request from server: {}", request.method);
            }
            McpMessage::Notification(notification) => {
                debug!(server = %server, "received notification: {}", notification.method);
            }
        }
    }

    async fn initialize_session(&mut self) -> Result<(), McpError> {
        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version
            }
        });

        let response = self
            .send_request(methods::INITIALIZE, Some(init_params))
            .await?;

        match response.payload {
            ResponsePayload::Success { result } => {
                let mut state = self.state.write().await;

                if let Some(capabilities) = result.get("capabilities") {
                    state.server_capabilities = serde_json::from_value(capabilities.clone())
                        .map_err(|e| {
                            McpError::serialization(format!(
                                "Failed to parse server capabilities: {}",
                                e
                            ))
                        })?;
                }

                if let Some(server_info) = result.get("serverInfo") {
                    if let Some(name) = server_info.get("name").and_then(|v| v.as_str()) {
                        state.server_name = Some(name.to_string());
                    }
                    if let Some(version) = server_info.get("version").and_then(|v| v.as_str()) {
                        state.server_version = Some(version.to_string());
                    }
                }

                state.is_active = true;

                info!(
                    server = %self.server,
                    remote = %state.server_name.as_deref().unwrap_or("unknown"),
                    version = %state.server_version.as_deref().unwrap_or("unknown"),
                    "session initialized"
                );
            }
            ResponsePayload::Error { error } => {
                return Err(McpError::protocol(format!(
                    "Initialize failed: {}",
                    error.message
                )));
            }
        }

        self.send_notification(methods::INITIALIZED, None).await?;

        // A server without the tools capability simply contributes zero
        // tools.
        let has_tools = {
            let state = self.state.read().await;
            state
                .server_capabilities
                .as_ref()
                .map(|caps| caps.tools.is_some())
                .unwrap_or(false)
        };
        if has_tools {
            self.discover_tools().await?;
        }

        Ok(())
    }

    async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<McpResponse, McpError> {
        if !self.is_connected() {
            return Err(McpError::session("Session not initialized"));
        }

        let request_id = self.request_id_counter.fetch_add(1, Ordering::SeqCst);
        let id = json!(request_id);
        let request = McpRequest::new(id.clone(), method, params);

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.lock().await;
            pending.insert(id.clone(), PendingRequest { response_tx });
        }

        let message = McpMessage::Request(request);
        if let Some(write_tx) = self.write_tx.lock().await.as_ref() {
            write_tx
                .send(message)
                .map_err(|_| McpError::connection_lost("Write channel closed"))?;
        } else {
            return Err(McpError::session("Session not initialized"));
        }

        let timeout_duration = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout_duration, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Err(McpError::transport("Response channel closed")),
            Err(_) => {
                self.pending_requests.lock().await.remove(&id);
                Err(McpError::timeout(timeout_duration))
            }
        }
    }

    async fn send_notification(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::session("Session not initialized"));
        }

        let message = McpMessage::Notification(McpNotification::new(method, params));
        if let Some(write_tx) = self.write_tx.lock().await.as_ref() {
            write_tx
                .send(message)
                .map_err(|_| McpError::connection_lost("Write channel closed"))?;
        } else {
            return Err(McpError::session("Session not initialized"));
        }

        Ok(())
    }
}

/// Live sessions keyed by server name.
///
/// This is where subsystem errors stop propagating: `call_tool` always
/// produces an outcome envelope.
pub struct SessionManager {
    config: SessionConfig,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Connect to every server in the registry.
    ///
    /// Fail-soft: a server that cannot be reached or refuses the handshake
    /// is logged and skipped, the rest still connect. Returns the names of
    /// the servers that came up.
    pub async fn start_all(&mut self, registry: &Registry) -> Vec<String> {
        let names: Vec<String> = registry.names().map(str::to_string).collect();
        let mut started = Vec::new();
        for name in names {
            if self.start_server(registry, &name).await {
                started.push(name);
            }
        }
        started
    }

    /// Connect to one named server from the registry.
    ///
    /// Idempotent: a server that is already connected reports success
    /// without reconnecting. An unknown name or a failed connect reports
    /// `false` with the cause logged.
    pub async fn start_server(&mut self, registry: &Registry, name: &str) -> bool {
        if self.is_connected(name) {
            return true;
        }

        let Some(server_config) = registry.get(name) else {
            error!(server = %name, "no such server in the registry");
            return false;
        };

        let transport = TransportFactory::for_config(server_config);
        let mut session = Session::new(name, self.config.clone(), transport);
        match session.start().await {
            Ok(()) => {
                self.sessions.insert(name.to_string(), session);
                true
            }
            Err(e) => {
                error!(server = %name, error = %e, "failed to connect to MCP server");
                false
            }
        }
    }

    /// Disconnect one named server. A server with no session is a no-op.
    pub async fn stop_server(&mut self, name: &str) {
        if let Some(mut session) = self.sessions.remove(name) {
            if let Err(e) = session.stop().await {
                warn!(server = %name, error = %e, "error stopping MCP session");
            }
        }
    }

    /// Re-discover one server's tools, failing soft to an empty list so
    /// one broken server cannot hide the others' tools.
    pub async fn discover_tools(&mut self, name: &str) -> Vec<ToolSpec> {
        let Some(session) = self.sessions.get_mut(name) else {
            warn!(server = %name, "cannot discover tools: server not connected");
            return Vec::new();
        };

        match session.discover_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                error!(server = %name, error = %e, "tool discovery failed");
                Vec::new()
            }
        }
    }

    /// Start a single session and adopt it. Replaces any previous session
    /// for the same server.
    pub async fn start_session(&mut self, mut session: Session) -> Result<(), McpError> {
        session.start().await?;
        if let Some(mut old) = self
            .sessions
            .insert(session.server().to_string(), session)
        {
            let _ = old.stop().await;
        }
        Ok(())
    }

    /// All discovered tools across connected servers, tagged with their
    /// owning server.
    pub async fn collect_tools(&self) -> Vec<RemoteTool> {
        let mut tools = Vec::new();
        for (name, session) in &self.sessions {
            for spec in session.tools().await {
                tools.push(RemoteTool::from_spec(spec, name.clone()));
            }
        }
        tools
    }

    /// Execute a tool on a named server, folding every failure mode into
    /// the outcome envelope.
    pub async fn call_tool(
        &mut self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> ToolOutcome {
        let Some(session) = self.sessions.get_mut(server) else {
            return ToolOutcome::failure(format!("Server '{}' is not connected", server));
        };

        match session.call_tool(tool, arguments).await {
            Ok(result) => ToolOutcome::from_call_result(result),
            Err(e) => {
                warn!(server = %server, tool = %tool, error = %e, "tool call failed");
                ToolOutcome::failure(e.to_string())
            }
        }
    }

    /// Disconnect every session. Stop failures are logged, not propagated.
    pub async fn stop_all(&mut self) {
        for (name, mut session) in self.sessions.drain() {
            if let Err(e) = session.stop().await {
                warn!(server = %name, error = %e, "error stopping MCP session");
            }
        }
    }

    pub fn connected_servers(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    pub fn is_connected(&self, server: &str) -> bool {
        self.sessions
            .get(server)
            .map(Session::is_connected)
            .unwrap_or(false)
    }
}
