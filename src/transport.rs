//! Transport layer for MCP communication channels.
//!
//! Two transports are supported: local subprocesses speaking line-delimited
//! JSON-RPC over stdin/stdout, and remote servers speaking "streamable HTTP"
//! (request/response over POST plus a server-push SSE channel).
//!
//! Both follow the same shape: `connect()` establishes the underlying
//! channel, spawns background I/O tasks, and returns a [`TransportStreams`]
//! pair of boxed read/write streams carrying already-(de)serialized
//! [`McpMessage`] values. `disconnect()` signals the tasks to stop and
//! releases transport resources (for stdio, that includes terminating the
//! child process).
//!
//! # Streamable HTTP
//!
//! The HTTP transport maps the duplex stream abstraction onto two
//! endpoints derived from the configured base URL:
//!
//! - `POST {base}/messages` - every outgoing message is posted here; when
//!   the response body is itself a JSON-RPC message it is fed into the
//!   read stream.
//! - `GET {base}/sse` - a long-lived event stream for server-initiated
//!   messages; each `data:` event is parsed and fed into the read stream.
//!
//! The first response's `Mcp-Session-Id` header (when present) is captured
//! and appended to every later POST as a `session_id` query parameter. The
//! initial handshake POST never carries one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::sink::Sink;
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::McpError;
use crate::registry::ServerConfig;
use crate::types::McpMessage;

/// Type aliases for the boxed message streams handed to sessions.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<McpMessage, McpError>> + Send>>;
pub type MessageSink = Pin<Box<dyn Sink<McpMessage, Error = McpError> + Send>>;

/// Transport connection result containing read and write streams.
pub struct TransportStreams {
    /// Stream for receiving messages from the MCP server.
    pub read_stream: MessageStream,
    /// Sink for sending messages to the MCP server.
    pub write_stream: MessageSink,
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams")
            .field("read_stream", &"<message_stream>")
            .field("write_stream", &"<message_sink>")
            .finish()
    }
}

/// Core trait for MCP transport implementations.
///
/// Transports handle the underlying communication channel; the session
/// layer manages protocol-level concerns. `connect()` establishes the
/// channel and returns streams, `disconnect()` tears it down.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish the connection and return communication streams.
    ///
    /// Background tasks spawned here handle the actual I/O; messages on
    /// the returned streams are already serialized/deserialized.
    async fn connect(&mut self) -> Result<TransportStreams, McpError>;

    /// Close the connection and clean up transport resources.
    async fn disconnect(&mut self) -> Result<(), McpError>;

    /// Whether the transport currently has an active connection.
    fn is_connected(&self) -> bool;

    /// Metadata about this transport for logging and diagnostics.
    fn transport_info(&self) -> TransportInfo;
}

/// Metadata about a transport's configuration.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Type of transport ("stdio" or "streamable_http").
    pub transport_type: String,
    /// Connection endpoint or command line.
    pub endpoint: String,
}

/// Configuration for process-based MCP servers using stdin/stdout.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to execute.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub working_dir: Option<String>,
    /// Extra environment variables to set.
    pub env_vars: HashMap<String, String>,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env_vars: HashMap::new(),
        }
    }
}

/// Configuration for streamable-HTTP MCP servers.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL of the server; `/sse` and `/messages` are derived from it.
    pub url: String,
    /// Additional headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Factory for creating configured transport instances.
pub struct TransportFactory;

impl TransportFactory {
    /// Create a stdio transport for local process-based MCP servers.
    pub fn stdio(config: StdioConfig) -> Box<dyn McpTransport> {
        Box::new(StdioTransport::new(config))
    }

    /// Create a streamable-HTTP transport for remote MCP servers.
    pub fn streamable_http(config: HttpConfig) -> Box<dyn McpTransport> {
        Box::new(HttpStreamTransport::new(config))
    }

    /// Create the right transport for a registry entry.
    pub fn for_config(config: &ServerConfig) -> Box<dyn McpTransport> {
        match config {
            ServerConfig::Stdio {
                command,
                args,
                env,
                working_dir,
            } => Self::stdio(StdioConfig {
                command: command.clone(),
                args: args.clone(),
                working_dir: working_dir.clone(),
                env_vars: env.clone(),
            }),
            ServerConfig::StreamableHttp { url, headers } => Self::streamable_http(HttpConfig {
                url: url.clone(),
                headers: headers.clone(),
                ..Default::default()
            }),
        }
    }
}

/// Stdio transport implementation for process-based MCP servers.
pub struct StdioTransport {
    config: StdioConfig,
    connected: bool,
    process_handle: Option<tokio::process::Child>,
    close_sender: Option<mpsc::UnboundedSender<()>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            connected: false,
            process_handle: None,
            close_sender: None,
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&mut self) -> Result<TransportStreams, McpError> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::process::Command;

        if self.config.command.is_empty() {
            return Err(McpError::transport("Command cannot be empty"));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop if the session is abandoned before a clean stop.
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::stdio(format!(
                "Failed to spawn process '{}': {}",
                self.config.command, e
            ))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::stdio("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::stdio("Failed to get stdout handle"))?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        self.process_handle = Some(child);
        self.close_sender = Some(close_tx);

        // Reader task: one JSON-RPC message per line of stdout.
        let read_tx_clone = read_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                tokio::select! {
                    result = reader.read_line(&mut line) => {
                        match result {
                            Ok(0) => {
                                let error = McpError::connection_lost("Process stdout closed");
                                let _ = read_tx_clone.send(Err(error));
                                break;
                            }
                            Ok(_) => {
                                let trimmed = line.trim();
                                if !trimmed.is_empty() {
                                    match serde_json::from_str::<McpMessage>(trimmed) {
                                        Ok(message) => {
                                            if read_tx_clone.send(Ok(message)).is_err() {
                                                break; // Receiver dropped
                                            }
                                        }
                                        Err(e) => {
                                            let error = McpError::serialization(format!(
                                                "Failed to parse MCP message: {}",
                                                e
                                            ));
                                            if read_tx_clone.send(Err(error)).is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                                line.clear();
                            }
                            Err(e) => {
                                let error = McpError::stdio(format!("Error reading from stdout: {}", e));
                                let _ = read_tx_clone.send(Err(error));
                                break;
                            }
                        }
                    }

                    _ = close_rx.recv() => {
                        break;
                    }
                }
            }
        });

        // Writer task: serialize each message as one line on stdin.
        tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };

                let line = format!("{}\n", json);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break; // Process stdin closed
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        self.connected = true;

        Ok(channel_streams(read_rx, write_tx))
    }

    async fn disconnect(&mut self) -> Result<(), McpError> {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }

        if let Some(mut child) = self.process_handle.take() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SIGTERM first, SIGKILL only if the server ignores it.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }

                    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                        Ok(Ok(_)) => {}
                        _ => {
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "stdio".to_string(),
            endpoint: format!("{} {}", self.config.command, self.config.args.join(" ")),
        }
    }
}

/// Build the `/messages` POST URL, carrying the session id once known.
fn messages_url(base: &str, session_id: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match session_id {
        Some(id) => format!("{}/messages?session_id={}", base, id),
        None => format!("{}/messages", base),
    }
}

/// Build the `/sse` GET URL for the server-push event stream.
fn sse_url(base: &str) -> String {
    format!("{}/sse", base.trim_end_matches('/'))
}

/// Streamable-HTTP transport implementation.
pub struct HttpStreamTransport {
    config: HttpConfig,
    connected: bool,
    close_sender: Option<mpsc::UnboundedSender<()>>,
    session_id: Arc<Mutex<Option<String>>>,
}

impl HttpStreamTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            connected: false,
            close_sender: None,
            session_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Session id captured from the server, if the handshake assigned one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn header_map(&self) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderName, HeaderValue};

        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            let name = match key.parse::<HeaderName>() {
                Ok(name) => name,
                Err(_) => {
                    warn!(header = %key, "skipping invalid header name");
                    continue;
                }
            };
            let value = match value.parse::<HeaderValue>() {
                Ok(value) => value,
                Err(_) => {
                    warn!(header = %key, "skipping invalid header value");
                    continue;
                }
            };
            map.insert(name, value);
        }
        map
    }
}

#[async_trait]
impl McpTransport for HttpStreamTransport {
    async fn connect(&mut self) -> Result<TransportStreams, McpError> {
        let base = Url::parse(&self.config.url)
            .map_err(|e| McpError::http(format!("Invalid server URL: {}", e)))?;
        let base = base.as_str().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .default_headers(self.header_map())
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .build()
            .map_err(|e| McpError::http(format!("Failed to build HTTP client: {}", e)))?;

        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<McpMessage>();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();

        self.close_sender = Some(close_tx);
        let session_id = Arc::clone(&self.session_id);

        // Writer task: POST each outgoing message; responses whose body is
        // a JSON-RPC message are fed into the read stream. The session id
        // appears on the URL only after the server has assigned one, so
        // the initial handshake POST never carries it.
        let post_client = client.clone();
        let post_base = base.clone();
        let post_read_tx = read_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = write_rx.recv() => {
                        let Some(message) = message else { break };

                        let current_session = session_id
                            .lock()
                            .ok()
                            .and_then(|guard| guard.clone());
                        let url = messages_url(&post_base, current_session.as_deref());

                        let response = match post_client.post(&url).json(&message).send().await {
                            Ok(response) => response,
                            Err(e) => {
                                let error = McpError::http(format!("POST to {} failed: {}", url, e));
                                if post_read_tx.send(Err(error)).is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        if let Some(assigned) = response
                            .headers()
                            .get("Mcp-Session-Id")
                            .and_then(|v| v.to_str().ok())
                        {
                            if let Ok(mut guard) = session_id.lock() {
                                if guard.as_deref() != Some(assigned) {
                                    debug!(session_id = %assigned, "captured MCP session id");
                                    *guard = Some(assigned.to_string());
                                }
                            }
                        }

                        let status = response.status();
                        let body = match response.text().await {
                            Ok(body) => body,
                            Err(e) => {
                                let error = McpError::http(format!("Failed to read response body: {}", e));
                                if post_read_tx.send(Err(error)).is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        if !status.is_success() {
                            let error = McpError::http(format!(
                                "Server returned {} for {}: {}",
                                status, url, body
                            ));
                            if post_read_tx.send(Err(error)).is_err() {
                                break;
                            }
                            continue;
                        }

                        let trimmed = body.trim();
                        if trimmed.is_empty() {
                            continue; // Accepted notification, no payload
                        }
                        match serde_json::from_str::<McpMessage>(trimmed) {
                            Ok(parsed) => {
                                // Some servers return the session id in the
                                // handshake result instead of a header.
                                if let McpMessage::Response(ref response) = parsed {
                                    if let crate::types::ResponsePayload::Success { result } =
                                        &response.payload
                                    {
                                        if let Some(assigned) =
                                            result.get("sessionId").and_then(|v| v.as_str())
                                        {
                                            if let Ok(mut guard) = session_id.lock() {
                                                if guard.is_none() {
                                                    debug!(session_id = %assigned, "captured MCP session id from body");
                                                    *guard = Some(assigned.to_string());
                                                }
                                            }
                                        }
                                    }
                                }
                                if post_read_tx.send(Ok(parsed)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "response body was not a JSON-RPC message, ignoring");
                            }
                        }
                    }

                    _ = close_rx.recv() => {
                        break;
                    }
                }
            }
        });

        // SSE task: long-lived GET feeding server-initiated messages into
        // the same read stream. A failed or absent event stream is not
        // fatal since the POST path carries request/response traffic.
        let events_url = sse_url(&base);
        tokio::spawn(async move {
            let response = match client
                .get(&events_url)
                .header("Accept", "text/event-stream")
                .timeout(Duration::from_secs(24 * 60 * 60))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    debug!(status = %response.status(), url = %events_url, "event stream unavailable");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, url = %events_url, "event stream connection failed");
                    return;
                }
            };

            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "event stream ended");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<McpMessage>(data) {
                        Ok(message) => {
                            if read_tx.send(Ok(message)).is_err() {
                                return; // Receiver dropped
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "ignoring non-JSON-RPC event");
                        }
                    }
                }
            }
        });

        self.connected = true;

        Ok(channel_streams(read_rx, write_tx))
    }

    async fn disconnect(&mut self) -> Result<(), McpError> {
        if let Some(close_sender) = self.close_sender.take() {
            let _ = close_sender.send(());
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            transport_type: "streamable_http".to_string(),
            endpoint: self.config.url.clone(),
        }
    }
}

/// Wrap channel endpoints into the boxed stream pair sessions consume.
fn channel_streams(
    read_rx: mpsc::UnboundedReceiver<Result<McpMessage, McpError>>,
    write_tx: mpsc::UnboundedSender<McpMessage>,
) -> TransportStreams {
    let read_stream = Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(
        read_rx,
    ));
    let write_stream = Box::pin(futures::sink::unfold(write_tx, |tx, msg| async move {
        tx.send(msg)
            .map_err(|_| McpError::connection_lost("Write channel closed"))
            .map(|_| tx)
    }));

    TransportStreams {
        read_stream,
        write_stream,
    }
}

/// Create connected in-memory message streams for unit tests.
///
/// Returns a sender for injecting messages into the read stream, a
/// receiver capturing everything written to the write stream, and the
/// [`TransportStreams`] pair to hand to a session.
pub fn create_test_streams() -> (
    mpsc::UnboundedSender<Result<McpMessage, McpError>>,
    mpsc::UnboundedReceiver<McpMessage>,
    TransportStreams,
) {
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    (read_tx, write_rx, channel_streams(read_rx, write_tx))
}
