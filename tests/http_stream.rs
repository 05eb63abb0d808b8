//! End-to-end tests against a minimal in-process streamable-HTTP server.
//!
//! The server accepts one request per connection, answers JSON-RPC over
//! POST `/messages`, assigns a session id via the `Mcp-Session-Id`
//! header, and records every request target so tests can assert how the
//! client builds URLs.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mcp_bridge::transport::{HttpConfig, HttpStreamTransport, McpTransport};
use mcp_bridge::types::{McpMessage, McpRequest};
use mcp_bridge::{ClientState, McpClient};

const SESSION_ID: &str = "test-session-123";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mcp_bridge=debug")
        .with_test_writer()
        .try_init();
}

type RequestLog = Arc<Mutex<Vec<String>>>;

fn rpc_result(method: &str, body: &Value) -> Value {
    match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "test-http-server", "version": "0.0.1"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "search",
                "description": "Search the index",
                "inputSchema": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                }
            }]
        }),
        "tools/call" => {
            let query = body
                .pointer("/params/arguments/query")
                .and_then(Value::as_str)
                .unwrap_or("");
            json!({"content": [{"type": "text", "text": format!("results for {}", query)}]})
        }
        _ => json!({}),
    }
}

async fn handle_connection(mut socket: tokio::net::TcpStream, log: RequestLog) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the header terminator, then drain the body per
    // Content-Length.
    let header_end = loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or("").to_string();
    let content_length: usize = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .next()
        .unwrap_or(0);

    while raw.len() < header_end + content_length {
        let n = match socket.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => return,
        };
        raw.extend_from_slice(&chunk[..n]);
    }

    let mut parts = request_line.split_whitespace();
    let verb = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("").to_string();
    log.lock().unwrap().push(format!("{} {}", verb, target));

    let response = if verb == "GET" {
        // No event stream in this server; the client tolerates that.
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    } else {
        let body: Value =
            serde_json::from_slice(&raw[header_end..header_end + content_length])
                .unwrap_or(Value::Null);
        match body.get("id") {
            Some(id) => {
                let method = body.get("method").and_then(Value::as_str).unwrap_or("");
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": rpc_result(method, &body)
                })
                .to_string();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nMcp-Session-Id: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    SESSION_ID,
                    reply.len(),
                    reply
                )
            }
            // Notifications are accepted without a payload.
            None => format!(
                "HTTP/1.1 202 Accepted\r\nMcp-Session-Id: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                SESSION_ID
            ),
        }
    };

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn spawn_server() -> (String, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let accept_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_connection(socket, Arc::clone(&accept_log)));
        }
    });

    (format!("http://{}", addr), log)
}

#[tokio::test]
async fn session_id_is_appended_after_handshake() {
    init_logging();
    let (url, log) = spawn_server().await;

    let mut transport = HttpStreamTransport::new(HttpConfig {
        url,
        ..Default::default()
    });
    let streams = transport.connect().await.unwrap();
    let mut read_stream = streams.read_stream;
    let mut write_stream = streams.write_stream;

    // Handshake request goes out before any session id exists.
    let first = McpMessage::Request(McpRequest::new(json!(1), "initialize", Some(json!({}))));
    write_stream.send(first).await.unwrap();
    let response = read_stream.next().await.unwrap().unwrap();
    assert!(matches!(response, McpMessage::Response(_)));
    assert_eq!(transport.session_id().as_deref(), Some(SESSION_ID));

    // Every request after the handshake carries the assigned session id.
    let second = McpMessage::Request(McpRequest::new(json!(2), "tools/list", None));
    write_stream.send(second).await.unwrap();
    read_stream.next().await.unwrap().unwrap();

    let posts: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with("POST"))
        .cloned()
        .collect();
    assert_eq!(posts[0], "POST /messages");
    assert_eq!(
        posts[1],
        format!("POST /messages?session_id={}", SESSION_ID)
    );

    transport.disconnect().await.unwrap();
}

#[test]
fn full_lifecycle_over_http() {
    init_logging();
    // The server runs on its own runtime thread so the synchronous client
    // can be exercised exactly as an agent loop would use it.
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (url, log) = spawn_server().await;
            addr_tx.send((url, log)).unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
    });
    let (url, _log) = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut config_file = NamedTempFile::new().unwrap();
    write!(
        config_file,
        r#"{{"mcpServers": {{"remote": {{"transport": "streamable_http", "url": "{}"}}}}}}"#,
        url
    )
    .unwrap();

    let mut client = McpClient::with_config_path(config_file.path());
    let tools = client.initialize().unwrap();
    assert_eq!(client.state(), ClientState::Running);
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name(), "mcp_remote_search");

    // Positional, keyword, and generic conventions all reach the server
    // as the same keyword arguments.
    for arguments in [
        json!("rust"),
        json!({"query": "rust"}),
        json!({"__arg1": "rust"}),
    ] {
        let outcome = tools[0].call(Some(arguments));
        assert!(outcome.success, "call failed: {:?}", outcome.error);
        assert_eq!(outcome.content, vec!["results for rust".to_string()]);
    }

    client.cleanup();
    assert_eq!(client.state(), ClientState::CleanedUp);
}
