//! Server registry loaded from a JSON configuration file.
//!
//! The file carries a single `mcpServers` object mapping server names to
//! connection entries. Loading is fail-soft: a missing file, unparseable
//! JSON, or an invalid entry is logged and yields an empty (or reduced)
//! registry rather than an error, so a broken config can never prevent
//! the host agent from starting.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": {"command": "mcp-files", "args": ["--root", "/data"]},
//!     "search": {"transport": "streamable_http", "url": "http://localhost:8200"}
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::McpError;

/// Connection settings for one configured server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerConfig {
    /// Local subprocess speaking MCP over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(
            default,
            rename = "workingDirectory",
            skip_serializing_if = "Option::is_none"
        )]
        working_dir: Option<String>,
    },
    /// Remote server reached over HTTP with an SSE event stream.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServerConfig {
    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerConfig::Stdio { .. } => "stdio",
            ServerConfig::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Raw entry shape before transport resolution.
///
/// The `transport` field is optional in config files: entries with a
/// `url` default to streamable HTTP, everything else defaults to stdio.
#[derive(Debug, Deserialize)]
struct RawEntry {
    transport: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(rename = "workingDirectory")]
    working_dir: Option<String>,
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl RawEntry {
    fn resolve(self, name: &str) -> Result<ServerConfig, McpError> {
        let transport = match self.transport.as_deref() {
            Some(explicit) => explicit.to_string(),
            None if self.url.is_some() => "streamable_http".to_string(),
            None => "stdio".to_string(),
        };

        match transport.as_str() {
            "stdio" => {
                let command = self.command.ok_or_else(|| {
                    McpError::config(format!("server '{}': stdio entry missing 'command'", name))
                })?;
                Ok(ServerConfig::Stdio {
                    command,
                    args: self.args,
                    env: self.env,
                    working_dir: self.working_dir,
                })
            }
            "streamable_http" => {
                let url = self.url.ok_or_else(|| {
                    McpError::config(format!("server '{}': http entry missing 'url'", name))
                })?;
                Ok(ServerConfig::StreamableHttp {
                    url,
                    headers: self.headers,
                })
            }
            other => Err(McpError::config(format!(
                "server '{}': unknown transport '{}'",
                name, other
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, serde_json::Value>,
}

/// Named server configurations, post-resolution.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    servers: HashMap<String, ServerConfig>,
}

impl Registry {
    /// Load a registry from a config file, skipping anything invalid.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!(path = %path.display(), "MCP config file not found, no servers configured");
                return Self::default();
            }
        };

        let file: ConfigFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse MCP config");
                return Self::default();
            }
        };

        let mut servers = HashMap::new();
        for (name, value) in file.mcp_servers {
            let entry: RawEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(server = %name, error = %e, "skipping malformed server entry");
                    continue;
                }
            };
            match entry.resolve(&name) {
                Ok(config) => {
                    debug!(server = %name, transport = config.transport_name(), "registered MCP server");
                    servers.insert(name, config);
                }
                Err(e) => {
                    error!(server = %name, error = %e, "skipping invalid server entry");
                }
            }
        }

        Self { servers }
    }

    pub fn from_map(servers: HashMap<String, ServerConfig>) -> Self {
        Self { servers }
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerConfig)> {
        self.servers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_stdio_entry_defaults() {
        let file = write_config(
            r#"{"mcpServers": {"files": {"command": "mcp-files", "args": ["--root", "/data"]}}}"#,
        );
        let registry = Registry::load(file.path());
        assert_eq!(registry.len(), 1);
        match registry.get("files").unwrap() {
            ServerConfig::Stdio { command, args, env, working_dir } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, &["--root".to_string(), "/data".to_string()]);
                assert!(env.is_empty());
                assert!(working_dir.is_none());
            }
            other => panic!("expected stdio config, got {:?}", other),
        }
    }

    #[test]
    fn test_url_implies_http_transport() {
        let file = write_config(
            r#"{"mcpServers": {"search": {"url": "http://localhost:8200", "headers": {"Authorization": "Bearer t"}}}}"#,
        );
        let registry = Registry::load(file.path());
        match registry.get("search").unwrap() {
            ServerConfig::StreamableHttp { url, headers } => {
                assert_eq!(url, "http://localhost:8200");
                assert_eq!(headers.get("Authorization").unwrap(), "Bearer t");
            }
            other => panic!("expected http config, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_transport_wins() {
        let file = write_config(
            r#"{"mcpServers": {"s": {"transport": "streamable_http", "url": "http://h:1", "command": "ignored"}}}"#,
        );
        let registry = Registry::load(file.path());
        assert_eq!(
            registry.get("s").unwrap().transport_name(),
            "streamable_http"
        );
    }

    #[test]
    fn test_missing_file_is_empty() {
        let registry = Registry::load("/nonexistent/mcp.json");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_json_is_empty() {
        let file = write_config("{not json");
        let registry = Registry::load(file.path());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_entry_skipped_others_kept() {
        let file = write_config(
            r#"{"mcpServers": {
                "good": {"command": "ok"},
                "no_command": {"args": ["x"]},
                "bad_transport": {"transport": "websocket", "url": "ws://h"}
            }}"#,
        );
        let registry = Registry::load(file.path());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("good").is_some());
        assert!(registry.get("no_command").is_none());
        assert!(registry.get("bad_transport").is_none());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = ServerConfig::Stdio {
            command: "mcp-files".into(),
            args: vec!["--verbose".into()],
            env: HashMap::new(),
            working_dir: Some("/srv".into()),
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["transport"], "stdio");
        assert_eq!(value["workingDirectory"], "/srv");
    }

    #[test]
    fn test_load_serialize_reload_round_trip() {
        let file = write_config(
            r#"{"mcpServers": {
                "files": {"command": "mcp-files", "args": ["--root", "/data"], "env": {"LOG": "debug"}},
                "search": {"url": "http://localhost:8200", "headers": {"Authorization": "Bearer t"}}
            }}"#,
        );
        let first = Registry::load(file.path());

        // Re-serialize what we loaded and load it again.
        let doc = serde_json::json!({
            "mcpServers": first
                .iter()
                .map(|(name, config)| (name.to_string(), serde_json::to_value(config).unwrap()))
                .collect::<serde_json::Map<String, serde_json::Value>>()
        });
        let rewritten = write_config(&doc.to_string());
        let second = Registry::load(rewritten.path());

        assert_eq!(first.len(), second.len());
        for (name, config) in first.iter() {
            assert_eq!(second.get(name), Some(config));
        }
    }
}
