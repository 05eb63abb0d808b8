//! Error types for MCP client operations.
//!
//! Every expected failure mode in this crate - a server that refuses to
//! spawn, a handshake that times out, a tool that reports an error - is
//! represented here and converted into a return value at the layer where
//! it occurs. Callers above the session layer see the uniform
//! [`ToolOutcome`](crate::types::ToolOutcome) envelope instead; nothing in
//! this crate propagates an expected failure as a panic.
//!
//! Helper predicates classify errors for retry and reconnection decisions:
//!
//! ```rust
//! # use mcp_bridge::error::McpError;
//! # use std::time::Duration;
//! let err = McpError::timeout(Duration::from_secs(30));
//! assert!(err.is_timeout());
//! assert!(!err.is_connection_error());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Primary error type for all MCP client operations.
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// Transport-level failures not specific to one transport kind.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// HTTP transport failures (request errors, non-2xx responses).
    #[error("http error: {message}")]
    Http { message: String },

    /// Stdio transport failures (spawn errors, broken pipes).
    #[error("stdio error: {message}")]
    Stdio { message: String },

    /// JSON-RPC / MCP protocol violations.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Message encoding or decoding failures.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// A bounded operation exceeded its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Session state errors (not connected, handshake incomplete).
    #[error("session error: {message}")]
    Session { message: String },

    /// Server registry configuration errors.
    #[error("config error: {message}")]
    Config { message: String },

    /// The underlying connection went away mid-operation.
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    /// A remote tool signalled failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },
}

impl McpError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    pub fn stdio(message: impl Into<String>) -> Self {
        Self::Stdio {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the connection should be considered gone.
    ///
    /// A timed-out call does not count: the session may still be healthy
    /// and subsequent calls are allowed to proceed against it.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Http { .. }
                | Self::Stdio { .. }
                | Self::ConnectionLost { .. }
        )
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let err = McpError::transport("connect refused");
        assert!(matches!(err, McpError::Transport { .. }));

        let err = McpError::tool_execution("search", "backend unavailable");
        let display = err.to_string();
        assert!(display.contains("search"));
        assert!(display.contains("backend unavailable"));
    }

    #[test]
    fn test_classification() {
        assert!(McpError::connection_lost("pipe closed").is_connection_error());
        assert!(McpError::stdio("spawn failed").is_connection_error());
        assert!(!McpError::protocol("bad id").is_connection_error());

        let timeout = McpError::timeout(Duration::from_secs(30));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connection_error());
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: McpError = parse_err.into();
        assert!(matches!(err, McpError::Serialization { .. }));
    }
}
