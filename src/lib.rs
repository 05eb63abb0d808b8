//! Bridge MCP servers into synchronous agent tool loops.
//!
//! This crate connects to Model Context Protocol servers - local
//! subprocesses over stdio or remote servers over streamable HTTP - and
//! exposes their tools as plain synchronous callables that an agent loop
//! can invoke without touching async code or handling errors.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_bridge::McpClient;
//!
//! # fn example() -> Result<(), mcp_bridge::McpError> {
//! let mut client = McpClient::with_config_path("mcp_config.json");
//! let tools = client.initialize()?;
//!
//! for tool in &tools {
//!     println!("{}: {}", tool.name(), tool.description());
//! }
//!
//! if let Some(search) = client.find_tool("mcp_files_search") {
//!     let outcome = search.call(Some(serde_json::json!({"query": "rust"})));
//!     println!("success: {}", outcome.success);
//! }
//!
//! client.cleanup();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`registry`] - named server configurations loaded fail-soft from a
//!   JSON file
//! - [`transport`] - stdio and streamable-HTTP connectors behind one
//!   duplex stream trait
//! - [`session`] - per-server protocol sessions and the manager that
//!   folds every failure into a [`ToolOutcome`] envelope
//! - [`runner`] - a dedicated runtime thread giving sync callers bounded
//!   blocking waits
//! - [`bridge`] - schema-aware argument normalization and the
//!   `mcp_<server>_<tool>` callables
//! - [`lifecycle`] - the idempotent top-level client
//!
//! # Error Boundary
//!
//! Everything reachable from a tool call returns a [`ToolOutcome`]: a
//! disconnected server, a remote tool reporting failure, a malformed
//! response, and a timeout all come back as `success: false` with a
//! message. [`McpError`] only crosses the API at setup time.

pub mod bridge;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod runner;
pub mod session;
pub mod transport;
pub mod types;

pub use bridge::BridgedTool;
pub use error::McpError;
pub use lifecycle::{ClientConfig, ClientState, McpClient};
pub use registry::{Registry, ServerConfig};
pub use runner::Runner;
pub use session::{Session, SessionConfig, SessionManager};
pub use types::{RemoteTool, ToolOutcome};
