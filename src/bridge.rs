//! Bridging discovered MCP tools into synchronous agent callables.
//!
//! Each discovered tool becomes a [`BridgedTool`] named
//! `mcp_<server>_<tool>`, carrying an augmented description and a
//! schema-derived parameter list. Calling one normalizes whatever argument
//! convention the agent used into the keyword form the server expects,
//! submits the call through the [`Runner`], and returns a [`ToolOutcome`]
//! envelope whatever happens.
//!
//! # Argument conventions
//!
//! Agents invoke tools three ways, all accepted here:
//!
//! - positional: `["rust"]` - zipped onto parameters in declared order
//! - keyword: `{"query": "rust"}` - passed through unchanged
//! - generic: `{"__arg1": "rust"}` - numbered placeholders mapped onto
//!   the remaining parameters in declared order
//!
//! A bare scalar is treated as a single positional argument. Declared
//! order puts required parameters first (in schema order), then optional
//! ones (in schema order).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::McpError;
use crate::runner::Runner;
use crate::session::SessionManager;
use crate::types::{RemoteTool, ToolOutcome};

/// One parameter extracted from a tool's input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub type_name: Option<String>,
    pub description: Option<String>,
}

/// Extract the parameter list from a JSON schema, required first.
///
/// Both groups keep the schema's own property order, which is why the
/// crate enables `serde_json`'s order-preserving maps.
pub fn params_from_schema(schema: &Value) -> Vec<ParamSpec> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut params: Vec<ParamSpec> = Vec::with_capacity(properties.len());
    for (name, prop) in properties {
        params.push(ParamSpec {
            name: name.clone(),
            required: required.contains(&name.as_str()),
            type_name: prop
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string),
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    params.sort_by_key(|param| !param.required);
    params
}

/// Build the agent-facing description: server prefix plus a parameter
/// block derived from the schema.
pub fn augment_description(tool: &RemoteTool, params: &[ParamSpec]) -> String {
    let mut description = format!("[MCP {}] {}", tool.server, tool.description.trim());

    if !params.is_empty() {
        description.push_str("\n\nParameters:");
        for param in params {
            let type_name = param.type_name.as_deref().unwrap_or("any");
            let requirement = if param.required { "required" } else { "optional" };
            description.push_str(&format!("\n- {} ({}, {})", param.name, type_name, requirement));
            if let Some(text) = &param.description {
                description.push_str(&format!(": {}", text));
            }
        }
    }

    description
}

fn generic_arg_index(key: &str) -> Option<usize> {
    key.strip_prefix("__arg").and_then(|n| n.parse().ok())
}

/// Normalize any accepted argument convention into a keyword object.
pub fn normalize_arguments(
    arguments: Option<Value>,
    params: &[ParamSpec],
) -> Result<Value, McpError> {
    let arguments = match arguments {
        None | Some(Value::Null) => return Ok(Value::Object(Map::new())),
        Some(arguments) => arguments,
    };

    match arguments {
        Value::Array(positional) => {
            if positional.len() > params.len() {
                return Err(McpError::protocol(format!(
                    "Too many positional arguments: got {}, tool takes {}",
                    positional.len(),
                    params.len()
                )));
            }
            let mut object = Map::new();
            for (value, param) in positional.into_iter().zip(params) {
                object.insert(param.name.clone(), value);
            }
            Ok(Value::Object(object))
        }

        Value::Object(mut object) => {
            let generic_keys: Vec<String> = object
                .keys()
                .filter(|key| generic_arg_index(key).is_some())
                .cloned()
                .collect();
            if generic_keys.is_empty() {
                return Ok(Value::Object(object));
            }

            // Pull the placeholders out, ordered by their number, and map
            // them onto parameters not already supplied by real keys.
            let mut generics: Vec<(usize, Value)> = Vec::with_capacity(generic_keys.len());
            for key in &generic_keys {
                if let (Some(index), Some(value)) = (generic_arg_index(key), object.remove(key)) {
                    generics.push((index, value));
                }
            }
            generics.sort_by_key(|(index, _)| *index);

            let open_params: Vec<String> = params
                .iter()
                .filter(|param| !object.contains_key(&param.name))
                .map(|param| param.name.clone())
                .collect();
            let mut open_params = open_params.into_iter();
            for (_, value) in generics {
                let Some(name) = open_params.next() else {
                    return Err(McpError::protocol(format!(
                        "Too many generic arguments: tool takes {} parameter(s)",
                        params.len()
                    )));
                };
                object.insert(name, value);
            }
            Ok(Value::Object(object))
        }

        // A bare scalar is a single positional argument.
        scalar => {
            let Some(param) = params.first() else {
                return Err(McpError::protocol(
                    "Tool takes no arguments but one was given",
                ));
            };
            let mut object = Map::new();
            object.insert(param.name.clone(), scalar);
            Ok(Value::Object(object))
        }
    }
}

/// A discovered tool wrapped as a synchronous callable.
#[derive(Clone)]
pub struct BridgedTool {
    name: String,
    description: String,
    server: String,
    remote_name: String,
    params: Vec<ParamSpec>,
    input_schema: Value,
    manager: Arc<tokio::sync::Mutex<SessionManager>>,
    runner: Arc<Runner>,
    call_bound: Duration,
}

impl std::fmt::Debug for BridgedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedTool")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("remote_name", &self.remote_name)
            .finish()
    }
}

impl BridgedTool {
    /// Composite name exposed to the agent.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Name as the owning server knows it.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Execute the tool, blocking the caller for at most the configured
    /// bound. Never panics or returns an error: every failure mode is an
    /// envelope.
    pub fn call(&self, arguments: Option<Value>) -> ToolOutcome {
        let normalized = match normalize_arguments(arguments, &self.params) {
            Ok(normalized) => normalized,
            Err(e) => return ToolOutcome::failure(e.to_string()),
        };

        debug!(tool = %self.name, args = %normalized, "invoking bridged tool");

        let manager = Arc::clone(&self.manager);
        let server = self.server.clone();
        let remote_name = self.remote_name.clone();

        let submitted = self.runner.block_on(
            async move {
                let mut manager = manager.lock().await;
                manager.call_tool(&server, &remote_name, Some(normalized)).await
            },
            self.call_bound,
        );

        match submitted {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::failure(e.to_string()),
        }
    }
}

/// Wrap discovered tools as callables bound to a manager and runner.
///
/// `call_bound` should exceed the session request timeout slightly so
/// remote timeouts surface as envelopes from the session layer rather
/// than as runner timeouts.
pub fn build_callables(
    tools: Vec<RemoteTool>,
    manager: Arc<tokio::sync::Mutex<SessionManager>>,
    runner: Arc<Runner>,
    call_bound: Duration,
) -> Vec<BridgedTool> {
    tools
        .into_iter()
        .map(|tool| {
            let params = params_from_schema(&tool.input_schema);
            let description = augment_description(&tool, &params);
            BridgedTool {
                name: format!("mcp_{}_{}", tool.server, tool.name),
                description,
                server: tool.server,
                remote_name: tool.name,
                params,
                input_schema: tool.input_schema,
                manager: Arc::clone(&manager),
                runner: Arc::clone(&runner),
                call_bound,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use serde_json::json;

    fn search_params() -> Vec<ParamSpec> {
        params_from_schema(&json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "description": "max results"},
                "query": {"type": "string", "description": "search text"}
            },
            "required": ["query"]
        }))
    }

    #[test]
    fn test_params_required_first_in_schema_order() {
        let params = params_from_schema(&json!({
            "type": "object",
            "properties": {
                "c": {"type": "string"},
                "a": {"type": "string"},
                "b": {"type": "string"}
            },
            "required": ["a", "c"]
        }));
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        // Required keep schema order (c before a), optional follow.
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_params_from_schemaless_tool() {
        assert!(params_from_schema(&json!({"type": "object"})).is_empty());
        assert!(params_from_schema(&json!(null)).is_empty());
    }

    #[test]
    fn test_normalize_empty_forms() {
        let params = search_params();
        assert_eq!(normalize_arguments(None, &params).unwrap(), json!({}));
        assert_eq!(
            normalize_arguments(Some(Value::Null), &params).unwrap(),
            json!({})
        );
    }

    #[test]
    fn test_normalize_positional() {
        let params = search_params();
        let normalized =
            normalize_arguments(Some(json!(["rust", 5])), &params).unwrap();
        assert_eq!(normalized, json!({"query": "rust", "limit": 5}));

        let overflow = normalize_arguments(Some(json!(["a", 1, "extra"])), &params);
        assert!(overflow.is_err());
    }

    #[test]
    fn test_normalize_bare_scalar() {
        let params = search_params();
        let normalized = normalize_arguments(Some(json!("rust")), &params).unwrap();
        assert_eq!(normalized, json!({"query": "rust"}));

        let no_params = normalize_arguments(Some(json!("x")), &[]);
        assert!(no_params.is_err());
    }

    #[test]
    fn test_normalize_generic_placeholders() {
        let params = search_params();
        let normalized =
            normalize_arguments(Some(json!({"__arg1": "rust", "__arg2": 3})), &params).unwrap();
        assert_eq!(normalized, json!({"query": "rust", "limit": 3}));
    }

    #[test]
    fn test_normalize_generic_merges_real_keys() {
        let params = search_params();
        let normalized =
            normalize_arguments(Some(json!({"query": "rust", "__arg1": 9})), &params).unwrap();
        assert_eq!(normalized, json!({"query": "rust", "limit": 9}));
    }

    #[test]
    fn test_normalize_generic_overflow() {
        let params = search_params();
        let err = normalize_arguments(
            Some(json!({"__arg1": 1, "__arg2": 2, "__arg3": 3})),
            &params,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Too many generic arguments"));
    }

    #[test]
    fn test_normalize_keyword_passthrough_is_idempotent() {
        let params = search_params();
        let keyword = json!({"query": "rust"});

        let first = normalize_arguments(Some(keyword.clone()), &params).unwrap();
        assert_eq!(first, keyword);
        let second = normalize_arguments(Some(first), &params).unwrap();
        assert_eq!(second, keyword);
    }

    #[test]
    fn test_normalize_conventions_converge() {
        let params = search_params();
        let expected = json!({"query": "rust"});

        for form in [json!("rust"), json!(["rust"]), json!({"__arg1": "rust"})] {
            assert_eq!(normalize_arguments(Some(form), &params).unwrap(), expected);
        }
    }

    #[test]
    fn test_augmented_description() {
        let tool = RemoteTool {
            name: "search".into(),
            description: "Search the index".into(),
            server: "files".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "search text"}
                },
                "required": ["query"]
            }),
            output_schema: None,
        };
        let params = params_from_schema(&tool.input_schema);
        let description = augment_description(&tool, &params);

        assert!(description.starts_with("[MCP files] Search the index"));
        assert!(description.contains("- query (string, required): search text"));
    }

    #[test]
    fn test_overlapping_tool_names_stay_distinct() {
        let runner = Arc::new(Runner::new().unwrap());
        let manager = Arc::new(tokio::sync::Mutex::new(SessionManager::new(
            SessionConfig::default(),
        )));

        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        });
        let tools = ["alpha", "beta"]
            .into_iter()
            .map(|server| RemoteTool {
                name: "search".into(),
                description: "Search".into(),
                server: server.into(),
                input_schema: schema.clone(),
                output_schema: None,
            })
            .collect();

        let callables = build_callables(tools, manager, runner, Duration::from_secs(1));
        let names: std::collections::HashSet<&str> =
            callables.iter().map(|tool| tool.name()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains("mcp_alpha_search"));
        assert!(names.contains("mcp_beta_search"));
    }

    #[test]
    fn test_bridged_names_and_failure_envelope() {
        let runner = Arc::new(Runner::new().unwrap());
        let manager = Arc::new(tokio::sync::Mutex::new(SessionManager::new(
            SessionConfig::default(),
        )));

        let tools = vec![RemoteTool {
            name: "read_file".into(),
            description: "Read a file".into(),
            server: "files".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
            output_schema: None,
        }];

        let callables = build_callables(tools, manager, runner, Duration::from_secs(1));
        assert_eq!(callables.len(), 1);
        assert_eq!(callables[0].name(), "mcp_files_read_file");
        assert_eq!(callables[0].remote_name(), "read_file");

        // No session for this server, so the call comes back as an
        // envelope failure rather than an error.
        let outcome = callables[0].call(Some(json!("/tmp/a.txt")));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not connected"));
    }
}
