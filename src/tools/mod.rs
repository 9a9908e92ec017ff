//! Tool definitions, compiled schemas, and the dispatch pipeline.
//!
//! A tool is an OpenAPI-shaped document. The [`compiler`] turns one document
//! into a [`SchemaDetail`] (dispatch endpoint, route table, body-vs-query map)
//! plus a list of [`FunctionSpec`]s the model can call. The [`matcher`] maps
//! concrete requests back onto the route table, the [`resolver`] finds tool
//! records, and the [`executor`] performs calls against local handlers or
//! remote origins.

pub mod builtin;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod platform;
pub mod resolver;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use compiler::{BodyPolicy, DefaultBodyPolicy, SchemaCompiler};
pub use error::ToolError;
pub use executor::{AllowListProvider, ApplicationScope, StaticAllowLists, ToolExecutor};
pub use matcher::{PathTemplate, RouteEntry, RouteMatch, RouteMatcher};
pub use platform::{PlatformFunction, PlatformRegistry, PlatformTool};
pub use resolver::{ResolvedTool, ToolResolver};
pub use store::{FileToolStore, InMemoryToolStore, ToolStore};

/// Server URL that marks a schema as served by in-process handlers.
pub const LOCAL_EXECUTOR_URL: &str = "local://executor";

/// `sharing` value carried by built-in tools.
pub const PLATFORM_SHARING: &str = "platform";

/// A tool record as stored by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Tool identifier (used in `/tools/{toolId}/...`).
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Raw OpenAPI-shaped document. Accepts an object or a JSON/YAML string.
    #[serde(deserialize_with = "deserialize_schema")]
    pub schema: Value,
    /// Static headers forwarded with every outbound call.
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub custom_headers: BTreeMap<String, String>,
    /// Origin marker; `"platform"` for built-ins.
    #[serde(default)]
    pub sharing: Option<String>,
}

impl ToolDefinition {
    /// `servers[0].url` of the schema, if declared.
    pub fn server_url(&self) -> Option<&str> {
        self.schema
            .pointer("/servers/0/url")
            .and_then(Value::as_str)
    }

    /// Whether this record describes an in-process tool.
    pub fn is_platform(&self) -> bool {
        self.sharing.as_deref() == Some(PLATFORM_SHARING)
            || self.server_url() == Some(LOCAL_EXECUTOR_URL)
    }
}

fn parse_document(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw)
        .or_else(|_| serde_yaml::from_str::<Value>(raw))
        .map_err(|e| format!("schema is neither JSON nor YAML: {e}"))
}

fn deserialize_schema<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(raw) => parse_document(&raw).map_err(serde::de::Error::custom),
        other => Ok(other),
    }
}

fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(BTreeMap::new()),
        Value::String(raw) if raw.trim().is_empty() => return Ok(BTreeMap::new()),
        Value::String(raw) => parse_document(&raw).map_err(serde::de::Error::custom)?,
        other => other,
    };

    let Value::Object(map) = value else {
        return Err(serde::de::Error::custom("customHeaders must be an object"));
    };

    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

/// How a tool result is handled by the streaming orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultProcessingMode {
    /// Fold the result back into the conversation for another model turn.
    #[default]
    SendToLlm,
    /// Terminal: show the result directly and skip further generation.
    RenderMarkdown,
}

impl ResultProcessingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendToLlm => "send_to_llm",
            Self::RenderMarkdown => "render_markdown",
        }
    }
}

/// Raw output of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Json(Value),
    Text(String),
}

impl ToolOutput {
    /// Textual form sent to the model or rendered to the user.
    pub fn to_content(&self) -> String {
        match self {
            Self::Text(s) | Self::Json(Value::String(s)) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Json(v) => v,
            Self::Text(s) => Value::String(s),
        }
    }
}

/// Outcome of one tool invocation. Always carries a mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(rename = "result")]
    pub output: ToolOutput,
    #[serde(rename = "resultProcessingMode")]
    pub mode: ResultProcessingMode,
}

impl ToolCallResult {
    pub fn send_to_llm(output: ToolOutput) -> Self {
        Self {
            output,
            mode: ResultProcessingMode::SendToLlm,
        }
    }
}

/// A function name plus its JSON arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub function: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(function: impl Into<String>, arguments: Value) -> Self {
        Self {
            function: function.into(),
            arguments,
        }
    }

    /// Build from the raw argument string a model produced.
    ///
    /// Empty or invalid JSON yields an empty object.
    pub fn from_json_arguments(function: impl Into<String>, raw: &str) -> Self {
        let function = function.into();
        let arguments = if raw.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::warn!(function = %function, error = %e, "Tool arguments are not valid JSON");
                Value::Object(serde_json::Map::new())
            })
        };
        Self {
            function,
            arguments,
        }
    }
}

/// Where an OpenAPI parameter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

impl ParamLocation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            "body" => Some(Self::Body),
            _ => None,
        }
    }
}

/// One declared parameter of a [`FunctionSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionParameter {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    /// JSON-schema `type` (defaults to `string`).
    pub schema_type: String,
    /// Full parameter schema with local `$ref`s inlined.
    pub schema: Value,
    pub description: Option<String>,
}

/// A callable derived from one OpenAPI operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub operation_id: String,
    pub description: String,
    pub method: Method,
    pub path: String,
    pub parameters: Vec<FunctionParameter>,
    pub response_schema: Option<Value>,
}

impl FunctionSpec {
    /// Render as an OpenAI-style `function` tool.
    ///
    /// The request body, when present, is exposed as a single `requestBody`
    /// argument to keep the schema flat.
    pub fn to_openai_tool(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut schema = param.schema.clone();
            if let (Some(desc), Value::Object(obj)) = (&param.description, &mut schema) {
                obj.entry("description")
                    .or_insert_with(|| Value::String(desc.clone()));
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.operation_id,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}

/// An in-process handler bound to one operation.
#[derive(Debug, Clone)]
pub struct LocalHandler {
    pub tool: Arc<dyn PlatformTool>,
    /// Function id within the tool (not namespaced).
    pub function_id: String,
    pub mode: ResultProcessingMode,
}

/// A proxied origin.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    /// `servers[0].url` without a trailing slash.
    pub base_url: String,
    /// The tool's custom headers.
    pub headers: HeaderMap,
}

/// Dispatch target of a compiled tool, resolved once at compile time.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Operation id → handler.
    Local(HashMap<String, LocalHandler>),
    Remote(RemoteEndpoint),
}

/// Per-tool compiled artifact.
#[derive(Debug, Clone)]
pub struct SchemaDetail {
    pub tool_id: String,
    pub tool_name: String,
    pub endpoint: Endpoint,
    /// Route table in declaration order.
    pub routes: Vec<RouteEntry>,
    /// Operation id → send arguments as a JSON body.
    pub body_mode: HashMap<String, bool>,
    pub custom_headers: BTreeMap<String, String>,
}

impl SchemaDetail {
    /// Route bound to an operation id (exact lookup).
    pub fn route_for(&self, operation_id: &str) -> Option<&RouteEntry> {
        RouteMatcher::new(&self.routes).lookup(operation_id)
    }

    pub fn sends_body(&self, operation_id: &str) -> bool {
        self.body_mode.get(operation_id).copied().unwrap_or(false)
    }

    /// `:name`-keyed template → operation id.
    pub fn route_map(&self) -> BTreeMap<String, String> {
        self.routes
            .iter()
            .map(|r| (r.template.matcher_key(), r.operation_id.clone()))
            .collect()
    }
}

/// Compiler output for one tool.
#[derive(Debug, Clone)]
pub struct CompiledTool {
    pub detail: SchemaDetail,
    pub functions: Vec<FunctionSpec>,
}

/// Flat function catalog for one conversation turn.
///
/// Name collisions across tools are not deduplicated; the first tool that
/// declares a function wins at dispatch.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    pub details: Vec<SchemaDetail>,
    pub functions: Vec<FunctionSpec>,
}

impl ToolCatalog {
    pub fn push(&mut self, compiled: CompiledTool) {
        self.functions.extend(compiled.functions);
        self.details.push(compiled.detail);
    }

    /// The schema whose route table contains `function`.
    pub fn find(&self, function: &str) -> Option<&SchemaDetail> {
        self.details
            .iter()
            .find(|d| d.route_for(function).is_some())
    }

    pub fn openai_tools(&self) -> Vec<Value> {
        self.functions.iter().map(FunctionSpec::to_openai_tool).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Restrict a name to `[A-Za-z0-9_-]`, the character set model APIs accept.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
