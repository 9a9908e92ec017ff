//! In-process ("platform") tools and their immutable registry.
//!
//! Each registered tool gets a synthesized OpenAPI document served from
//! [`LOCAL_EXECUTOR_URL`](super::LOCAL_EXECUTOR_URL), with one `POST
//! /{functionId}` operation per function whose operation id is namespaced as
//! `<toolName>__<functionId>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    LOCAL_EXECUTOR_URL, LocalHandler, PLATFORM_SHARING, ResultProcessingMode, ToolDefinition,
    sanitize_tool_name,
};

/// A tool implemented inside the gateway process.
#[async_trait]
pub trait PlatformTool: Send + Sync + std::fmt::Debug {
    /// Identifier used to address the tool (`/tools/{id}/...`).
    fn id(&self) -> &str;
    /// Namespace for the tool's operation ids.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn functions(&self) -> Vec<PlatformFunction>;
    /// Invoke `function_id` (not namespaced) with merged arguments.
    async fn call(&self, function_id: &str, args: Value) -> anyhow::Result<Value>;
}

/// Declaration of one platform function.
#[derive(Debug, Clone)]
pub struct PlatformFunction {
    pub id: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
    pub mode: ResultProcessingMode,
}

impl PlatformFunction {
    pub fn new(id: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            parameters,
            mode: ResultProcessingMode::SendToLlm,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ResultProcessingMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Built-in tool registry. Constructed at startup and shared read-only.
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    definitions: Arc<Vec<ToolDefinition>>,
    // namespaced operation id -> handler
    handlers: Arc<HashMap<String, LocalHandler>>,
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("tool_count", &self.definitions.len())
            .field("function_count", &self.handlers.len())
            .finish()
    }
}

impl PlatformRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tools shipped in [`builtin`](super::builtin).
    pub fn with_defaults() -> Self {
        Self::new()
            .with_tool(Arc::new(super::builtin::ClockTool))
            .with_tool(Arc::new(super::builtin::MarkdownTableTool))
    }

    pub fn with_tool(self, tool: Arc<dyn PlatformTool>) -> Self {
        let functions = tool.functions();

        let mut paths = serde_json::Map::new();
        let mut handlers = (*self.handlers).clone();
        for function in &functions {
            let operation_id = Self::namespaced(tool.name(), &function.id);
            paths.insert(
                format!("/{}", function.id),
                json!({
                    "post": {
                        "operationId": operation_id,
                        "description": function.description,
                        "requestBody": {
                            "content": {
                                "application/json": { "schema": function.parameters }
                            }
                        },
                        "x-result-processing-mode": function.mode.as_str(),
                    }
                }),
            );
            handlers.insert(
                operation_id,
                LocalHandler {
                    tool: Arc::clone(&tool),
                    function_id: function.id.clone(),
                    mode: function.mode,
                },
            );
        }

        let definition = ToolDefinition {
            id: tool.id().to_string(),
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            schema: json!({
                "openapi": "3.0.0",
                "info": { "title": tool.name(), "version": "1.0.0" },
                "servers": [{ "url": LOCAL_EXECUTOR_URL }],
                "paths": paths,
            }),
            custom_headers: BTreeMap::new(),
            sharing: Some(PLATFORM_SHARING.to_string()),
        };

        tracing::debug!(
            tool_id = %definition.id,
            function_count = functions.len(),
            "Registered platform tool"
        );

        let mut definitions = (*self.definitions).clone();
        definitions.retain(|d| d.id != definition.id);
        definitions.push(definition);

        Self {
            definitions: Arc::new(definitions),
            handlers: Arc::new(handlers),
        }
    }

    /// `<toolName>__<functionId>`, restricted to model-safe characters.
    pub fn namespaced(tool_name: &str, function_id: &str) -> String {
        sanitize_tool_name(&format!("{tool_name}__{function_id}"))
    }

    pub fn find(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.definitions.iter().find(|d| d.id == tool_id)
    }

    pub fn handler(&self, operation_id: &str) -> Option<&LocalHandler> {
        self.handlers.get(operation_id)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }
}
