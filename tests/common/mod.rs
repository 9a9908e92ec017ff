//! Shared fixtures for integration tests: a scripted LLM driver, tool
//! records pointing at wiremock origins, and application state wiring.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::json;

use tool_gateway::AppState;
use tool_gateway::config::AppConfig;
use tool_gateway::llm::{EventStream, LlmDriver, LlmRequest, Orchestrator};
use tool_gateway::normalized::NormalizedEvent;
use tool_gateway::tools::{
    AllowListProvider, InMemoryToolStore, PlatformRegistry, SchemaCompiler, StaticAllowLists,
    ToolDefinition, ToolExecutor, ToolResolver, ToolStore,
};

/// One provider round: the events a driver call streams back.
pub type Round = Vec<NormalizedEvent>;

/// Replays canned rounds and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    rounds: Mutex<VecDeque<Round>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedDriver {
    pub fn new(rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmDriver for ScriptedDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        self.requests.lock().unwrap().push(req);
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![NormalizedEvent::Done]);
        Ok(futures::stream::iter(round.into_iter().map(Ok)).boxed())
    }
}

/// Driver whose connection fails before streaming.
#[derive(Debug, Default)]
pub struct RefusingDriver;

#[async_trait::async_trait]
impl LlmDriver for RefusingDriver {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<EventStream> {
        anyhow::bail!("connection refused")
    }
}

/// A complete tool call in the two-phase delta shape.
pub fn tool_call(index: usize, id: &str, name: &str, arguments: &str) -> Vec<NormalizedEvent> {
    vec![
        NormalizedEvent::ToolCallDelta {
            call_index: index,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments_delta: None,
        },
        NormalizedEvent::ToolCallDelta {
            call_index: index,
            id: None,
            name: None,
            arguments_delta: Some(arguments.to_string()),
        },
    ]
}

pub fn text(text: &str) -> NormalizedEvent {
    NormalizedEvent::MessageDelta {
        text: text.to_string(),
    }
}

/// A remote "posts" tool served by `base_url`.
pub fn posts_tool(base_url: &str) -> ToolDefinition {
    serde_json::from_value(json!({
        "id": "posts",
        "name": "Posts API",
        "description": "Blog posts",
        "customHeaders": { "x-api-key": "secret" },
        "schema": {
            "openapi": "3.0.0",
            "servers": [{ "url": base_url }],
            "paths": {
                "/users/{userId}/posts": {
                    "get": {
                        "operationId": "listUserPosts",
                        "parameters": [
                            { "name": "userId", "in": "path", "required": true, "schema": { "type": "string" } },
                            { "name": "limit", "in": "query", "schema": { "type": "integer" } }
                        ]
                    }
                },
                "/posts": {
                    "post": {
                        "operationId": "createPost",
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/NewPost" }
                                }
                            }
                        }
                    }
                },
                "/upload": {
                    "post": { "operationId": "uploadForm" }
                },
                "/status/{code}": {
                    "get": { "operationId": "getStatus" }
                }
            },
            "components": {
                "schemas": {
                    "NewPost": {
                        "type": "object",
                        "properties": { "title": { "type": "string" } }
                    }
                }
            }
        }
    }))
    .expect("valid tool record")
}

/// State over an in-memory catalog, the default platform tools, and `driver`.
pub fn test_state(
    tools: Vec<ToolDefinition>,
    driver: Arc<dyn LlmDriver>,
    applications: HashMap<String, Vec<String>>,
) -> AppState {
    let platform = Arc::new(PlatformRegistry::with_defaults());
    let store: Arc<dyn ToolStore> = Arc::new(InMemoryToolStore::new(tools));
    let executor = ToolExecutor::new();
    let allow_lists: Option<Arc<dyn AllowListProvider>> = if applications.is_empty() {
        None
    } else {
        Some(Arc::new(StaticAllowLists::new(&applications)))
    };

    let mut config = AppConfig::default();
    config.applications = applications;

    AppState {
        resolver: Arc::new(ToolResolver::new(store, Arc::clone(&platform))),
        compiler: Arc::new(SchemaCompiler::new(platform)),
        executor: executor.clone(),
        orchestrator: Arc::new(Orchestrator::with_driver(driver, executor)),
        allow_lists,
        config: Arc::new(config),
    }
}
