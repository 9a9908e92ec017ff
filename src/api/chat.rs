//! `POST /api/chat/tools`: streamed chat with tool calling.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::AppState;
use crate::llm::{ChatSettings, ChatTurn, Message};
use crate::tools::ToolDefinition;

use super::{application_scope, sse::build_sse_response};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolChatRequest {
    #[serde(default)]
    pub chat_settings: ChatSettings,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub selected_tools: Vec<SelectedTool>,
}

/// A tool picked for the turn: a bare id, `{ "id": ... }`, or a full record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SelectedTool {
    Id(String),
    Inline(Box<ToolDefinition>),
    Reference { id: String },
}

pub async fn chat_with_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ToolChatRequest>,
) -> Response {
    let scope = match application_scope(&state, &headers).await {
        Ok(scope) => scope,
        Err(e) => return e.into_response(),
    };

    let mut definitions = Vec::with_capacity(req.selected_tools.len());
    for selected in req.selected_tools {
        let tool_id = match selected {
            SelectedTool::Inline(definition) => {
                definitions.push(*definition);
                continue;
            }
            SelectedTool::Id(id) | SelectedTool::Reference { id } => id,
        };
        match state.resolver.resolve(&tool_id).await {
            Ok(resolved) => definitions.push(resolved.definition),
            Err(e) => {
                tracing::warn!(tool_id = %tool_id, error = %e, "Skipping unresolvable tool");
            }
        }
    }

    let catalog = state.compiler.catalog(definitions.iter());
    tracing::info!(
        tool_count = catalog.details.len(),
        function_count = catalog.functions.len(),
        "Tool catalog compiled for chat turn"
    );

    let stream = state.orchestrator.run(ChatTurn {
        messages: req.messages,
        catalog: Arc::new(catalog),
        settings: req.chat_settings,
        scope,
    });

    build_sse_response(stream).into_response()
}
