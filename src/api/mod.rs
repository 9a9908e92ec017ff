pub mod chat;
pub mod gateway;
pub mod sse;

use axum::{
    Json, Router,
    http::HeaderMap,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::tools::{ApplicationScope, ToolError};

/// Header naming the calling application for allow-list checks.
pub const APPLICATION_ID_HEADER: &str = "x-application-id";

pub fn router() -> Router<AppState> {
    let gateway = get(gateway::handle_tool_request)
        .post(gateway::handle_tool_request)
        .put(gateway::handle_tool_request)
        .patch(gateway::handle_tool_request)
        .delete(gateway::handle_tool_request);

    Router::new()
        .route("/health", get(health))
        .route("/api/chat/tools", post(chat::chat_with_tools))
        .route("/api/tools/{tool_id}/functions", get(gateway::list_functions))
        .route("/tools", gateway.clone())
        .route("/tools/{*rest}", gateway)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Allow-list scope for the calling application, when one is named and
/// allow-lists are configured.
pub async fn application_scope(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<ApplicationScope>, ToolError> {
    let Some(provider) = state.allow_lists.as_ref() else {
        return Ok(None);
    };
    let Some(application_id) = headers
        .get(APPLICATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return Ok(None);
    };
    Ok(Some(provider.scope_for(application_id).await?))
}
