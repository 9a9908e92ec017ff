//! `/tools/{toolId}/{...path}`: the tool gateway.
//!
//! The first segment picks the tool; the rest is matched against the tool's
//! route table. Platform tools answer with their JSON result, remote tools are
//! proxied and the upstream response is relayed as-is.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::tools::executor::{GatewayOutcome, InboundRequest};
use crate::tools::matcher::split_segments;
use crate::tools::{RouteMatcher, ToolError};

use super::application_scope;

/// Response header naming how the caller should treat a platform result.
pub const RESULT_MODE_HEADER: &str = "x-result-processing-mode";

const GATEWAY_PREFIX: &str = "/tools";

pub async fn handle_tool_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ToolError> {
    let path = uri
        .path()
        .strip_prefix(GATEWAY_PREFIX)
        .unwrap_or_else(|| uri.path());
    let segments = split_segments(path);
    let [raw_tool_id, rest @ ..] = segments.as_slice() else {
        return Err(bad_path(path));
    };
    if rest.is_empty() {
        return Err(bad_path(path));
    }

    let tool_id = urlencoding::decode(raw_tool_id)
        .map_err(|e| ToolError::BadRequest(format!("invalid tool id {raw_tool_id}: {e}")))?
        .into_owned();
    let scope = application_scope(&state, &headers).await?;

    tracing::info!(
        tool_id = %tool_id,
        method = %method,
        path = %path,
        application_id = ?scope.as_ref().map(|s| s.application_id.as_str()),
        "Gateway request"
    );

    let resolved = state.resolver.resolve(&tool_id).await?;
    let compiled = state.compiler.compile(&resolved.definition)?;
    let detail = compiled.detail;

    let matched = RouteMatcher::new(&detail.routes)
        .find(&method, rest, uri.query())
        .ok_or_else(|| ToolError::RouteNotFound {
            method: method.to_string(),
            path: format!("/{}", rest.join("/")),
        })?;

    tracing::debug!(
        tool_id = %tool_id,
        operation_id = %matched.operation_id,
        template = %matched.template,
        is_platform = resolved.is_platform,
        "Route matched"
    );

    let inbound = InboundRequest {
        method,
        headers,
        query: uri.query().map(ToString::to_string),
        body,
    };

    match state
        .executor
        .forward(&detail, &matched, inbound, scope.as_ref())
        .await?
    {
        GatewayOutcome::Local(result) => {
            let mode = result.mode;
            let mut response = Json(result.output.into_value()).into_response();
            response.headers_mut().insert(
                HeaderName::from_static(RESULT_MODE_HEADER),
                HeaderValue::from_static(mode.as_str()),
            );
            Ok(response)
        }
        GatewayOutcome::Proxied(proxied) => {
            let mut response = Response::new(Body::from(proxied.body));
            *response.status_mut() = proxied.status;
            *response.headers_mut() = proxied.headers;
            Ok(response)
        }
    }
}

/// `GET /api/tools/{toolId}/functions`
pub async fn list_functions(
    State(state): State<AppState>,
    Path(tool_id): Path<String>,
) -> Result<Json<Value>, ToolError> {
    let resolved = state.resolver.resolve(&tool_id).await?;
    let compiled = state.compiler.compile(&resolved.definition)?;

    let functions: Vec<Value> = compiled
        .functions
        .iter()
        .map(crate::tools::FunctionSpec::to_openai_tool)
        .collect();

    Ok(Json(json!({
        "toolId": compiled.detail.tool_id,
        "name": compiled.detail.tool_name,
        "isPlatform": resolved.is_platform,
        "routes": compiled.detail.route_map(),
        "functions": functions,
    })))
}

fn bad_path(path: &str) -> ToolError {
    ToolError::BadRequest(format!(
        "expected /tools/{{toolId}}/{{path}}, got {GATEWAY_PREFIX}{path}"
    ))
}
