//! Tool call execution.
//!
//! Two entry points share the same dispatch:
//!
//! - [`ToolExecutor::execute`] runs a model-issued call by function name
//!   against a [`ToolCatalog`].
//! - [`ToolExecutor::forward`] runs a gateway request that was already matched
//!   to a route, proxying remote tools transparently.
//!
//! Local tools go through the handler bound at compile time, guarded by an
//! optional per-application allow-list. A remote call by name is a `POST` with
//! a JSON body or a `GET` with a query string, chosen by the operation's
//! body-vs-query flag, sent to the rendered route template with the tool's
//! custom headers. Gateway requests keep their inbound method.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use serde_json::{Map, Value};
use url::Url;

use super::matcher::RouteMatch;
use super::{
    Endpoint, LocalHandler, RemoteEndpoint, SchemaDetail, ToolCallRequest, ToolCallResult,
    ToolCatalog, ToolError, ToolOutput,
};

/// Headers that describe a single connection and are never relayed.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Functions one application may call on platform tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationScope {
    pub application_id: String,
    pub allowed_functions: HashSet<String>,
}

impl ApplicationScope {
    pub fn new<I, S>(application_id: impl Into<String>, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            application_id: application_id.into(),
            allowed_functions: functions.into_iter().map(Into::into).collect(),
        }
    }

    /// Entries may name the namespaced operation id or the bare function id.
    pub fn allows(&self, operation_id: &str, function_id: &str) -> bool {
        self.allowed_functions.contains(operation_id) || self.allowed_functions.contains(function_id)
    }
}

/// Source of application allow-lists.
#[async_trait]
pub trait AllowListProvider: Send + Sync + std::fmt::Debug {
    async fn scope_for(&self, application_id: &str) -> anyhow::Result<ApplicationScope>;
}

/// Allow-lists from configuration. Unknown applications get an empty list.
#[derive(Debug, Clone, Default)]
pub struct StaticAllowLists {
    lists: Arc<HashMap<String, HashSet<String>>>,
}

impl StaticAllowLists {
    pub fn new(lists: &HashMap<String, Vec<String>>) -> Self {
        Self {
            lists: Arc::new(
                lists
                    .iter()
                    .map(|(app, fns)| (app.clone(), fns.iter().cloned().collect()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl AllowListProvider for StaticAllowLists {
    async fn scope_for(&self, application_id: &str) -> anyhow::Result<ApplicationScope> {
        Ok(ApplicationScope {
            application_id: application_id.to_string(),
            allowed_functions: self.lists.get(application_id).cloned().unwrap_or_default(),
        })
    }
}

/// Model-issued arguments split into plain fields and an explicit body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArguments {
    pub fields: Map<String, Value>,
    pub body: Option<Value>,
}

impl CallArguments {
    /// Lift nested `parameters` to the top level and keep `requestBody` apart.
    pub fn from_value(arguments: &Value) -> Self {
        let Value::Object(map) = arguments else {
            return Self {
                fields: Map::new(),
                body: (!arguments.is_null()).then(|| arguments.clone()),
            };
        };

        let mut fields = Map::new();
        let mut body = None;
        let mut nested = None;
        for (key, value) in map {
            match key.as_str() {
                "requestBody" => body = Some(value.clone()),
                "parameters" if value.is_object() => nested = Some(value),
                _ => {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(Value::Object(nested)) = nested {
            for (key, value) in nested {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        Self { fields, body }
    }

    /// Single object for local handlers: body entries, then fields.
    pub fn merged(self) -> Value {
        let mut out = match self.body {
            Some(Value::Object(body)) => body,
            Some(Value::Null) | None => Map::new(),
            Some(other) => Map::from_iter([("requestBody".to_string(), other)]),
        };
        out.extend(self.fields);
        Value::Object(out)
    }
}

/// An inbound gateway request, reduced to what forwarding needs.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

/// Upstream response relayed to the gateway caller.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum GatewayOutcome {
    Local(ToolCallResult),
    Proxied(ProxiedResponse),
}

/// Performs resolved tool calls.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutor {
    http: reqwest::Client,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a call by function name against the turn's catalog.
    pub async fn execute(
        &self,
        catalog: &ToolCatalog,
        call: &ToolCallRequest,
        scope: Option<&ApplicationScope>,
    ) -> Result<ToolCallResult, ToolError> {
        let detail = catalog
            .find(&call.function)
            .ok_or_else(|| ToolError::FunctionNotFound(call.function.clone()))?;
        self.execute_on(detail, call, scope).await
    }

    /// Run a call against one compiled tool.
    pub async fn execute_on(
        &self,
        detail: &SchemaDetail,
        call: &ToolCallRequest,
        scope: Option<&ApplicationScope>,
    ) -> Result<ToolCallResult, ToolError> {
        let args = CallArguments::from_value(&call.arguments);
        match &detail.endpoint {
            Endpoint::Local(handlers) => {
                let handler = handlers
                    .get(&call.function)
                    .ok_or_else(|| ToolError::FunctionNotFound(call.function.clone()))?;
                invoke_local(handler, &call.function, args.merged(), scope).await
            }
            Endpoint::Remote(remote) => self.call_remote(detail, remote, &call.function, args).await,
        }
    }

    async fn call_remote(
        &self,
        detail: &SchemaDetail,
        remote: &RemoteEndpoint,
        function: &str,
        args: CallArguments,
    ) -> Result<ToolCallResult, ToolError> {
        let route = detail
            .route_for(function)
            .ok_or_else(|| ToolError::FunctionNotFound(function.to_string()))?;

        let CallArguments { mut fields, body } = args;
        let path = route
            .template
            .render(|name| fields.remove(name).and_then(|v| scalar_to_string(&v)))
            .map_err(|parameter| ToolError::ParameterMissing {
                function: function.to_string(),
                parameter,
            })?;

        let mut url = parse_target(&remote.base_url, &path)?;
        let sends_body = detail.sends_body(function);
        let method = if sends_body { Method::POST } else { Method::GET };

        let mut headers = HeaderMap::new();
        if sends_body {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers.extend(remote.headers.clone());

        let payload = if sends_body {
            let payload = body.unwrap_or(Value::Object(fields));
            Some(serde_json::to_vec(&payload).map_err(anyhow::Error::from)?)
        } else {
            if let Some(Value::Object(extra)) = body {
                for (key, value) in extra {
                    fields.entry(key).or_insert(value);
                }
            }
            append_query(&mut url, &fields);
            None
        };

        let mut request = self.http.request(method.clone(), url.clone()).headers(headers);
        if let Some(payload) = payload {
            request = request.body(payload);
        }

        tracing::info!(
            tool_id = %detail.tool_id,
            function = %function,
            method = %method,
            path = %url.path(),
            body_mode = sends_body,
            "Calling remote tool"
        );

        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis();

        if !status.is_success() {
            tracing::warn!(
                tool_id = %detail.tool_id,
                function = %function,
                status = status.as_u16(),
                elapsed_ms = %elapsed_ms,
                "Remote tool returned an error status"
            );
            return Err(ToolError::upstream(status));
        }

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_json_content_type);
        let bytes = response.bytes().await?;

        let output = if is_json {
            serde_json::from_slice(&bytes).map_or_else(
                |_| ToolOutput::Text(String::from_utf8_lossy(&bytes).into_owned()),
                ToolOutput::Json,
            )
        } else {
            ToolOutput::Text(String::from_utf8_lossy(&bytes).into_owned())
        };

        tracing::debug!(
            tool_id = %detail.tool_id,
            function = %function,
            elapsed_ms = %elapsed_ms,
            response_bytes = bytes.len(),
            "Remote tool call succeeded"
        );

        Ok(ToolCallResult::send_to_llm(output))
    }

    /// Run a gateway request already matched to `matched`.
    pub async fn forward(
        &self,
        detail: &SchemaDetail,
        matched: &RouteMatch,
        inbound: InboundRequest,
        scope: Option<&ApplicationScope>,
    ) -> Result<GatewayOutcome, ToolError> {
        match &detail.endpoint {
            Endpoint::Local(handlers) => {
                let handler = handlers
                    .get(&matched.operation_id)
                    .ok_or_else(|| ToolError::FunctionNotFound(matched.operation_id.clone()))?;

                let mut args = inbound_body_object(&inbound)?;
                args.extend(matched.path_object());
                args.extend(matched.query_object());

                let result =
                    invoke_local(handler, &matched.operation_id, Value::Object(args), scope).await?;
                Ok(GatewayOutcome::Local(result))
            }
            Endpoint::Remote(remote) => {
                let response = self.proxy(detail, remote, matched, inbound).await?;
                Ok(GatewayOutcome::Proxied(response))
            }
        }
    }

    async fn proxy(
        &self,
        detail: &SchemaDetail,
        remote: &RemoteEndpoint,
        matched: &RouteMatch,
        inbound: InboundRequest,
    ) -> Result<ProxiedResponse, ToolError> {
        let route = detail
            .route_for(&matched.operation_id)
            .ok_or_else(|| ToolError::FunctionNotFound(matched.operation_id.clone()))?;
        let path = route
            .template
            .render_raw(|name| matched.raw_path_params.get(name).cloned())
            .map_err(|parameter| ToolError::ParameterMissing {
                function: matched.operation_id.clone(),
                parameter,
            })?;

        let mut url = parse_target(&remote.base_url, &path)?;
        if let Some(query) = inbound.query.as_deref().filter(|q| !q.is_empty()) {
            url.set_query(Some(query));
        }

        let mut request = self
            .http
            .request(inbound.method.clone(), url.clone())
            .headers(remote.headers.clone());

        let content_type = inbound
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        if !inbound.body.is_empty() {
            request = match content_type.as_deref() {
                Some(ct) if is_json_content_type(ct) => {
                    let value: Value = serde_json::from_slice(&inbound.body)
                        .map_err(|e| anyhow::anyhow!("invalid JSON body: {e}"))?;
                    let bytes = serde_json::to_vec(&value).map_err(anyhow::Error::from)?;
                    request
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(bytes)
                }
                Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
                    let form = url::form_urlencoded::parse(&inbound.body).fold(
                        reqwest::multipart::Form::new(),
                        |form, (k, v)| form.text(k.into_owned(), v.into_owned()),
                    );
                    request.multipart(form)
                }
                Some(ct) if ct.starts_with("multipart/") => {
                    // Original value keeps the boundary's case.
                    let original = inbound.headers.get(header::CONTENT_TYPE).cloned();
                    let mut request = request.body(inbound.body.clone());
                    if let Some(original) = original {
                        request = request.header(header::CONTENT_TYPE, original);
                    }
                    request
                }
                other => {
                    let text = String::from_utf8_lossy(&inbound.body).into_owned();
                    request
                        .header(header::CONTENT_TYPE, other.unwrap_or("text/plain"))
                        .body(text)
                }
            };
        }

        tracing::info!(
            tool_id = %detail.tool_id,
            operation_id = %matched.operation_id,
            method = %inbound.method,
            path = %url.path(),
            "Proxying gateway request"
        );

        let response = request.send().await?;
        let status = response.status();
        let headers = relay_headers(response.headers());
        let body = response.bytes().await?;

        tracing::debug!(
            tool_id = %detail.tool_id,
            status = status.as_u16(),
            response_bytes = body.len(),
            "Upstream responded"
        );

        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }
}

async fn invoke_local(
    handler: &LocalHandler,
    operation_id: &str,
    args: Value,
    scope: Option<&ApplicationScope>,
) -> Result<ToolCallResult, ToolError> {
    if let Some(scope) = scope {
        if !scope.allows(operation_id, &handler.function_id) {
            tracing::warn!(
                application_id = %scope.application_id,
                function = %operation_id,
                "Platform function not in application allow-list"
            );
            return Err(ToolError::Forbidden {
                function: operation_id.to_string(),
                application: scope.application_id.clone(),
            });
        }
    }

    tracing::info!(
        tool_id = %handler.tool.id(),
        function = %handler.function_id,
        mode = handler.mode.as_str(),
        "Invoking platform tool"
    );

    let value = handler.tool.call(&handler.function_id, args).await?;
    Ok(ToolCallResult {
        output: ToolOutput::Json(value),
        mode: handler.mode,
    })
}

fn inbound_body_object(inbound: &InboundRequest) -> Result<Map<String, Value>, ToolError> {
    if inbound.body.is_empty() {
        return Ok(Map::new());
    }
    let content_type = inbound
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return Ok(url::form_urlencoded::parse(&inbound.body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect());
    }

    match serde_json::from_slice::<Value>(&inbound.body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Ok(Map::from_iter([("requestBody".to_string(), other)])),
        Err(e) => Err(anyhow::anyhow!("invalid JSON body: {e}").into()),
    }
}

fn parse_target(base_url: &str, path: &str) -> Result<Url, ToolError> {
    Url::parse(&format!("{base_url}{path}"))
        .map_err(|e| ToolError::Schema(format!("invalid server url '{base_url}': {e}")))
}

fn append_query(url: &mut Url, fields: &Map<String, Value>) {
    if fields.is_empty() {
        return;
    }
    let mut pairs = url.query_pairs_mut();
    for (key, value) in fields {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = scalar_to_string(item) {
                        pairs.append_pair(key, &s);
                    }
                }
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    pairs.append_pair(key, &s);
                }
            }
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Copy upstream headers, dropping connection-scoped ones.
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_nested_parameters_are_lifted() {
        let args = CallArguments::from_value(&json!({
            "userId": "1",
            "parameters": { "limit": 10, "userId": "ignored" },
            "requestBody": { "title": "x" }
        }));
        assert_eq!(args.fields["userId"], "1");
        assert_eq!(args.fields["limit"], 10);
        assert_eq!(args.body, Some(json!({ "title": "x" })));
    }

    #[test]
    fn test_merged_prefers_fields_over_body() {
        let args = CallArguments::from_value(&json!({
            "a": 1,
            "requestBody": { "a": 0, "b": 2 }
        }));
        assert_eq!(args.merged(), json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_scope_accepts_either_id_form() {
        let scope = ApplicationScope::new("app", ["clock__currentTime", "renderTable"]);
        assert!(scope.allows("clock__currentTime", "currentTime"));
        assert!(scope.allows("markdown__renderTable", "renderTable"));
        assert!(!scope.allows("clock__other", "other"));
    }

    #[tokio::test]
    async fn test_static_allow_lists_unknown_app_is_empty() {
        let lists = StaticAllowLists::new(&HashMap::from([(
            "app".to_string(),
            vec!["clock__currentTime".to_string()],
        )]));
        let known = lists.scope_for("app").await.unwrap();
        assert!(known.allowed_functions.contains("clock__currentTime"));
        let unknown = lists.scope_for("other").await.unwrap();
        assert!(unknown.allowed_functions.is_empty());
    }

    #[test]
    fn test_relay_headers_drops_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert("connection", HeaderValue::from_static("keep-alive"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("content-length", HeaderValue::from_static("10"));
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));
        upstream.append("set-cookie", HeaderValue::from_static("a=1"));
        upstream.append("set-cookie", HeaderValue::from_static("b=2"));

        let out = relay_headers(&upstream);
        assert!(out.get("connection").is_none());
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("content-length").is_none());
        assert_eq!(out["x-request-id"], "abc");
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_append_query_repeats_arrays_and_skips_null() {
        let mut url = Url::parse("https://api.example.com/items").unwrap();
        let fields = json!({ "tag": ["a", "b"], "limit": 10, "skip": null, "q": "x y" });
        append_query(&mut url, fields.as_object().unwrap());
        assert_eq!(url.query(), Some("tag=a&tag=b&limit=10&q=x+y"));
    }

    #[test]
    fn test_json_content_type_detection() {
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/problem+json"));
        assert!(!is_json_content_type("text/plain"));
    }
}
