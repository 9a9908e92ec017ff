//! OpenAPI document → function catalog + route table.
//!
//! The compiler is forgiving: a document without a `paths` object is
//! rejected, but individual operations that cannot be understood are skipped
//! with a warning so the rest of the tool stays usable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Value, json};

use super::matcher::{PathTemplate, RouteEntry, Segment};
use super::platform::PlatformRegistry;
use super::{
    CompiledTool, Endpoint, FunctionParameter, FunctionSpec, LOCAL_EXECUTOR_URL, ParamLocation,
    RemoteEndpoint, SchemaDetail, ToolCatalog, ToolDefinition, ToolError, sanitize_tool_name,
};

/// Maximum number of `$ref` hops followed from one location.
pub const MAX_REF_DEPTH: usize = 16;

const HTTP_METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Decides whether an operation's arguments travel as a JSON body or as a
/// query string.
pub trait BodyPolicy: Send + Sync + std::fmt::Debug {
    fn sends_body(&self, method: &Method, operation: &Value) -> bool;
}

/// `x-arguments-in: body|query` wins when present. Otherwise a declared
/// `requestBody` or a POST/PUT/PATCH method selects the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBodyPolicy;

impl BodyPolicy for DefaultBodyPolicy {
    fn sends_body(&self, method: &Method, operation: &Value) -> bool {
        match operation.get("x-arguments-in").and_then(Value::as_str) {
            Some("body") => return true,
            Some("query") => return false,
            Some(other) => {
                tracing::warn!(value = %other, "Ignoring unknown x-arguments-in value");
            }
            None => {}
        }

        operation.get("requestBody").is_some()
            || matches!(*method, Method::POST | Method::PUT | Method::PATCH)
    }
}

/// Compiles tool definitions into dispatchable artifacts.
#[derive(Debug, Clone)]
pub struct SchemaCompiler {
    policy: Arc<dyn BodyPolicy>,
    platform: Arc<PlatformRegistry>,
}

impl SchemaCompiler {
    pub fn new(platform: Arc<PlatformRegistry>) -> Self {
        Self {
            policy: Arc::new(DefaultBodyPolicy),
            platform,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn BodyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Compile every definition into one flat catalog, skipping documents
    /// that fail to compile.
    pub fn catalog<'a, I>(&self, definitions: I) -> ToolCatalog
    where
        I: IntoIterator<Item = &'a ToolDefinition>,
    {
        let mut catalog = ToolCatalog::default();
        for definition in definitions {
            match self.compile(definition) {
                Ok(compiled) => catalog.push(compiled),
                Err(e) => {
                    tracing::warn!(tool_id = %definition.id, error = %e, "Skipping tool that failed to compile");
                }
            }
        }
        catalog
    }

    pub fn compile(&self, definition: &ToolDefinition) -> Result<CompiledTool, ToolError> {
        let doc = &definition.schema;
        let paths = doc
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| ToolError::Schema(format!("tool '{}' has no paths object", definition.id)))?;

        let local = match definition.server_url() {
            Some(LOCAL_EXECUTOR_URL) => true,
            Some(_) => false,
            None if definition.is_platform() => true,
            None => {
                return Err(ToolError::Schema(format!(
                    "tool '{}' declares no servers",
                    definition.id
                )));
            }
        };

        let mut handlers = HashMap::new();
        let mut routes = Vec::new();
        let mut body_mode = HashMap::new();
        let mut functions = Vec::new();
        let mut seen = HashSet::new();

        for (path, item) in paths {
            let Some(item) = item.as_object() else {
                tracing::warn!(tool_id = %definition.id, path = %path, "Skipping non-object path item");
                continue;
            };
            let template = match PathTemplate::parse(path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(tool_id = %definition.id, path = %path, error = %e, "Skipping path");
                    continue;
                }
            };
            let shared_params = item.get("parameters");

            for (key, operation) in item {
                let lower = key.to_ascii_lowercase();
                if !HTTP_METHODS.contains(&lower.as_str()) {
                    continue;
                }
                let Ok(method) = Method::from_bytes(lower.to_ascii_uppercase().as_bytes()) else {
                    continue;
                };

                let function = match self.compile_operation(doc, &template, &method, operation, shared_params) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(
                            tool_id = %definition.id,
                            path = %path,
                            method = %method,
                            error = %e,
                            "Skipping operation"
                        );
                        continue;
                    }
                };

                if !seen.insert(function.operation_id.clone()) {
                    tracing::warn!(
                        tool_id = %definition.id,
                        operation_id = %function.operation_id,
                        path = %path,
                        "Skipping duplicate operation id"
                    );
                    continue;
                }

                if local {
                    let Some(handler) = self.platform.handler(&function.operation_id) else {
                        tracing::warn!(
                            tool_id = %definition.id,
                            operation_id = %function.operation_id,
                            "No platform handler for local operation"
                        );
                        continue;
                    };
                    handlers.insert(function.operation_id.clone(), handler.clone());
                }

                body_mode.insert(
                    function.operation_id.clone(),
                    self.policy.sends_body(&method, operation),
                );
                routes.push(RouteEntry {
                    template: template.clone(),
                    method,
                    operation_id: function.operation_id.clone(),
                });
                functions.push(function);
            }
        }

        let endpoint = if local {
            Endpoint::Local(handlers)
        } else {
            Endpoint::Remote(RemoteEndpoint {
                base_url: definition
                    .server_url()
                    .unwrap_or_default()
                    .trim_end_matches('/')
                    .to_string(),
                headers: header_map(&definition.id, &definition.custom_headers),
            })
        };

        tracing::debug!(
            tool_id = %definition.id,
            local,
            route_count = routes.len(),
            "Compiled tool schema"
        );

        Ok(CompiledTool {
            detail: SchemaDetail {
                tool_id: definition.id.clone(),
                tool_name: definition.name.clone(),
                endpoint,
                routes,
                body_mode,
                custom_headers: definition.custom_headers.clone(),
            },
            functions,
        })
    }

    fn compile_operation(
        &self,
        doc: &Value,
        template: &PathTemplate,
        method: &Method,
        operation: &Value,
        shared_params: Option<&Value>,
    ) -> Result<FunctionSpec, ToolError> {
        if !operation.is_object() {
            return Err(ToolError::Schema("operation is not an object".to_string()));
        }

        let operation_id = operation
            .get("operationId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(|| fallback_operation_id(method, template), sanitize_tool_name);

        // Operation-level parameters override path-level ones on (name, in).
        let mut merged: Vec<((String, ParamLocation), FunctionParameter)> = Vec::new();
        for raw in [shared_params, operation.get("parameters")]
            .into_iter()
            .flatten()
            .filter_map(Value::as_array)
            .flatten()
        {
            let resolved = inline_refs(doc, raw, 0)?;
            let Some(param) = parse_parameter(&resolved) else {
                tracing::debug!(operation_id = %operation_id, "Ignoring malformed parameter");
                continue;
            };
            let key = (param.name.clone(), param.location);
            if let Some(slot) = merged.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = param;
            } else {
                merged.push((key, param));
            }
        }
        let mut parameters: Vec<FunctionParameter> = merged.into_iter().map(|(_, p)| p).collect();

        // Every template parameter must be supplied by the caller.
        for name in template.param_names() {
            if !parameters
                .iter()
                .any(|p| p.location == ParamLocation::Path && p.name == name)
            {
                parameters.push(FunctionParameter {
                    name: name.to_string(),
                    location: ParamLocation::Path,
                    required: true,
                    schema_type: "string".to_string(),
                    schema: json!({ "type": "string" }),
                    description: None,
                });
            }
        }

        if let Some(body) = operation.get("requestBody") {
            let body = inline_refs(doc, body, 0)?;
            let schema = body
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| {
                    content
                        .get("application/json")
                        .or_else(|| content.values().next())
                })
                .and_then(|media| media.get("schema"))
                .cloned()
                .unwrap_or_else(|| json!({ "type": "object" }));
            parameters.push(FunctionParameter {
                name: "requestBody".to_string(),
                location: ParamLocation::Body,
                required: body.get("required").and_then(Value::as_bool).unwrap_or(false),
                schema_type: schema_type(&schema),
                description: body
                    .get("description")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                schema,
            });
        }

        let response_schema = operation
            .get("responses")
            .and_then(Value::as_object)
            .and_then(|responses| {
                responses
                    .iter()
                    .find(|(code, _)| code.starts_with('2'))
                    .map(|(_, r)| r)
            })
            .and_then(|r| r.pointer("/content/application~1json/schema"))
            .map(|s| inline_refs(doc, s, 0))
            .transpose()?;

        let description = operation
            .get("description")
            .or_else(|| operation.get("summary"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(FunctionSpec {
            operation_id,
            description,
            method: method.clone(),
            path: template.as_str().to_string(),
            parameters,
            response_schema,
        })
    }
}

/// `<method>_<path segments without braces>`, e.g. `get_users_userId_posts`.
fn fallback_operation_id(method: &Method, template: &PathTemplate) -> String {
    let parts: Vec<&str> = template
        .segments()
        .iter()
        .map(|s| match s {
            Segment::Literal(s) | Segment::Param(s) => s.as_str(),
        })
        .collect();
    let tail = if parts.is_empty() {
        "root".to_string()
    } else {
        parts.join("_")
    };
    sanitize_tool_name(&format!("{}_{tail}", method.as_str().to_ascii_lowercase()))
}

fn parse_parameter(raw: &Value) -> Option<FunctionParameter> {
    let name = raw.get("name")?.as_str()?.to_string();
    let location = ParamLocation::parse(raw.get("in")?.as_str()?)?;
    let schema = raw
        .get("schema")
        .cloned()
        .unwrap_or_else(|| json!({ "type": "string" }));
    Some(FunctionParameter {
        required: location == ParamLocation::Path
            || raw.get("required").and_then(Value::as_bool).unwrap_or(false),
        schema_type: schema_type(&schema),
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        name,
        location,
        schema,
    })
}

fn schema_type(schema: &Value) -> String {
    schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("string")
        .to_string()
}

/// Inline local (`#/...`) references. Remote references are left untouched.
pub fn inline_refs(doc: &Value, value: &Value, depth: usize) -> Result<Value, ToolError> {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                if let Some(pointer) = reference.strip_prefix('#') {
                    if depth >= MAX_REF_DEPTH {
                        return Err(ToolError::Schema(format!(
                            "$ref chain too deep at '{reference}'"
                        )));
                    }
                    let target = doc.pointer(pointer).ok_or_else(|| {
                        ToolError::Schema(format!("unresolvable $ref '{reference}'"))
                    })?;
                    return inline_refs(doc, target, depth + 1);
                }
            }
            map.iter()
                .map(|(k, v)| Ok((k.clone(), inline_refs(doc, v, depth)?)))
                .collect::<Result<serde_json::Map<_, _>, ToolError>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| inline_refs(doc, v, depth))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn header_map(tool_id: &str, headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                tracing::warn!(tool_id = %tool_id, header = %name, "Ignoring invalid custom header");
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::RouteMatcher;
    use crate::tools::matcher::split_segments;

    fn definition(schema: Value) -> ToolDefinition {
        ToolDefinition {
            id: "posts".to_string(),
            name: "Posts".to_string(),
            description: String::new(),
            schema,
            custom_headers: BTreeMap::from([("X-Api-Key".to_string(), "secret".to_string())]),
            sharing: None,
        }
    }

    fn compiler() -> SchemaCompiler {
        SchemaCompiler::new(Arc::new(PlatformRegistry::with_defaults()))
    }

    fn sample() -> Value {
        json!({
            "servers": [{ "url": "https://api.example.com/" }],
            "components": {
                "schemas": {
                    "Post": {
                        "type": "object",
                        "properties": { "title": { "type": "string" }, "author": { "$ref": "#/components/schemas/User" } }
                    },
                    "User": { "type": "object", "properties": { "name": { "type": "string" } } }
                },
                "parameters": {
                    "Limit": { "name": "limit", "in": "query", "schema": { "type": "integer" } }
                }
            },
            "paths": {
                "/users/{userId}/posts": {
                    "parameters": [
                        { "name": "userId", "in": "path", "schema": { "type": "string" } },
                        { "name": "limit", "in": "query", "schema": { "type": "string" } }
                    ],
                    "get": {
                        "operationId": "getUserPosts",
                        "parameters": [{ "$ref": "#/components/parameters/Limit" }],
                        "responses": {
                            "200": { "content": { "application/json": { "schema": { "type": "array", "items": { "$ref": "#/components/schemas/Post" } } } } }
                        }
                    },
                    "post": {
                        "operationId": "createPost",
                        "requestBody": {
                            "required": true,
                            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/Post" } } }
                        }
                    }
                },
                "/users/active": { "get": { "summary": "Active users" } },
                "/users/{id}": {
                    "get": { "operationId": "getUser" },
                    "delete": { "operationId": "getUser" }
                }
            }
        })
    }

    #[test]
    fn test_compiles_routes_and_functions() {
        let compiled = compiler().compile(&definition(sample())).unwrap();
        let detail = &compiled.detail;

        let ops: Vec<&str> = detail.routes.iter().map(|r| r.operation_id.as_str()).collect();
        assert_eq!(ops, vec!["getUserPosts", "createPost", "get_users_active", "getUser"]);

        let map = detail.route_map();
        assert_eq!(map["/users/:userId/posts"], "createPost");
        assert_eq!(map["/users/active"], "get_users_active");

        assert!(!detail.sends_body("getUserPosts"));
        assert!(detail.sends_body("createPost"));
        for route in &detail.routes {
            assert!(detail.body_mode.contains_key(&route.operation_id));
        }

        match &detail.endpoint {
            Endpoint::Remote(remote) => {
                assert_eq!(remote.base_url, "https://api.example.com");
                assert_eq!(remote.headers["x-api-key"], "secret");
            }
            Endpoint::Local(_) => panic!("expected remote endpoint"),
        }
    }

    #[test]
    fn test_operation_parameters_override_path_level() {
        let compiled = compiler().compile(&definition(sample())).unwrap();
        let get = compiled
            .functions
            .iter()
            .find(|f| f.operation_id == "getUserPosts")
            .unwrap();
        let limit = get.parameters.iter().find(|p| p.name == "limit").unwrap();
        assert_eq!(limit.schema_type, "integer");
        assert_eq!(get.parameters.len(), 2);
        let item_props = &get.response_schema.as_ref().unwrap()["items"]["properties"];
        assert_eq!(item_props["author"]["properties"]["name"]["type"], "string");
    }

    #[test]
    fn test_request_body_is_single_argument() {
        let compiled = compiler().compile(&definition(sample())).unwrap();
        let create = compiled
            .functions
            .iter()
            .find(|f| f.operation_id == "createPost")
            .unwrap();
        let tool = create.to_openai_tool();
        let props = &tool["function"]["parameters"]["properties"];
        assert_eq!(props["requestBody"]["properties"]["title"]["type"], "string");
        assert_eq!(props["userId"]["type"], "string");
        let required = tool["function"]["parameters"]["required"].as_array().unwrap();
        assert!(required.contains(&json!("requestBody")));
        assert!(required.contains(&json!("userId")));
    }

    #[test]
    fn test_missing_paths_is_schema_error() {
        let err = compiler()
            .compile(&definition(json!({ "servers": [{ "url": "https://x" }] })))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema(_)));

        let err = compiler()
            .compile(&definition(json!({ "paths": [], "servers": [{ "url": "https://x" }] })))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema(_)));
    }

    #[test]
    fn test_bad_operations_are_skipped() {
        let schema = json!({
            "servers": [{ "url": "https://x" }],
            "paths": {
                "/a": { "get": { "operationId": "ok" } },
                "/b": { "get": "nonsense" },
                "/c/{x}.json": { "get": { "operationId": "partial" } },
                "/d": { "get": { "operationId": "loop", "parameters": [{ "$ref": "#/components/nope" }] } }
            }
        });
        let compiled = compiler().compile(&definition(schema)).unwrap();
        assert_eq!(compiled.functions.len(), 1);
        assert_eq!(compiled.functions[0].operation_id, "ok");
    }

    #[test]
    fn test_cyclic_refs_are_bounded() {
        let doc = json!({ "components": { "a": { "$ref": "#/components/b" }, "b": { "$ref": "#/components/a" } } });
        let err = inline_refs(&doc, &json!({ "$ref": "#/components/a" }), 0).unwrap_err();
        assert!(matches!(err, ToolError::Schema(_)));
    }

    #[test]
    fn test_arguments_in_override() {
        let policy = DefaultBodyPolicy;
        assert!(!policy.sends_body(&Method::POST, &json!({ "x-arguments-in": "query" })));
        assert!(policy.sends_body(&Method::GET, &json!({ "x-arguments-in": "body" })));
        assert!(policy.sends_body(&Method::GET, &json!({ "requestBody": {} })));
        assert!(!policy.sends_body(&Method::DELETE, &json!({})));
        assert!(policy.sends_body(&Method::PATCH, &json!({})));
    }

    #[test]
    fn test_every_operation_is_reachable_through_its_template() {
        let compiled = compiler().compile(&definition(sample())).unwrap();
        let matcher = RouteMatcher::new(&compiled.detail.routes);
        for route in &compiled.detail.routes {
            let concrete = route.template.render(|name| Some(format!("v-{name}"))).unwrap();
            let m = matcher
                .find(&route.method, &split_segments(&concrete), None)
                .unwrap();
            assert_eq!(m.operation_id, route.operation_id);
        }
    }

    #[test]
    fn test_local_schema_binds_platform_handlers() {
        let registry = PlatformRegistry::with_defaults();
        let clock = registry.find("clock").unwrap().clone();
        let compiled = compiler().compile(&clock).unwrap();
        match &compiled.detail.endpoint {
            Endpoint::Local(handlers) => assert!(handlers.contains_key("clock__currentTime")),
            Endpoint::Remote(_) => panic!("expected local endpoint"),
        }
        assert!(compiled.detail.sends_body("clock__currentTime"));
    }

    #[test]
    fn test_missing_servers_is_schema_error() {
        let err = compiler()
            .compile(&definition(json!({ "paths": {} })))
            .unwrap_err();
        assert!(matches!(err, ToolError::Schema(_)));
    }
}
