//! Templated route matching.
//!
//! Templates are OpenAPI paths (`/users/{userId}/posts`). Matching is
//! segment-wise and positional: literals compare exactly, `{name}` binds one
//! non-empty segment. A match keeps both the decoded value and the segment
//! exactly as received, so rendering a match reproduces the request path.
//! When several templates match, the one with the most literal segments wins
//! and ties keep declaration order.

use std::collections::BTreeMap;

use axum::http::Method;
use serde_json::Value;

use super::ToolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, ToolError> {
        let segments = split_segments(raw)
            .into_iter()
            .map(|seg| {
                if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    if name.is_empty() || name.contains(['{', '}']) {
                        return Err(ToolError::Schema(format!("invalid path parameter in '{raw}'")));
                    }
                    Ok(Segment::Param(name.to_string()))
                } else if seg.contains(['{', '}']) {
                    Err(ToolError::Schema(format!(
                        "partial path parameters are not supported: '{raw}'"
                    )))
                } else {
                    Ok(Segment::Literal(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Template with `{name}` rewritten to `:name`.
    pub fn matcher_key(&self) -> String {
        let mut key = String::new();
        for seg in &self.segments {
            key.push('/');
            match seg {
                Segment::Literal(s) => key.push_str(s),
                Segment::Param(name) => {
                    key.push(':');
                    key.push_str(name);
                }
            }
        }
        if key.is_empty() {
            key.push('/');
        }
        key
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match concrete segments, returning the path parameters as received.
    pub fn match_segments(&self, segments: &[&str]) -> Option<BTreeMap<String, String>> {
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();
        for (template, actual) in self.segments.iter().zip(segments) {
            match template {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if actual.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }

    /// Substitute parameter values, percent-encoding each one.
    ///
    /// Returns the name of the first parameter `lookup` could not supply.
    pub fn render<F>(&self, mut lookup: F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        self.render_raw(|name| lookup(name).map(|value| encode_segment(&value)))
    }

    /// Substitute segments that are already percent-encoded, verbatim.
    pub fn render_raw<F>(&self, mut lookup: F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Param(name) => {
                    let value = lookup(name).ok_or_else(|| name.clone())?;
                    out.push_str(&value);
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }
}

/// Percent-encode one path segment. RFC 3986 `pchar`s stay as they are.
pub fn encode_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut utf8 = [0u8; 4];
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:@".contains(c) {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut utf8)));
        }
    }
    out
}

/// Split a path into its non-empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// One row of a tool's route table.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub template: PathTemplate,
    pub method: Method,
    pub operation_id: String,
}

/// Result of matching a request against a route table.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    pub template: String,
    pub method: Method,
    pub operation_id: String,
    /// Percent-decoded path parameters.
    pub path_params: BTreeMap<String, String>,
    /// Path parameter segments exactly as they appeared in the request.
    pub raw_path_params: BTreeMap<String, String>,
    /// Every query parameter, in request order.
    pub query_params: Vec<(String, String)>,
}

impl RouteMatch {
    /// Query parameters as a JSON object; repeated keys become arrays.
    pub fn query_object(&self) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();
        for (key, value) in &self.query_params {
            let value = Value::String(value.clone());
            match out.get_mut(key) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    out.insert(key.clone(), value);
                }
            }
        }
        out
    }

    pub fn path_object(&self) -> serde_json::Map<String, Value> {
        self.path_params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }
}

/// Matches requests against one tool's route table.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatcher<'a> {
    routes: &'a [RouteEntry],
}

impl<'a> RouteMatcher<'a> {
    pub fn new(routes: &'a [RouteEntry]) -> Self {
        Self { routes }
    }

    /// Find the best route for `method` and `segments`.
    ///
    /// Returns `None` when nothing matches; callers decide how to report it.
    pub fn find(&self, method: &Method, segments: &[&str], raw_query: Option<&str>) -> Option<RouteMatch> {
        let mut best: Option<(&RouteEntry, BTreeMap<String, String>)> = None;

        for route in self.routes.iter().filter(|r| &r.method == method) {
            let Some(params) = route.template.match_segments(segments) else {
                continue;
            };
            if params.values().any(|raw| urlencoding::decode(raw).is_err()) {
                continue;
            }
            let better = best
                .as_ref()
                .is_none_or(|(current, _)| route.template.literal_count() > current.template.literal_count());
            if better {
                best = Some((route, params));
            }
        }

        best.map(|(route, raw_path_params)| RouteMatch {
            template: route.template.as_str().to_string(),
            method: route.method.clone(),
            operation_id: route.operation_id.clone(),
            path_params: raw_path_params
                .iter()
                .map(|(name, raw)| {
                    let decoded = urlencoding::decode(raw).map_or_else(|_| raw.clone(), |v| v.into_owned());
                    (name.clone(), decoded)
                })
                .collect(),
            raw_path_params,
            query_params: parse_query(raw_query),
        })
    }

    /// Exact reverse lookup: operation id → route.
    pub fn lookup(&self, operation_id: &str) -> Option<&'a RouteEntry> {
        self.routes.iter().find(|r| r.operation_id == operation_id)
    }
}

/// Parse a raw query string with `application/x-www-form-urlencoded` rules.
pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, method: Method, op: &str) -> RouteEntry {
        RouteEntry {
            template: PathTemplate::parse(path).unwrap(),
            method,
            operation_id: op.to_string(),
        }
    }

    #[test]
    fn test_matcher_key() {
        let t = PathTemplate::parse("/users/{userId}/posts").unwrap();
        assert_eq!(t.matcher_key(), "/users/:userId/posts");
        assert_eq!(PathTemplate::parse("/").unwrap().matcher_key(), "/");
    }

    #[test]
    fn test_rejects_partial_params() {
        assert!(PathTemplate::parse("/files/{name}.json").is_err());
        assert!(PathTemplate::parse("/files/{}").is_err());
    }

    #[test]
    fn test_literal_beats_param() {
        let routes = vec![
            route("/users/{id}", Method::GET, "getUser"),
            route("/users/active", Method::GET, "listActive"),
        ];
        let matcher = RouteMatcher::new(&routes);
        let m = matcher.find(&Method::GET, &["users", "active"], None).unwrap();
        assert_eq!(m.operation_id, "listActive");
        assert!(m.path_params.is_empty());

        let m = matcher.find(&Method::GET, &["users", "42"], None).unwrap();
        assert_eq!(m.operation_id, "getUser");
        assert_eq!(m.path_params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let routes = vec![
            route("/{a}/x", Method::GET, "first"),
            route("/y/{b}", Method::GET, "second"),
        ];
        let matcher = RouteMatcher::new(&routes);
        let m = matcher.find(&Method::GET, &["y", "x"], None).unwrap();
        assert_eq!(m.operation_id, "first");
    }

    #[test]
    fn test_method_and_segment_count_filter() {
        let routes = vec![route("/users/{id}", Method::POST, "updateUser")];
        let matcher = RouteMatcher::new(&routes);
        assert!(matcher.find(&Method::GET, &["users", "1"], None).is_none());
        assert!(matcher.find(&Method::POST, &["users"], None).is_none());
        assert!(matcher.find(&Method::POST, &["users", "1", "x"], None).is_none());
        assert!(matcher.find(&Method::POST, &["Users", "1"], None).is_none());
    }

    #[test]
    fn test_params_are_decoded_and_query_kept_in_full() {
        let routes = vec![route("/search/{term}", Method::GET, "search")];
        let matcher = RouteMatcher::new(&routes);
        let m = matcher
            .find(&Method::GET, &["search", "hello%20world"], Some("limit=10&tag=a&tag=b&x=%2F"))
            .unwrap();
        assert_eq!(m.path_params["term"], "hello world");
        assert_eq!(
            m.query_params,
            vec![
                ("limit".to_string(), "10".to_string()),
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "b".to_string()),
                ("x".to_string(), "/".to_string()),
            ]
        );
        let q = m.query_object();
        assert_eq!(q["tag"], serde_json::json!(["a", "b"]));
        assert_eq!(q["limit"], "10");
    }

    #[test]
    fn test_match_then_render_reproduces_path() {
        let cases = [
            ("/users/{userId}/posts", "/users/123/posts"),
            ("/a/{b}/{c}", "/a/hello%20there/caf%C3%A9"),
            ("/static/path", "/static/path"),
            ("/{only}", "/x-y_z.~"),
            ("/users/{id}", "/users/a+b"),
            ("/users/{id}", "/users/john@x.com"),
            ("/users/{id}", "/users/a:b"),
            ("/users/{id}", "/users/caf%c3%a9"),
            ("/users/{id}", "/users/it's(1)!$"),
            ("/files/{name}", "/files/a%2Fb"),
        ];
        for (template, path) in cases {
            let routes = vec![route(template, Method::GET, "op")];
            let m = RouteMatcher::new(&routes)
                .find(&Method::GET, &split_segments(path), None)
                .unwrap();
            let t = PathTemplate::parse(template).unwrap();
            let rendered = t.render_raw(|name| m.raw_path_params.get(name).cloned()).unwrap();
            assert_eq!(rendered, path);
        }
    }

    #[test]
    fn test_render_keeps_path_legal_characters() {
        let t = PathTemplate::parse("/users/{id}").unwrap();
        for (value, expected) in [
            ("a+b", "/users/a+b"),
            ("john@x.com", "/users/john@x.com"),
            ("a:b", "/users/a:b"),
            ("a b/c?", "/users/a%20b%2Fc%3F"),
            ("café", "/users/caf%C3%A9"),
        ] {
            assert_eq!(t.render(|_| Some(value.to_string())).unwrap(), expected);
        }
    }

    #[test]
    fn test_raw_and_decoded_params_are_both_kept() {
        let routes = vec![route("/users/{id}", Method::GET, "getUser")];
        let m = RouteMatcher::new(&routes)
            .find(&Method::GET, &["users", "caf%c3%a9"], None)
            .unwrap();
        assert_eq!(m.path_params["id"], "café");
        assert_eq!(m.raw_path_params["id"], "caf%c3%a9");
    }

    #[test]
    fn test_render_reports_missing_param() {
        let t = PathTemplate::parse("/users/{userId}/posts/{postId}").unwrap();
        let err = t
            .render(|name| (name == "userId").then(|| "1".to_string()))
            .unwrap_err();
        assert_eq!(err, "postId");
    }

    #[test]
    fn test_matching_is_deterministic() {
        let routes = vec![
            route("/a/{x}", Method::GET, "one"),
            route("/{y}/b", Method::GET, "two"),
        ];
        let matcher = RouteMatcher::new(&routes);
        let first = matcher.find(&Method::GET, &["a", "b"], Some("q=1"));
        let second = matcher.find(&Method::GET, &["a", "b"], Some("q=1"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_lookup_is_exact() {
        let routes = vec![route("/users/{id}", Method::GET, "getUser")];
        let matcher = RouteMatcher::new(&routes);
        assert!(matcher.lookup("getUser").is_some());
        assert!(matcher.lookup("getuser").is_none());
    }
}
