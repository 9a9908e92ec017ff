use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

/// Failures of schema compilation, resolution, and tool execution.
///
/// At the gateway boundary these map onto JSON error responses; inside a
/// streaming turn they become the failing call's textual result.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The document is not a usable OpenAPI schema.
    #[error("invalid tool schema: {0}")]
    Schema(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("missing path parameter '{parameter}' for {function}")]
    ParameterMissing { function: String, parameter: String },

    #[error("application '{application}' is not allowed to call {function}")]
    Forbidden {
        function: String,
        application: String,
    },

    /// Non-2xx from a proxied call; `message` is the canonical status text.
    #[error("{message}")]
    UpstreamHttp { status: u16, message: String },

    /// The model provider's transport failed.
    #[error("provider stream failed: {0}")]
    ProviderStream(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The outbound request could not be completed.
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    /// Build an [`ToolError::UpstreamHttp`] from a response status.
    pub fn upstream(status: StatusCode) -> Self {
        Self::UpstreamHttp {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .map_or_else(|| status.as_str().to_string(), ToString::to_string),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::ToolNotFound(_) | Self::RouteNotFound { .. } | Self::FunctionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::ParameterMissing { .. } => StatusCode::BAD_REQUEST,
            Self::Schema(_)
            | Self::UpstreamHttp { .. }
            | Self::Transport(_)
            | Self::ProviderStream(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "SCHEMA_ERROR",
            Self::ToolNotFound(_) => "TOOL_NOT_FOUND",
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            Self::ParameterMissing { .. } => "PARAMETER_MISSING",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::UpstreamHttp { .. } | Self::Transport(_) => "UPSTREAM_HTTP",
            Self::ProviderStream(_) => "PROVIDER_STREAM",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ToolError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let error = if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Gateway request failed");
            "Internal server error".to_string()
        } else {
            tracing::debug!(error = %self, code = self.code(), "Gateway request rejected");
            self.to_string()
        };

        (
            status,
            Json(ErrorBody {
                error,
                code: self.code(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_status_text() {
        let err = ToolError::upstream(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Internal Server Error");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ToolError::ToolNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ToolError::RouteNotFound {
                method: "GET".into(),
                path: "/a".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ToolError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ToolError::Schema("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let response = ToolError::Internal(anyhow::anyhow!("secret db dsn")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_failed_calls_are_server_errors() {
        for err in [
            ToolError::upstream(StatusCode::SERVICE_UNAVAILABLE),
            ToolError::ProviderStream("reset".into()),
            ToolError::Internal(anyhow::anyhow!("invalid JSON body")),
        ] {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR, "{err}");
        }
    }
}
