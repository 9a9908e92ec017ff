use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::llm::Orchestrator;
use crate::tools::{
    AllowListProvider, FileToolStore, PlatformRegistry, SchemaCompiler, StaticAllowLists,
    ToolExecutor, ToolResolver, ToolStore,
};

/// Build shared state from configuration: platform registry, tool store,
/// executor, and orchestrator.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let platform = Arc::new(PlatformRegistry::with_defaults());
    for definition in platform.definitions() {
        info!(name: "tools.platform.registered", tool_id = %definition.id, "Platform tool registered");
    }

    let resolver = match &config.tools.directory {
        Some(dir) => {
            let store = FileToolStore::load_from_dir(dir).await?;
            info!(
                name: "tools.store.loaded",
                directory = %dir,
                tool_count = store.len(),
                "Tool records loaded"
            );
            ToolResolver::new(Arc::new(store) as Arc<dyn ToolStore>, Arc::clone(&platform))
        }
        None => ToolResolver::platform_only(Arc::clone(&platform)),
    };

    let executor = ToolExecutor::new();
    let orchestrator = match config.llm_settings()? {
        Some(settings) => {
            info!(
                name: "llm.config.loaded",
                base_url = %settings.base_url,
                model = %settings.model,
                provider = ?settings.provider,
                "LLM configuration loaded"
            );
            Orchestrator::new(settings, executor.clone())
        }
        None => {
            tracing::warn!("No LLM provider configured; /api/chat/tools will report an error");
            Orchestrator::unconfigured(executor.clone())
        }
    }
    .with_max_iterations(config.tools.max_tool_iterations);

    let allow_lists: Option<Arc<dyn AllowListProvider>> = if config.applications.is_empty() {
        None
    } else {
        Some(Arc::new(StaticAllowLists::new(&config.applications)))
    };

    Ok(AppState {
        resolver: Arc::new(resolver),
        compiler: Arc::new(SchemaCompiler::new(platform)),
        executor,
        orchestrator: Arc::new(orchestrator),
        allow_lists,
        config,
    })
}

/// Wrap the API router with body limit, timeout and tracing layers.
pub fn build_app(state: AppState) -> Router {
    // A very long timeout stands in for "disabled" so the layer type stays fixed.
    let timeout_duration = if state.config.resilience.timeout_disabled {
        Duration::from_secs(365 * 24 * 60 * 60)
    } else {
        Duration::from_secs(state.config.resilience.request_timeout_secs)
    };
    let body_limit = state.config.server.body_limit_bytes;

    crate::api::router()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout_duration;
                async move {
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => {
                            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
                        }
                    }
                }
            },
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
