//! Tool Gateway
//!
//! Turns OpenAPI-described tools into callable functions for a streaming LLM
//! chat loop, and exposes the same tools through a transparent HTTP gateway.
//!
//! # Architecture
//!
//! - **Server**: Axum router with SSE streaming for chat turns
//! - **Tools**: schema compilation, route matching, resolution and execution
//! - **LLM Orchestration**: provider driver, stream fix-ups, and the tool loop
//!
//! # Modules
//!
//! - [`api`]: HTTP handlers for the gateway and chat endpoints
//! - [`config`]: layered configuration
//! - [`llm`]: LLM driver traits, transforms and the orchestrator
//! - [`normalized`]: Unified streaming event model
//! - [`telemetry`]: logging setup
//! - [`tools`]: tool definitions and the dispatch pipeline

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod api;
pub mod config;
pub mod llm;
pub mod normalized;
pub mod server;
pub mod telemetry;
pub mod tools;

use crate::config::AppConfig;

use llm::Orchestrator;
use std::sync::Arc;
use tools::{AllowListProvider, SchemaCompiler, ToolExecutor, ToolResolver};

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Tool id → definition (persisted catalog, then platform registry).
    pub resolver: Arc<ToolResolver>,
    pub compiler: Arc<SchemaCompiler>,
    pub executor: ToolExecutor,
    /// LLM orchestrator for chat interactions.
    pub orchestrator: Arc<Orchestrator>,
    /// Per-application allow-lists for platform functions.
    pub allow_lists: Option<Arc<dyn AllowListProvider>>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
