use std::sync::Arc;

use super::platform::PlatformRegistry;
use super::store::ToolStore;
use super::{ToolDefinition, ToolError};

/// A tool record plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTool {
    pub definition: ToolDefinition,
    pub is_platform: bool,
}

/// Resolves tool ids against the persisted store, then the platform registry.
///
/// The registry is consulted only when the store misses or fails.
#[derive(Debug, Clone)]
pub struct ToolResolver {
    store: Option<Arc<dyn ToolStore>>,
    platform: Arc<PlatformRegistry>,
}

impl ToolResolver {
    pub fn new(store: Arc<dyn ToolStore>, platform: Arc<PlatformRegistry>) -> Self {
        Self {
            store: Some(store),
            platform,
        }
    }

    /// Resolver without a persisted catalog.
    pub fn platform_only(platform: Arc<PlatformRegistry>) -> Self {
        Self {
            store: None,
            platform,
        }
    }

    pub async fn resolve(&self, tool_id: &str) -> Result<ResolvedTool, ToolError> {
        if let Some(store) = &self.store {
            match store.get_tool(tool_id).await {
                Ok(Some(definition)) => {
                    tracing::debug!(tool_id = %tool_id, "Resolved tool from store");
                    let is_platform = definition.is_platform();
                    return Ok(ResolvedTool {
                        definition,
                        is_platform,
                    });
                }
                Ok(None) => {
                    tracing::debug!(tool_id = %tool_id, "Tool not in store, trying platform registry");
                }
                Err(e) => {
                    tracing::warn!(tool_id = %tool_id, error = %e, "Tool store lookup failed, trying platform registry");
                }
            }
        }

        self.platform
            .find(tool_id)
            .map(|definition| ResolvedTool {
                definition: definition.clone(),
                is_platform: true,
            })
            .ok_or_else(|| ToolError::ToolNotFound(tool_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tools::InMemoryToolStore;

    #[derive(Debug, Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolStore for FailingStore {
        async fn get_tool(&self, _id: &str) -> anyhow::Result<Option<ToolDefinition>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("connection refused")
        }
    }

    fn remote_clock() -> ToolDefinition {
        ToolDefinition {
            id: "clock".to_string(),
            name: "Remote clock".to_string(),
            description: String::new(),
            schema: json!({ "servers": [{ "url": "https://time.example.com" }], "paths": {} }),
            custom_headers: Default::default(),
            sharing: None,
        }
    }

    #[tokio::test]
    async fn test_store_hit_skips_registry() {
        let store = Arc::new(InMemoryToolStore::new([remote_clock()]));
        let resolver = ToolResolver::new(store, Arc::new(PlatformRegistry::with_defaults()));
        let resolved = resolver.resolve("clock").await.unwrap();
        assert_eq!(resolved.definition.name, "Remote clock");
        assert!(!resolved.is_platform);
    }

    #[tokio::test]
    async fn test_store_miss_falls_back() {
        let store = Arc::new(InMemoryToolStore::default());
        let resolver = ToolResolver::new(store, Arc::new(PlatformRegistry::with_defaults()));
        let resolved = resolver.resolve("clock").await.unwrap();
        assert!(resolved.is_platform);
        assert_eq!(resolved.definition.sharing.as_deref(), Some("platform"));
    }

    #[tokio::test]
    async fn test_store_error_falls_back() {
        let store = Arc::new(FailingStore::default());
        let resolver = ToolResolver::new(
            Arc::clone(&store) as Arc<dyn ToolStore>,
            Arc::new(PlatformRegistry::with_defaults()),
        );
        assert!(resolver.resolve("markdown").await.unwrap().is_platform);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let resolver = ToolResolver::platform_only(Arc::new(PlatformRegistry::with_defaults()));
        let err = resolver.resolve("nope").await.unwrap_err();
        assert!(matches!(err, ToolError::ToolNotFound(id) if id == "nope"));
    }
}
