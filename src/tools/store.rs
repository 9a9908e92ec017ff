//! Persisted tool records.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use super::ToolDefinition;

/// Lookup of persisted tool records.
///
/// `Ok(None)` means the record does not exist; `Err` is a transport or
/// storage failure. The resolver treats both as a miss.
#[async_trait]
pub trait ToolStore: Send + Sync + std::fmt::Debug {
    async fn get_tool(&self, id: &str) -> anyhow::Result<Option<ToolDefinition>>;
}

/// Immutable map of tool records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryToolStore {
    tools: Arc<HashMap<String, ToolDefinition>>,
}

impl InMemoryToolStore {
    pub fn new(tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        Self {
            tools: Arc::new(tools.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolStore for InMemoryToolStore {
    async fn get_tool(&self, id: &str) -> anyhow::Result<Option<ToolDefinition>> {
        Ok(self.tools.get(id).cloned())
    }
}

/// Tool records loaded once from a directory of `.json`, `.yaml` or `.yml`
/// files, one record per file.
#[derive(Debug, Clone, Default)]
pub struct FileToolStore {
    inner: InMemoryToolStore,
}

impl FileToolStore {
    /// Load every record under `dir`. Unreadable or invalid files are logged
    /// and skipped.
    pub async fn load_from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to read tool directory {}", dir.display()))?;

        let mut tools = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let is_yaml = matches!(ext, "yaml" | "yml");
            if ext != "json" && !is_yaml {
                continue;
            }

            match read_record(&path, is_yaml).await {
                Ok(tool) => {
                    tracing::info!(name: "tools.record.loaded", tool_id = %tool.id, path = %path.display(), "Loaded tool record");
                    tools.push(tool);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping invalid tool record");
                }
            }
        }

        Ok(Self {
            inner: InMemoryToolStore::new(tools),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

async fn read_record(path: &Path, is_yaml: bool) -> anyhow::Result<ToolDefinition> {
    let raw = tokio::fs::read_to_string(path).await?;
    let tool = if is_yaml {
        serde_yaml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    Ok(tool)
}

#[async_trait]
impl ToolStore for FileToolStore {
    async fn get_tool(&self, id: &str) -> anyhow::Result<Option<ToolDefinition>> {
        self.inner.get_tool(id).await
    }
}
