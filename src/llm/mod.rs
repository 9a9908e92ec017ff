//! LLM driver traits and implementations.
//!
//! The gateway treats a provider as an opaque source of text and tool-call
//! deltas. The [`LlmDriver`] trait is that seam; [`ChatCompletionsDriver`]
//! speaks the OpenAI-compatible `/v1/chat/completions` protocol and the
//! [`Orchestrator`] runs the tool loop on top of any driver.
//!
//! # Example
//!
//! ```rust,ignore
//! use tool_gateway::llm::{LlmSettings, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o".to_string(),
//!     provider: Provider::OpenAI,
//!     parallel_tool_calls: None,
//! };
//! ```

pub mod chat_completions;
pub mod orchestrator;
pub mod provider;
pub mod transform;

pub use chat_completions::ChatCompletionsDriver;
pub use orchestrator::{ChatTurn, Orchestrator};
pub use provider::Provider;
pub use transform::{StreamTransform, TransformPipeline};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalized::NormalizedEvent;

/// Stream of provider events.
pub type EventStream = BoxStream<'static, anyhow::Result<NormalizedEvent>>;

/// LLM connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Default model identifier.
    pub model: String,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
    /// Whether to enable parallel tool calls (provider-dependent).
    pub parallel_tool_calls: Option<bool>,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .finish()
    }
}

/// Per-request model settings supplied by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A message in a conversation.
///
/// `content` is kept as raw JSON so multimodal parts pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Value::String(content.into()),
            tool_call_id: None,
            tool_calls: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(text: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            },
            tool_call_id: None,
            tool_calls: Some(tool_calls),
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// Request to an LLM driver.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Available tools in `OpenAI` function schema format.
    pub tools: Vec<Value>,
    pub settings: ChatSettings,
}

/// Trait for LLM streaming drivers.
///
/// Implementations emit [`NormalizedEvent::MessageDelta`],
/// [`NormalizedEvent::ToolCallDelta`] and [`NormalizedEvent::Done`]; tool call
/// assembly is the orchestrator's job.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync + std::fmt::Debug {
    /// Stream a response from the LLM.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the connection is interrupted.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream>;
}

/// Driver used when no provider is configured. Every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredDriver;

#[async_trait::async_trait]
impl LlmDriver for UnconfiguredDriver {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<EventStream> {
        anyhow::bail!("LLM provider not configured (set llm.base_url and llm.model)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_call_message_shape() {
        let msg = Message::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name: "getUserPosts".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "getUserPosts");
    }

    #[test]
    fn test_tool_result_message_shape() {
        let v = serde_json::to_value(Message::tool_result("call_1", "ok")).unwrap();
        assert_eq!(v, serde_json::json!({ "role": "tool", "content": "ok", "tool_call_id": "call_1" }));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let settings = LlmSettings {
            base_url: "https://api.openai.com".to_string(),
            api_key: Some("sk-secret".to_string()),
            model: "gpt-4o".to_string(),
            provider: Provider::OpenAI,
            parallel_tool_calls: None,
        };
        assert!(!format!("{settings:?}").contains("sk-secret"));
    }
}
