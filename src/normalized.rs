//! Normalized event types for tool-calling chat streams.
//!
//! Provider drivers emit these events, the stream transforms rewrite them, and
//! the orchestrator relays them to the client as Server-Sent Events. Tool
//! activity travels on the same stream as `tool.annotation` frames so a client
//! can render intermediate results before the next provider round completes.
//!
//! # Example
//!
//! ```rust
//! use tool_gateway::normalized::{NormalizedEvent, event_name};
//!
//! let event = NormalizedEvent::MessageDelta {
//!     text: "Hello".to_string(),
//! };
//! assert_eq!(event_name(&event), "message.delta");
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-call metadata carried on the annotation channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMetadata {
    /// Tool output (JSON value or the error text of a failed call).
    pub result: serde_json::Value,
    /// Whether the result bypasses the model and should not count toward its context.
    pub skip_token_count: bool,
    /// Wall-clock time spent executing the call.
    pub request_time_ms: u64,
}

/// Normalized streaming events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NormalizedEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Stream Lifecycle
    // ─────────────────────────────────────────────────────────────────────
    /// Indicates the start of a new streaming response.
    #[serde(rename = "stream.start")]
    StreamStart {
        /// Unique identifier for this request/response pair.
        request_id: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Message Content
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental text delta from the assistant's response.
    #[serde(rename = "message.delta")]
    MessageDelta {
        /// The text fragment to append.
        text: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Tool Calls
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental tool call delta (streaming tool call assembly).
    #[serde(rename = "tool_call.delta")]
    ToolCallDelta {
        /// Index of this tool call in the current batch.
        call_index: usize,
        /// Tool call ID (may arrive in first delta or later).
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Function name (may arrive in first delta or later).
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Incremental arguments JSON fragment.
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_delta: Option<String>,
    },

    /// Tool call is fully assembled and about to be executed.
    #[serde(rename = "tool_call.complete")]
    ToolCallComplete {
        /// Index of this tool call in the current batch.
        call_index: usize,
        /// Tool call ID.
        id: String,
        /// Function name.
        name: String,
        /// Complete arguments as JSON string.
        arguments_json: String,
    },

    /// Side-channel metadata for one settled tool call, keyed by function name.
    #[serde(rename = "tool.annotation")]
    ToolAnnotation {
        /// Tool call ID this annotation belongs to.
        call_id: String,
        /// Function name → call metadata.
        calls: BTreeMap<String, ToolCallMetadata>,
    },

    /// Result from executing a tool.
    #[serde(rename = "tool_result")]
    ToolResult {
        /// Tool call ID this result corresponds to.
        id: String,
        /// Function name.
        name: String,
        /// Result content as sent back to the model.
        content: String,
        /// Whether the tool execution succeeded.
        #[serde(default = "default_true")]
        success: bool,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Errors and Completion
    // ─────────────────────────────────────────────────────────────────────
    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        message: String,
        /// Optional error code for programmatic handling.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Stream has completed successfully.
    #[serde(rename = "done")]
    Done,
}

fn default_true() -> bool {
    true
}

impl NormalizedEvent {
    /// Build an annotation frame for a single call.
    pub fn annotation(call_id: impl Into<String>, name: impl Into<String>, metadata: ToolCallMetadata) -> Self {
        let mut calls = BTreeMap::new();
        calls.insert(name.into(), metadata);
        Self::ToolAnnotation {
            call_id: call_id.into(),
            calls,
        }
    }
}

/// Get the SSE event name for a [`NormalizedEvent`].
pub fn event_name(evt: &NormalizedEvent) -> &'static str {
    match evt {
        NormalizedEvent::StreamStart { .. } => "stream.start",
        NormalizedEvent::MessageDelta { .. } => "message.delta",
        NormalizedEvent::ToolCallDelta { .. } => "tool_call.delta",
        NormalizedEvent::ToolCallComplete { .. } => "tool_call.complete",
        NormalizedEvent::ToolAnnotation { .. } => "tool.annotation",
        NormalizedEvent::ToolResult { .. } => "tool_result",
        NormalizedEvent::Error { .. } => "error",
        NormalizedEvent::Done => "done",
    }
}
