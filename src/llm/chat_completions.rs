//! OpenAI Chat Completions API driver.
//!
//! This module implements the [`LlmDriver`] trait for the OpenAI Chat Completions
//! API (`/v1/chat/completions`), streaming text and tool-call deltas as
//! [`NormalizedEvent`]s.

use futures::StreamExt;
use serde_json::Value;

use crate::normalized::NormalizedEvent;

use super::{EventStream, LlmDriver, LlmRequest, LlmSettings};

/// Driver for the OpenAI Chat Completions API.
#[derive(Debug, Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, req: LlmRequest) -> Value {
        let mut body = serde_json::json!({
            "model": req.settings.model.as_deref().unwrap_or(&self.settings.model),
            "stream": true,
            "messages": req.messages,
        });

        if let Some(t) = req.settings.temperature {
            body["temperature"] = Value::from(t);
        }
        if let Some(m) = req.settings.max_tokens {
            body["max_tokens"] = Value::from(m);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools);
            if let Some(parallel) = self.settings.parallel_tool_calls {
                body["parallel_tool_calls"] = Value::Bool(parallel);
            }
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<EventStream> {
        let url = self.settings.provider.build_chat_url(&self.settings.base_url);
        let body = self.request_body(req);

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider returned {status}: {text}");
        }
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

                while let Some(pos) = find_double_newline(&buf) {
                    let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                    for event in parse_frame(&frame)? {
                        yield event;
                    }
                }
            }

            // Last frame may end without a blank line.
            for event in parse_frame(&buf)? {
                yield event;
            }
        };

        Ok(Box::pin(out))
    }
}

/// Translate every `data:` line of one SSE frame into events.
fn parse_frame(frame: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let text = String::from_utf8_lossy(frame);
    let mut events = Vec::new();
    for line in text.lines() {
        if let Some(data) = line.trim().strip_prefix("data:") {
            events.extend(parse_data(data.trim())?);
        }
    }
    Ok(events)
}

/// Translate one `data:` payload into events.
fn parse_data(data: &str) -> anyhow::Result<Vec<NormalizedEvent>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data == "[DONE]" {
        return Ok(vec![NormalizedEvent::Done]);
    }

    let v: Value = serde_json::from_str(data)?;
    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), ToString::to_string);
        anyhow::bail!("provider stream error: {message}");
    }

    let mut events = Vec::new();
    let delta = &v["choices"][0]["delta"];

    // Assistant text delta
    if let Some(s) = delta.get("content").and_then(Value::as_str) {
        if !s.is_empty() {
            events.push(NormalizedEvent::MessageDelta {
                text: s.to_string(),
            });
        }
    }

    // Tool calls streaming deltas
    if let Some(arr) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in arr {
            let idx = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let id = tc
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);
            let function = tc.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);
            let arguments_delta = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string);

            events.push(NormalizedEvent::ToolCallDelta {
                call_index: idx,
                id,
                name,
                arguments_delta,
            });
        }
    }

    Ok(events)
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
