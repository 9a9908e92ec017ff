//! LLM orchestrator with tool loop execution.
//!
//! The orchestrator manages the complete lifecycle of a tool-calling turn:
//! 1. Stream the provider response, relaying text to the client
//! 2. Accumulate tool-call deltas into complete calls
//! 3. Execute every call of the round concurrently and wait for all of them
//! 4. Emit each result as a `tool.annotation` frame
//! 5. Either finish with a `render_markdown` result or feed all results back
//!    and stream the next provider round
//!
//! # Example
//!
//! ```rust,ignore
//! use tool_gateway::llm::{ChatTurn, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(settings, ToolExecutor::new());
//! let stream = orchestrator.run(ChatTurn {
//!     messages,
//!     catalog: Arc::new(catalog),
//!     settings: ChatSettings::default(),
//!     scope: None,
//! });
//! ```

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::normalized::{NormalizedEvent, ToolCallMetadata};
use crate::tools::{
    ApplicationScope, ResultProcessingMode, ToolCallRequest, ToolCallResult, ToolCatalog,
    ToolError, ToolExecutor,
};

use super::{
    ChatCompletionsDriver, ChatSettings, LlmDriver, LlmRequest, LlmSettings, Message, ToolCall,
    ToolCallFunction, TransformPipeline, UnconfiguredDriver,
};

/// Default bound on provider rounds per turn.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

/// Phases of one streaming turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Relaying provider tokens.
    Streaming,
    /// The provider started emitting tool calls.
    ToolCallDetected,
    /// Tool calls are in flight.
    ExecutingTools,
    /// A `render_markdown` result ended the turn.
    ShortCircuited,
    /// Results appended; the next provider round is starting.
    Resuming,
    Done,
    Failed,
}

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default, Clone)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Per-turn state. Discarded when the stream ends or is dropped.
#[derive(Debug)]
struct StreamState {
    request_id: String,
    phase: TurnPhase,
    iteration: usize,
    text: String,
    accumulators: BTreeMap<usize, ToolCallAccumulator>,
    in_flight: usize,
}

impl StreamState {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            phase: TurnPhase::Streaming,
            iteration: 0,
            text: String::new(),
            accumulators: BTreeMap::new(),
            in_flight: 0,
        }
    }

    fn transition(&mut self, next: TurnPhase) {
        tracing::debug!(
            request_id = %self.request_id,
            iteration = self.iteration,
            from = ?self.phase,
            to = ?next,
            "Turn phase transition"
        );
        self.phase = next;
    }

    fn begin_round(&mut self) {
        self.iteration += 1;
        self.text.clear();
        self.accumulators.clear();
        self.transition(TurnPhase::Streaming);
    }

    fn accumulate(&mut self, call_index: usize, id: Option<&String>, name: Option<&String>, args: Option<&String>) {
        if self.phase == TurnPhase::Streaming {
            self.transition(TurnPhase::ToolCallDetected);
        }
        let acc = self.accumulators.entry(call_index).or_default();
        if acc.id.is_none() {
            acc.id = id.cloned();
        }
        if acc.name.is_none() {
            acc.name = name.cloned();
        }
        if let Some(delta) = args {
            acc.arguments.push_str(delta);
        }
    }

    /// Complete calls in index order. Calls without a name cannot be
    /// dispatched and are dropped; a missing id is generated.
    fn take_tool_calls(&mut self) -> Vec<(usize, ToolCall)> {
        std::mem::take(&mut self.accumulators)
            .into_iter()
            .filter_map(|(idx, acc)| {
                let Some(name) = acc.name else {
                    tracing::warn!(
                        request_id = %self.request_id,
                        call_index = idx,
                        "Dropping tool call without a function name"
                    );
                    return None;
                };
                let id = acc
                    .id
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                Some((
                    idx,
                    ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: ToolCallFunction {
                            name,
                            arguments: acc.arguments,
                        },
                    },
                ))
            })
            .collect()
    }
}

/// Outcome of one tool call after fan-in.
#[derive(Debug, Clone)]
struct SettledCall {
    call_id: String,
    name: String,
    /// Text sent back to the model (or rendered on short-circuit).
    content: String,
    /// Value surfaced on the annotation channel.
    result: Value,
    mode: ResultProcessingMode,
    success: bool,
    elapsed: Duration,
}

impl SettledCall {
    fn succeeded(call: &ToolCall, result: ToolCallResult, elapsed: Duration) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: result.output.to_content(),
            result: result.output.into_value(),
            mode: result.mode,
            success: true,
            elapsed,
        }
    }

    fn failed(call: &ToolCall, reason: &str, elapsed: Duration) -> Self {
        let content = format!("Error: {reason}");
        Self {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            result: Value::String(content.clone()),
            content,
            mode: ResultProcessingMode::SendToLlm,
            success: false,
            elapsed,
        }
    }

    fn metadata(&self) -> ToolCallMetadata {
        ToolCallMetadata {
            result: self.result.clone(),
            skip_token_count: self.mode == ResultProcessingMode::RenderMarkdown,
            request_time_ms: u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn short_circuits(&self) -> bool {
        self.success && self.mode == ResultProcessingMode::RenderMarkdown
    }
}

/// Everything one chat turn needs.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub messages: Vec<Message>,
    pub catalog: Arc<ToolCatalog>,
    pub settings: ChatSettings,
    pub scope: Option<ApplicationScope>,
}

/// LLM orchestrator with tool loop execution.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn LlmDriver>,
    executor: ToolExecutor,
    transforms: TransformPipeline,
    max_iterations: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("driver", &self.driver)
            .field("transforms", &self.transforms.stage_names())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator over the Chat Completions driver, with the stream
    /// transforms `settings.provider` needs.
    pub fn new(settings: LlmSettings, executor: ToolExecutor) -> Self {
        let transforms = TransformPipeline::for_provider(&settings.provider);
        Self {
            driver: Arc::new(ChatCompletionsDriver::new(settings)),
            executor,
            transforms,
            max_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    /// Orchestrator whose every turn fails with a provider error.
    pub fn unconfigured(executor: ToolExecutor) -> Self {
        Self::with_driver(Arc::new(UnconfiguredDriver), executor)
    }

    /// Orchestrator over an arbitrary driver, with no transforms.
    pub fn with_driver(driver: Arc<dyn LlmDriver>, executor: ToolExecutor) -> Self {
        Self {
            driver,
            executor,
            transforms: TransformPipeline::new(),
            max_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    #[must_use]
    pub fn with_transforms(mut self, transforms: TransformPipeline) -> Self {
        self.transforms = transforms;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Run one chat turn.
    ///
    /// The stream always starts with `StreamStart` and ends with either
    /// `Done` or `Error`. Dropping it aborts in-flight tool calls and closes
    /// the provider connection.
    #[allow(clippy::too_many_lines)]
    pub fn run(&self, turn: ChatTurn) -> impl Stream<Item = NormalizedEvent> + Send + 'static {
        let this = self.clone();
        let request_id = Uuid::new_v4().to_string();
        let tools = turn.catalog.openai_tools();

        tracing::info!(
            request_id = %request_id,
            message_count = turn.messages.len(),
            tool_count = tools.len(),
            application_id = ?turn.scope.as_ref().map(|s| s.application_id.as_str()),
            "Starting tool chat turn"
        );

        async_stream::stream! {
            yield NormalizedEvent::StreamStart {
                request_id: request_id.clone(),
            };

            let ChatTurn { mut messages, catalog, settings, scope } = turn;
            let mut state = StreamState::new(request_id.clone());

            loop {
                if state.iteration >= this.max_iterations {
                    tracing::error!(
                        request_id = %request_id,
                        iteration = state.iteration,
                        max_iterations = this.max_iterations,
                        "Maximum tool loop iterations exceeded"
                    );
                    state.transition(TurnPhase::Failed);
                    yield NormalizedEvent::Error {
                        message: "Maximum tool loop iterations exceeded".to_string(),
                        code: Some("MAX_ITERATIONS".to_string()),
                    };
                    break;
                }
                state.begin_round();

                tracing::info!(
                    request_id = %request_id,
                    iteration = state.iteration,
                    message_count = messages.len(),
                    "Starting provider round"
                );

                let req = LlmRequest {
                    messages: messages.clone(),
                    tools: tools.clone(),
                    settings: settings.clone(),
                };

                let driver_stream = match this.driver.stream(req).await {
                    Ok(s) => this.transforms.apply(s),
                    Err(e) => {
                        let err = ToolError::ProviderStream(e.to_string());
                        tracing::error!(
                            request_id = %request_id,
                            iteration = state.iteration,
                            error = %e,
                            "Failed to create driver stream"
                        );
                        state.transition(TurnPhase::Failed);
                        yield NormalizedEvent::Error {
                            message: err.to_string(),
                            code: Some(err.code().to_string()),
                        };
                        break;
                    }
                };

                let mut failed = false;
                futures::pin_mut!(driver_stream);

                while let Some(result) = driver_stream.next().await {
                    match result {
                        Ok(NormalizedEvent::Done) => {}
                        Ok(event) => {
                            match &event {
                                NormalizedEvent::MessageDelta { text } => state.text.push_str(text),
                                NormalizedEvent::ToolCallDelta { call_index, id, name, arguments_delta } => {
                                    state.accumulate(*call_index, id.as_ref(), name.as_ref(), arguments_delta.as_ref());
                                }
                                NormalizedEvent::Error { .. } => failed = true,
                                _ => {}
                            }
                            yield event;
                            if failed {
                                break;
                            }
                        }
                        Err(e) => {
                            let err = ToolError::ProviderStream(e.to_string());
                            tracing::error!(
                                request_id = %request_id,
                                iteration = state.iteration,
                                error = %e,
                                "Provider stream failed"
                            );
                            yield NormalizedEvent::Error {
                                message: err.to_string(),
                                code: Some(err.code().to_string()),
                            };
                            failed = true;
                            break;
                        }
                    }
                }

                if failed {
                    state.transition(TurnPhase::Failed);
                    break;
                }

                let indexed = state.take_tool_calls();
                if indexed.is_empty() {
                    tracing::info!(
                        request_id = %request_id,
                        iteration = state.iteration,
                        text_length = state.text.len(),
                        "No tool calls to process, completing stream"
                    );
                    state.transition(TurnPhase::Done);
                    yield NormalizedEvent::Done;
                    break;
                }

                for (call_index, call) in &indexed {
                    tracing::info!(
                        request_id = %request_id,
                        iteration = state.iteration,
                        call_id = %call.id,
                        function = %call.function.name,
                        args_length = call.function.arguments.len(),
                        "Tool call to execute"
                    );
                    yield NormalizedEvent::ToolCallComplete {
                        call_index: *call_index,
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments_json: call.function.arguments.clone(),
                    };
                }

                let calls: Vec<ToolCall> = indexed.into_iter().map(|(_, call)| call).collect();
                messages.push(Message::assistant_tool_calls(&state.text, calls.clone()));

                state.transition(TurnPhase::ExecutingTools);
                state.in_flight = calls.len();
                tracing::info!(
                    request_id = %request_id,
                    iteration = state.iteration,
                    in_flight = state.in_flight,
                    "Dispatching tool calls"
                );
                let settled = run_tool_batch(&this.executor, &catalog, scope.as_ref(), &calls, &request_id).await;
                state.in_flight = 0;

                for call in &settled {
                    yield NormalizedEvent::annotation(call.call_id.clone(), call.name.clone(), call.metadata());
                    yield NormalizedEvent::ToolResult {
                        id: call.call_id.clone(),
                        name: call.name.clone(),
                        content: call.content.clone(),
                        success: call.success,
                    };
                }

                let rendered: Vec<&str> = settled
                    .iter()
                    .filter(|c| c.short_circuits())
                    .map(|c| c.content.as_str())
                    .collect();
                if !rendered.is_empty() {
                    tracing::info!(
                        request_id = %request_id,
                        iteration = state.iteration,
                        rendered_count = rendered.len(),
                        "Rendering tool output directly, skipping further generation"
                    );
                    state.transition(TurnPhase::ShortCircuited);
                    yield NormalizedEvent::MessageDelta {
                        text: rendered.join("\n\n"),
                    };
                    state.transition(TurnPhase::Done);
                    yield NormalizedEvent::Done;
                    break;
                }

                for call in settled {
                    messages.push(Message::tool_result(call.call_id, call.content));
                }
                state.transition(TurnPhase::Resuming);
            }
        }
    }
}

/// Run every call concurrently and wait for all of them.
///
/// Results come back in call order. A failing or panicking call yields an
/// `Error: ...` result and never affects its siblings.
async fn run_tool_batch(
    executor: &ToolExecutor,
    catalog: &Arc<ToolCatalog>,
    scope: Option<&ApplicationScope>,
    calls: &[ToolCall],
    request_id: &str,
) -> Vec<SettledCall> {
    let mut set = JoinSet::new();

    for (idx, call) in calls.iter().enumerate() {
        let executor = executor.clone();
        let catalog = Arc::clone(catalog);
        let scope = scope.cloned();
        let request = ToolCallRequest::from_json_arguments(&call.function.name, &call.function.arguments);

        set.spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(executor.execute(&catalog, &request, scope.as_ref()))
                .catch_unwind()
                .await;
            (idx, outcome, started.elapsed())
        });
    }

    let mut slots: Vec<Option<SettledCall>> = (0..calls.len()).map(|_| None).collect();

    while let Some(joined) = set.join_next().await {
        let (idx, outcome, elapsed) = match joined {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Tool task did not complete");
                continue;
            }
        };
        let call = &calls[idx];

        let settled = match outcome {
            Ok(Ok(result)) => {
                tracing::info!(
                    request_id = %request_id,
                    call_id = %call.id,
                    function = %call.function.name,
                    mode = result.mode.as_str(),
                    elapsed_ms = %elapsed.as_millis(),
                    "Tool call succeeded"
                );
                SettledCall::succeeded(call, result, elapsed)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    request_id = %request_id,
                    call_id = %call.id,
                    function = %call.function.name,
                    error = %e,
                    code = e.code(),
                    "Tool call failed"
                );
                SettledCall::failed(call, &e.to_string(), elapsed)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                tracing::error!(
                    request_id = %request_id,
                    call_id = %call.id,
                    function = %call.function.name,
                    reason = %reason,
                    "Tool call panicked"
                );
                SettledCall::failed(call, &reason, elapsed)
            }
        };
        slots[idx] = Some(settled);
    }

    slots
        .into_iter()
        .zip(calls)
        .map(|(slot, call)| slot.unwrap_or_else(|| SettledCall::failed(call, "cancelled", Duration::ZERO)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_builds_calls_in_index_order() {
        let mut state = StreamState::new("r".to_string());
        state.begin_round();
        let s = |v: &str| v.to_string();
        state.accumulate(1, Some(&s("b")), Some(&s("second")), None);
        state.accumulate(0, None, Some(&s("first")), Some(&s("{\"a\":")));
        state.accumulate(0, None, None, Some(&s("1}")));
        state.accumulate(2, Some(&s("c")), None, Some(&s("{}")));
        assert_eq!(state.phase, TurnPhase::ToolCallDetected);

        let calls = state.take_tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 0);
        assert!(calls[0].1.id.starts_with("call_"));
        assert_eq!(calls[0].1.function.arguments, "{\"a\":1}");
        assert_eq!(calls[1].1.id, "b");
        assert!(state.accumulators.is_empty());
    }

    #[test]
    fn test_failed_call_content() {
        let call = ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: "f".to_string(),
                arguments: "{}".to_string(),
            },
        };
        let settled = SettledCall::failed(&call, "Internal Server Error", Duration::from_millis(5));
        assert_eq!(settled.content, "Error: Internal Server Error");
        assert!(!settled.short_circuits());
        let meta = settled.metadata();
        assert_eq!(meta.request_time_ms, 5);
        assert!(!meta.skip_token_count);
    }
}
