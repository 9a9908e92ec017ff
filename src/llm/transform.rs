//! Composable fix-ups for provider event streams.
//!
//! The orchestrator expects tool calls in a two-phase shape: a delta that
//! carries the call's name (and id), followed by deltas that carry only
//! argument fragments, each tagged with a stable per-call index. Providers
//! that deviate get [`StreamTransform`] stages applied to the driver stream
//! before any tool-call detection runs.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;

use crate::normalized::NormalizedEvent;

use super::{EventStream, Provider};

/// One rewrite stage over a provider event stream.
pub trait StreamTransform: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn apply(&self, stream: EventStream) -> EventStream;
}

/// Ordered list of stages.
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    stages: Vec<Arc<dyn StreamTransform>>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn StreamTransform>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stages needed for `provider`'s known quirks.
    pub fn for_provider(provider: &Provider) -> Self {
        let mut pipeline = Self::new();
        if provider.reuses_tool_call_index() {
            pipeline = pipeline.with_stage(Arc::new(ReindexToolCalls));
        }
        if provider.combines_tool_call_deltas() {
            pipeline = pipeline.with_stage(Arc::new(SplitToolCallDeltas));
        }
        pipeline
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, stream: EventStream) -> EventStream {
        self.stages.iter().fold(stream, |s, stage| stage.apply(s))
    }
}

/// Splits a delta carrying both a name and arguments into a name-only delta
/// followed by an arguments-only delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitToolCallDeltas;

impl StreamTransform for SplitToolCallDeltas {
    fn name(&self) -> &'static str {
        "split_tool_call_deltas"
    }

    fn apply(&self, stream: EventStream) -> EventStream {
        stream
            .flat_map(|item| {
                let items = match item {
                    Ok(NormalizedEvent::ToolCallDelta {
                        call_index,
                        id,
                        name: Some(name),
                        arguments_delta: Some(args),
                    }) => vec![
                        Ok(NormalizedEvent::ToolCallDelta {
                            call_index,
                            id,
                            name: Some(name),
                            arguments_delta: None,
                        }),
                        Ok(NormalizedEvent::ToolCallDelta {
                            call_index,
                            id: None,
                            name: None,
                            arguments_delta: Some(args),
                        }),
                    ],
                    other => vec![other],
                };
                futures::stream::iter(items)
            })
            .boxed()
    }
}

/// Assigns call indexes by call id for providers that send every call with
/// the same index. Deltas without an id continue the most recent call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReindexToolCalls;

#[derive(Debug, Default)]
struct ReindexState {
    by_id: HashMap<String, usize>,
    current: Option<usize>,
}

impl ReindexState {
    fn rewrite(&mut self, event: NormalizedEvent) -> NormalizedEvent {
        let NormalizedEvent::ToolCallDelta {
            call_index,
            id,
            name,
            arguments_delta,
        } = event
        else {
            return event;
        };

        let index = match &id {
            Some(id) => {
                let next = self.by_id.len();
                *self.by_id.entry(id.clone()).or_insert(next)
            }
            None => *self.current.get_or_insert(call_index),
        };
        self.current = Some(index);

        NormalizedEvent::ToolCallDelta {
            call_index: index,
            id,
            name,
            arguments_delta,
        }
    }
}

impl StreamTransform for ReindexToolCalls {
    fn name(&self) -> &'static str {
        "reindex_tool_calls"
    }

    fn apply(&self, stream: EventStream) -> EventStream {
        let mut state = ReindexState::default();
        stream
            .map(move |item| item.map(|event| state.rewrite(event)))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> NormalizedEvent {
        NormalizedEvent::ToolCallDelta {
            call_index: index,
            id: id.map(ToString::to_string),
            name: name.map(ToString::to_string),
            arguments_delta: args.map(ToString::to_string),
        }
    }

    async fn run(pipeline: &TransformPipeline, events: Vec<NormalizedEvent>) -> Vec<NormalizedEvent> {
        let input: EventStream = futures::stream::iter(events.into_iter().map(Ok)).boxed();
        pipeline
            .apply(input)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_split_combined_delta() {
        let pipeline = TransformPipeline::new().with_stage(Arc::new(SplitToolCallDeltas));
        let out = run(
            &pipeline,
            vec![
                NormalizedEvent::MessageDelta { text: "x".into() },
                delta(0, Some("c1"), Some("f"), Some("{\"a\":1}")),
                NormalizedEvent::Done,
            ],
        )
        .await;
        assert_eq!(
            out,
            vec![
                NormalizedEvent::MessageDelta { text: "x".into() },
                delta(0, Some("c1"), Some("f"), None),
                delta(0, None, None, Some("{\"a\":1}")),
                NormalizedEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_reindex_distinct_ids() {
        let pipeline = TransformPipeline::new().with_stage(Arc::new(ReindexToolCalls));
        let out = run(
            &pipeline,
            vec![
                delta(0, Some("a"), Some("f"), None),
                delta(0, None, None, Some("{}")),
                delta(0, Some("b"), Some("g"), None),
                delta(0, None, None, Some("{}")),
            ],
        )
        .await;
        let indexes: Vec<usize> = out
            .iter()
            .map(|e| match e {
                NormalizedEvent::ToolCallDelta { call_index, .. } => *call_index,
                _ => usize::MAX,
            })
            .collect();
        assert_eq!(indexes, vec![0, 0, 1, 1]);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let pipeline = TransformPipeline::for_provider(&Provider::Gemini);
        let input: EventStream =
            futures::stream::iter(vec![Err(anyhow::anyhow!("boom"))]).boxed();
        let out: Vec<_> = pipeline.apply(input).collect().await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[test]
    fn test_stages_per_provider() {
        assert_eq!(
            TransformPipeline::for_provider(&Provider::Gemini).stage_names(),
            vec!["reindex_tool_calls", "split_tool_call_deltas"]
        );
        assert_eq!(
            TransformPipeline::for_provider(&Provider::OpenRouter).stage_names(),
            vec!["split_tool_call_deltas"]
        );
        assert!(TransformPipeline::for_provider(&Provider::OpenAI).stage_names().is_empty());
    }
}
