use super::builder::ContextWindowBuilder;
use crate::pipeline::{keys, Stage, StageInput, StageKind, StageOutput, StreamElement};
use crate::types::Message;
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::instrument;

/// Collects the whole turn, fits its messages into the token budget and
/// re-emits the survivors in their original order.
///
/// Non-message elements pass through in place. Every emitted element carries
/// `context_truncated`, `context_tokens` and `context_dropped`.
pub struct ContextBuilderStage {
    builder: ContextWindowBuilder,
}

impl ContextBuilderStage {
    pub fn new(builder: ContextWindowBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Stage for ContextBuilderStage {
    fn name(&self) -> &str {
        "context_builder"
    }

    fn kind(&self) -> StageKind {
        StageKind::Accumulate
    }

    #[instrument(name = "context.build", skip_all)]
    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let elements = input.collect().await;
        if input.is_halted() {
            return output.send_all(elements).await;
        }

        let system_prompt = elements
            .iter()
            .find_map(|e| e.metadata_str(keys::SYSTEM_PROMPT))
            .unwrap_or_default()
            .to_string();
        let messages: Vec<Message> = elements.iter().filter_map(|e| e.message.clone()).collect();

        let selection = self.builder.select(&messages, &system_prompt).await?;
        let dropped = selection.dropped();
        let cache_breakpoints = self.builder.policy().enable_cache_breakpoints;

        let annotate = |mut elem: StreamElement| {
            elem.metadata
                .insert(keys::CONTEXT_TRUNCATED.into(), json!(selection.truncated));
            elem.metadata
                .insert(keys::CONTEXT_TOKENS.into(), json!(selection.tokens_used));
            elem.metadata
                .insert(keys::CONTEXT_DROPPED.into(), json!(dropped));
            if cache_breakpoints {
                elem.metadata.insert(keys::CACHE_BREAKPOINTS.into(), json!(true));
            }
            if selection.over_budget {
                elem.metadata.insert("context_over_budget".into(), json!(true));
            }
            elem
        };

        let mut msg_index = 0;
        for elem in elements {
            if elem.message.is_none() {
                output.send(annotate(elem)).await?;
                continue;
            }
            if let Some((at, summary)) = &selection.summary {
                if *at == msg_index {
                    let summary_elem = StreamElement::from_message(summary.clone())
                        .with_metadata(keys::FROM_HISTORY, json!(true));
                    output.send(annotate(summary_elem)).await?;
                }
            }
            let kept = selection.keep.get(msg_index).copied().unwrap_or(true);
            msg_index += 1;
            if kept {
                output.send(annotate(elem)).await?;
            }
        }
        Ok(())
    }
}
