//! Provider stage: drives the tool-calling loop for one turn.
//!
//! `Invoke -> {Final | ToolCalls} -> [Execute tools -> Invoke] -> Final`.
//! Input elements are forwarded first, then text deltas as they arrive, then
//! one assistant element per tool round, one tool element per call, and the
//! final assistant element carrying `finish_reason`, `rounds`, `tool_calls`
//! and `cost`.

use super::policy::{ToolChoice, ToolPolicy};
use super::traits::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
use crate::pipeline::{keys, Stage, StageInput, StageKind, StageOutput, StreamElement};
use crate::tools::ToolRegistry;
use crate::types::{CostInfo, Message, Metadata, ToolCall, ToolResultRecord};
use crate::{Result, TurnError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub struct ProviderStage {
    provider: Arc<dyn Provider>,
    tools: Option<ToolRegistry>,
    policy: ToolPolicy,
}

impl ProviderStage {
    pub fn new(provider: Arc<dyn Provider>, tools: Option<ToolRegistry>, policy: ToolPolicy) -> Self {
        Self {
            provider,
            tools,
            policy,
        }
    }

    fn build_request(&self, elements: &[StreamElement]) -> ProviderRequest {
        let system_prompt = elements
            .iter()
            .find_map(|e| e.metadata_str(keys::SYSTEM_PROMPT))
            .unwrap_or_default()
            .to_string();
        let allowed: Option<Vec<String>> = elements
            .iter()
            .find_map(|e| e.metadata.get(keys::ALLOWED_TOOLS))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .filter(|names: &Vec<String>| !names.is_empty());
        let cache_breakpoints = elements
            .iter()
            .any(|e| e.metadata.get(keys::CACHE_BREAKPOINTS) == Some(&json!(true)));

        let tools = match (&self.tools, self.policy.tool_choice) {
            (_, ToolChoice::None) | (None, _) => Vec::new(),
            (Some(registry), _) => registry
                .descriptors(allowed.as_deref())
                .into_iter()
                .filter(|d| !self.policy.is_blocked(&d.name))
                .collect(),
        };

        ProviderRequest {
            system_prompt,
            messages: elements.iter().filter_map(|e| e.message.clone()).collect(),
            tools,
            tool_choice: self.policy.tool_choice,
            cache_breakpoints,
        }
    }

    /// Invoke the provider once, forwarding deltas as they arrive
    async fn invoke(
        &self,
        request: &ProviderRequest,
        base: &Metadata,
        output: &StageOutput,
    ) -> Result<ProviderResponse> {
        let mut rx = self.provider.predict_stream(request).await?;
        let mut response = None;
        while let Some(chunk) = rx.recv().await {
            match chunk? {
                StreamChunk::Delta(text) => {
                    let mut elem = StreamElement::delta(text);
                    elem.metadata = base.clone();
                    output.send(elem).await?;
                }
                StreamChunk::Done(done) => response = Some(done),
            }
        }
        response.ok_or_else(|| {
            TurnError::Provider(format!(
                "{} stream ended without a final response",
                self.provider.id()
            ))
        })
    }

    async fn execute_call(&self, call: &ToolCall) -> ToolResultRecord {
        let refuse = |reason: String| {
            warn!(target: "provider_stage", tool = %call.name, %reason, "Refusing tool call");
            ToolResultRecord {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: format!("Error: {reason}"),
                error: Some(reason),
                latency_ms: 0,
            }
        };

        if self.policy.is_blocked(&call.name) {
            return refuse(format!("tool '{}' is blocked by policy", call.name));
        }
        match &self.tools {
            Some(registry) if registry.contains(&call.name) => registry.dispatch(call).await,
            _ => refuse(format!("unknown tool '{}'", call.name)),
        }
    }
}

#[async_trait]
impl Stage for ProviderStage {
    fn name(&self) -> &str {
        "provider"
    }

    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    #[instrument(name = "provider.turn", skip_all, fields(provider = %self.provider.id()))]
    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let elements = input.collect().await;
        if input.is_halted() {
            return output.send_all(elements).await;
        }

        let mut request = self.build_request(&elements);
        let base: Metadata = elements
            .iter()
            .rev()
            .find(|e| !e.is_from_history())
            .map(|e| e.metadata.clone())
            .unwrap_or_default();
        output.send_all(elements).await?;

        let started = Instant::now();
        let mut cost = CostInfo::default();
        let mut total_calls = 0usize;
        let mut round = 0usize;

        let response = loop {
            round += 1;
            request.tool_choice = self.policy.choice_for_round(round);
            debug!(target: "provider_stage", round, messages = request.messages.len(), "Invoking provider");

            let response = self.invoke(&request, &base, &output).await?;
            cost.accumulate(&response.cost);

            if response.tool_calls.is_empty() {
                break response;
            }
            if self.policy.max_rounds > 0 && round >= self.policy.max_rounds {
                return Err(TurnError::Policy(format!(
                    "tool loop exceeded max rounds ({})",
                    self.policy.max_rounds
                )));
            }
            total_calls += response.tool_calls.len();
            if self.policy.max_tool_calls_per_turn > 0 && total_calls > self.policy.max_tool_calls_per_turn {
                return Err(TurnError::Policy(format!(
                    "tool calls per turn exceeded ({total_calls} > {})",
                    self.policy.max_tool_calls_per_turn
                )));
            }

            info!(target: "provider_stage", round, calls = response.tool_calls.len(), "Executing tool calls");
            let mut assistant = Message::assistant(response.content.clone());
            assistant.tool_calls = response.tool_calls.clone();
            request.messages.push(assistant.clone());
            let mut elem = StreamElement::from_message(assistant);
            elem.metadata = base.clone();
            output.send(elem).await?;

            for call in &response.tool_calls {
                let record = self.execute_call(call).await;
                debug!(target: "provider_stage", tool = %call.name, failed = record.error.is_some(), "Tool result");
                let msg = Message::tool(record);
                request.messages.push(msg.clone());
                let mut elem = StreamElement::from_message(msg);
                elem.metadata = base.clone();
                output.send(elem).await?;
            }
        };

        let mut message = Message::assistant(response.content);
        message.parts = response.parts;
        message.latency_ms = started.elapsed().as_millis() as u64;
        message.cost = Some(cost.clone());
        if let Some(raw) = response.raw {
            message.meta.insert("raw_response".into(), raw);
        }

        info!(
            target: "provider_stage",
            rounds = round,
            tool_calls = total_calls,
            input_tokens = cost.input_tokens,
            output_tokens = cost.output_tokens,
            "Provider turn complete"
        );

        let mut elem = StreamElement::from_message(message);
        elem.metadata = base;
        elem.metadata
            .insert(keys::FINISH_REASON.into(), json!(response.finish_reason));
        elem.metadata.insert(keys::ROUNDS.into(), json!(round));
        elem.metadata.insert(keys::TOOL_CALLS.into(), json!(total_calls));
        elem.metadata.insert(keys::COST.into(), json!(cost));
        output.send(elem).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::tools::{Tool, ToolResult};
    use crate::types::Role;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records the requests it saw
    struct Scripted {
        responses: Mutex<VecDeque<ProviderResponse>>,
        seen: Mutex<Vec<ProviderRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<ProviderResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn predict(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
            self.seen.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TurnError::Provider("script exhausted".into()))
        }
    }

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        fn name(&self) -> String {
            "lookup".into()
        }

        fn description(&self) -> String {
            "Look something up".into()
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"q": {"type": "string"}}})
        }

        async fn call(&self, arguments: Value) -> ToolResult<Value> {
            Ok(json!({"answer": format!("result for {}", arguments["q"].as_str().unwrap_or(""))}))
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: json!({"q": "rust"}),
        }
    }

    fn with_cost(mut r: ProviderResponse, input: u64, output: u64) -> ProviderResponse {
        r.cost = CostInfo {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        };
        r
    }

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Lookup));
        registry
    }

    async fn run(stage: ProviderStage) -> Result<crate::ExecutionResult> {
        Pipeline::builder()
            .stage(stage)
            .build()?
            .execute_sync(StreamElement::from_message(Message::user("find rust")))
            .await
    }

    #[tokio::test]
    async fn test_plain_answer_single_round() {
        let provider = Scripted::new(vec![ProviderResponse::text("hello there")]);
        let result = run(ProviderStage::new(provider, None, ToolPolicy::default()))
            .await
            .unwrap();
        assert_eq!(result.response_text(), "hello there");
        assert_eq!(result.text, "hello there");
        assert_eq!(result.metadata[keys::ROUNDS], json!(1));
        assert_eq!(result.metadata[keys::FINISH_REASON], json!("stop"));
    }

    #[tokio::test]
    async fn test_tool_round_then_answer_accumulates_cost() {
        let provider = Scripted::new(vec![
            with_cost(ProviderResponse::tool_calls(vec![call("c1", "lookup")]), 10, 2),
            with_cost(ProviderResponse::text("rust is a language"), 20, 5),
        ]);
        let policy = ToolPolicy {
            tool_choice: ToolChoice::Required,
            ..Default::default()
        };
        let result = run(ProviderStage::new(provider.clone(), Some(registry()), policy))
            .await
            .unwrap();

        let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert!(result.messages[2].content.contains("result for rust"));
        let cost = result.response.as_ref().unwrap().cost.clone().unwrap();
        assert_eq!((cost.input_tokens, cost.output_tokens), (30, 7));
        assert_eq!(result.metadata[keys::TOOL_CALLS], json!(1));

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].tool_choice, ToolChoice::Required);
        assert_eq!(seen[1].tool_choice, ToolChoice::Auto);
        assert_eq!(seen[0].tools.len(), 1);
        assert_eq!(seen[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_max_rounds_is_policy_error() {
        let provider = Scripted::new(vec![
            ProviderResponse::tool_calls(vec![call("c1", "lookup")]),
            ProviderResponse::tool_calls(vec![call("c2", "lookup")]),
            ProviderResponse::text("never reached"),
        ]);
        let policy = ToolPolicy {
            max_rounds: 2,
            ..Default::default()
        };
        let err = run(ProviderStage::new(provider, Some(registry()), policy))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Policy(_)));
    }

    #[tokio::test]
    async fn test_max_tool_calls_is_policy_error() {
        let provider = Scripted::new(vec![ProviderResponse::tool_calls(vec![
            call("c1", "lookup"),
            call("c2", "lookup"),
        ])]);
        let policy = ToolPolicy {
            max_tool_calls_per_turn: 1,
            ..Default::default()
        };
        let err = run(ProviderStage::new(provider, Some(registry()), policy))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Policy(_)));
    }

    #[tokio::test]
    async fn test_blocked_and_unknown_tools_become_error_results() {
        let provider = Scripted::new(vec![
            ProviderResponse::tool_calls(vec![call("c1", "lookup"), call("c2", "nope")]),
            ProviderResponse::text("done"),
        ]);
        let policy = ToolPolicy {
            blocklist: vec!["lookup".into()],
            ..Default::default()
        };
        let result = run(ProviderStage::new(provider.clone(), Some(registry()), policy))
            .await
            .unwrap();

        let tool_msgs: Vec<&Message> = result.messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_msgs.len(), 2);
        assert!(tool_msgs[0].tool_result.as_ref().unwrap().error.as_ref().unwrap().contains("blocked"));
        assert!(tool_msgs[1].tool_result.as_ref().unwrap().error.as_ref().unwrap().contains("unknown"));
        // blocked tools are never advertised
        assert!(provider.seen.lock().unwrap()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_surfaces() {
        let provider = Scripted::new(vec![]);
        let err = run(ProviderStage::new(provider, None, ToolPolicy::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Provider(_)));
    }
}
