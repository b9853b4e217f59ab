//! Scenario assertions over the turn's final assistant message.

use crate::pipeline::{keys, Stage, StageInput, StageKind, StageOutput, StreamElement};
use crate::types::{Message, Role};
use crate::{Result, TurnError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssertionKind {
    /// Every pattern appears, case-insensitively
    ContentIncludes { patterns: Vec<String> },
    /// No pattern appears, case-insensitively
    ContentExcludes { patterns: Vec<String> },
    ContentMatches { pattern: String },
    ToolsCalled { tools: Vec<String> },
    ToolsNotCalled { tools: Vec<String> },
    MinLength { min: usize },
    MaxLength { max: usize },
}

impl AssertionKind {
    pub fn name(&self) -> &'static str {
        match self {
            AssertionKind::ContentIncludes { .. } => "content_includes",
            AssertionKind::ContentExcludes { .. } => "content_excludes",
            AssertionKind::ContentMatches { .. } => "content_matches",
            AssertionKind::ToolsCalled { .. } => "tools_called",
            AssertionKind::ToolsNotCalled { .. } => "tools_not_called",
            AssertionKind::MinLength { .. } => "min_length",
            AssertionKind::MaxLength { .. } => "max_length",
        }
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionConfig {
    #[serde(flatten)]
    pub kind: AssertionKind,
    #[serde(default)]
    pub message: String,
    /// A failing required assertion fails the turn
    #[serde(default = "default_required")]
    pub required: bool,
}

impl AssertionConfig {
    pub fn new(kind: AssertionKind) -> Self {
        Self {
            kind,
            message: String::new(),
            required: true,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub required: bool,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub message: String,
}

/// What assertions are evaluated against
#[derive(Debug, Clone, Default)]
pub struct TurnView {
    pub content: String,
    pub tools_called: Vec<String>,
}

impl TurnView {
    /// Final assistant text plus every tool the turn's assistant messages requested
    pub fn from_messages<'a>(turn: impl IntoIterator<Item = &'a Message>) -> Option<Self> {
        let mut view = TurnView::default();
        let mut saw_assistant = false;
        for msg in turn.into_iter().filter(|m| m.role == Role::Assistant) {
            view.tools_called
                .extend(msg.tool_calls.iter().map(|c| c.name.clone()));
            view.content = msg.text();
            saw_assistant = true;
        }
        saw_assistant.then_some(view)
    }
}

struct CompiledAssertion {
    config: AssertionConfig,
    regex: Option<Regex>,
}

impl CompiledAssertion {
    fn compile(config: AssertionConfig) -> Result<Self> {
        let regex = match &config.kind {
            AssertionKind::ContentMatches { pattern } => Some(
                Regex::new(pattern)
                    .map_err(|e| TurnError::Config(format!("content_matches pattern '{pattern}': {e}")))?,
            ),
            _ => None,
        };
        Ok(Self { config, regex })
    }

    fn evaluate(&self, view: &TurnView) -> AssertionResult {
        let lower = view.content.to_lowercase();
        let (passed, details) = match &self.config.kind {
            AssertionKind::ContentIncludes { patterns } => {
                let missing: Vec<&String> = patterns
                    .iter()
                    .filter(|p| !lower.contains(&p.to_lowercase()))
                    .collect();
                (missing.is_empty(), json!({ "missing": missing }))
            }
            AssertionKind::ContentExcludes { patterns } => {
                let found: Vec<&String> = patterns
                    .iter()
                    .filter(|p| lower.contains(&p.to_lowercase()))
                    .collect();
                (found.is_empty(), json!({ "found": found }))
            }
            AssertionKind::ContentMatches { pattern } => {
                let matched = self.regex.as_ref().is_some_and(|re| re.is_match(&view.content));
                (matched, json!({ "pattern": pattern }))
            }
            AssertionKind::ToolsCalled { tools } => {
                let missing: Vec<&String> = tools
                    .iter()
                    .filter(|t| !view.tools_called.contains(t))
                    .collect();
                (missing.is_empty(), json!({ "missing": missing, "called": view.tools_called }))
            }
            AssertionKind::ToolsNotCalled { tools } => {
                let called: Vec<&String> = tools
                    .iter()
                    .filter(|t| view.tools_called.contains(t))
                    .collect();
                (called.is_empty(), json!({ "forbidden_called": called }))
            }
            AssertionKind::MinLength { min } => {
                let length = view.content.chars().count();
                (length >= *min, json!({ "length": length, "min": min }))
            }
            AssertionKind::MaxLength { max } => {
                let length = view.content.chars().count();
                (length <= *max, json!({ "length": length, "max": max }))
            }
        };
        AssertionResult {
            kind: self.config.kind.name().to_string(),
            passed,
            required: self.config.required,
            details,
            message: self.config.message.clone(),
        }
    }
}

/// Summary written to message meta under `assertions`
pub fn assertion_summary(results: &[AssertionResult]) -> Value {
    let failed = results.iter().filter(|r| !r.passed).count();
    json!({
        "results": results,
        "passed": failed == 0,
        "total": results.len(),
        "failed": failed,
    })
}

/// Evaluates assertions and records the results on the last assistant
/// message of the turn. It does not fail the turn itself; see
/// [`AssertionVerdictStage`], which runs after the state is saved.
pub struct AssertionStage {
    assertions: Vec<CompiledAssertion>,
}

impl AssertionStage {
    pub fn new(configs: Vec<AssertionConfig>) -> Result<Self> {
        let assertions = configs
            .into_iter()
            .map(CompiledAssertion::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { assertions })
    }

    pub fn evaluate(&self, view: &TurnView) -> Vec<AssertionResult> {
        self.assertions.iter().map(|a| a.evaluate(view)).collect()
    }

    fn last_turn_assistant(elements: &[StreamElement]) -> Option<usize> {
        elements.iter().rposition(|e| {
            !e.is_from_history() && e.message.as_ref().is_some_and(|m| m.role == Role::Assistant)
        })
    }
}

#[async_trait]
impl Stage for AssertionStage {
    fn name(&self) -> &str {
        "assertions"
    }

    fn kind(&self) -> StageKind {
        StageKind::Accumulate
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        if self.assertions.is_empty() {
            while let Some(elem) = input.recv().await {
                output.send(elem).await?;
            }
            return Ok(());
        }

        let mut elements = input.collect_messages(&output).await?;
        if input.is_halted() {
            return output.send_all(elements).await;
        }

        let view = TurnView::from_messages(
            elements
                .iter()
                .filter(|e| !e.is_from_history())
                .filter_map(|e| e.message.as_ref()),
        );
        match (view, Self::last_turn_assistant(&elements)) {
            (Some(view), Some(idx)) => {
                let results = self.evaluate(&view);
                let failed = results.iter().filter(|r| !r.passed).count();
                for r in results.iter().filter(|r| !r.passed) {
                    warn!(target: "assertions", assertion = %r.kind, required = r.required, message = %r.message, "Assertion failed");
                }
                info!(target: "assertions", total = results.len(), failed, "Assertions evaluated");
                if let Some(msg) = elements[idx].message.as_mut() {
                    msg.meta.insert(keys::ASSERTIONS.into(), assertion_summary(&results));
                }
            }
            _ => debug!(target: "assertions", "No assistant message in turn; assertions skipped"),
        }

        output.send_all(elements).await
    }
}

/// Fails the turn when a recorded required assertion did not pass.
///
/// Runs after the state store save so the failing message is persisted first.
pub struct AssertionVerdictStage;

impl AssertionVerdictStage {
    fn failures(message: &Message) -> Vec<String> {
        let Some(results) = message
            .meta
            .get(keys::ASSERTIONS)
            .and_then(|s| s.get("results"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };
        results
            .iter()
            .filter_map(|r| serde_json::from_value::<AssertionResult>(r.clone()).ok())
            .filter(|r| r.required && !r.passed)
            .map(|r| {
                if r.message.is_empty() {
                    format!("{} ({})", r.kind, r.details)
                } else {
                    format!("{}: {}", r.kind, r.message)
                }
            })
            .collect()
    }
}

#[async_trait]
impl Stage for AssertionVerdictStage {
    fn name(&self) -> &str {
        "assertion_verdict"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(elem) = input.recv().await {
            if let Some(msg) = elem.message.as_ref().filter(|_| !elem.is_from_history()) {
                failures.extend(Self::failures(msg));
            }
            output.send(elem).await?;
        }
        if failures.is_empty() {
            return Ok(());
        }
        Err(TurnError::AssertionFailed(failures.join("; ")))
    }
}
