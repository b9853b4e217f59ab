//! General-purpose stages: variable injection, prompt assembly and templating.

use super::element::{keys, StreamElement};
use super::stage::{forward_all, Stage, StageInput, StageOutput};
use crate::types::{ContentPart, Metadata};
use crate::{Result, TurnError};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Prompt used when no registry entry exists for the task type
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Forwards everything unchanged
pub struct PassthroughStage;

#[async_trait]
impl Stage for PassthroughStage {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        forward_all(&mut input, &output).await
    }
}

/// Merges per-turn variables and metadata into every element
pub struct VariableInjectionStage {
    variables: HashMap<String, String>,
    metadata: Metadata,
}

impl VariableInjectionStage {
    pub fn new(variables: HashMap<String, String>, metadata: Metadata) -> Self {
        Self {
            variables,
            metadata,
        }
    }
}

#[async_trait]
impl Stage for VariableInjectionStage {
    fn name(&self) -> &str {
        "variable_injection"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        while let Some(mut elem) = input.recv().await {
            let mut vars = element_variables(&elem);
            for (k, v) in &self.variables {
                vars.insert(k.clone(), v.clone());
            }
            elem.metadata.insert(keys::VARIABLES.into(), json!(vars));
            for (k, v) in &self.metadata {
                elem.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

/// A resolved prompt: system text plus the tools the task may use
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
}

/// Resolves a task type and variables into a system prompt
pub trait PromptRegistry: Send + Sync {
    fn assemble(
        &self,
        task_type: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Option<AssembledPrompt>>;
}

/// In-memory registry keyed by task type; prompts are rendered as templates
#[derive(Default)]
pub struct StaticPromptRegistry {
    prompts: HashMap<String, AssembledPrompt>,
}

impl StaticPromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(
        mut self,
        task_type: impl Into<String>,
        system_prompt: impl Into<String>,
        allowed_tools: Vec<String>,
    ) -> Self {
        self.prompts.insert(
            task_type.into(),
            AssembledPrompt {
                system_prompt: system_prompt.into(),
                allowed_tools,
            },
        );
        self
    }
}

impl PromptRegistry for StaticPromptRegistry {
    fn assemble(
        &self,
        task_type: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Option<AssembledPrompt>> {
        let Some(p) = self.prompts.get(task_type) else {
            return Ok(None);
        };
        Ok(Some(AssembledPrompt {
            system_prompt: render_template(&p.system_prompt, variables)?,
            allowed_tools: p.allowed_tools.clone(),
        }))
    }
}

/// Attaches the system prompt and allowed tools for the turn's task type
pub struct PromptAssemblyStage {
    registry: Option<Arc<dyn PromptRegistry>>,
    task_type: String,
}

impl PromptAssemblyStage {
    pub fn new(registry: Option<Arc<dyn PromptRegistry>>, task_type: impl Into<String>) -> Self {
        Self {
            registry,
            task_type: task_type.into(),
        }
    }

    fn assemble(&self, variables: &HashMap<String, String>) -> Result<AssembledPrompt> {
        let Some(registry) = &self.registry else {
            return Ok(AssembledPrompt {
                system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
                allowed_tools: Vec::new(),
            });
        };
        match registry.assemble(&self.task_type, variables)? {
            Some(prompt) => Ok(prompt),
            None => {
                debug!(target: "prompt_assembly", task_type = %self.task_type, "No prompt registered; using default");
                Ok(AssembledPrompt {
                    system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
                    allowed_tools: Vec::new(),
                })
            }
        }
    }
}

#[async_trait]
impl Stage for PromptAssemblyStage {
    fn name(&self) -> &str {
        "prompt_assembly"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let mut assembled: Option<AssembledPrompt> = None;
        while let Some(mut elem) = input.recv().await {
            if assembled.is_none() {
                let prompt = self.assemble(&element_variables(&elem)).map_err(|e| {
                    TurnError::Config(format!("prompt assembly for '{}' failed: {e}", self.task_type))
                })?;
                debug!(
                    target: "prompt_assembly",
                    task_type = %self.task_type,
                    tools = prompt.allowed_tools.len(),
                    "Prompt assembled"
                );
                assembled = Some(prompt);
            }
            if let Some(prompt) = &assembled {
                elem.metadata
                    .insert(keys::SYSTEM_PROMPT.into(), json!(prompt.system_prompt));
                elem.metadata
                    .insert(keys::ALLOWED_TOOLS.into(), json!(prompt.allowed_tools));
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

/// Substitutes `{{name}}` variables in the system prompt and this turn's messages
pub struct TemplateStage;

#[async_trait]
impl Stage for TemplateStage {
    fn name(&self) -> &str {
        "template"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        while let Some(mut elem) = input.recv().await {
            let vars = element_variables(&elem);
            if !vars.is_empty() {
                if let Some(prompt) = elem.metadata_str(keys::SYSTEM_PROMPT) {
                    let rendered = render_template(prompt, &vars)?;
                    elem.metadata
                        .insert(keys::SYSTEM_PROMPT.into(), Value::String(rendered));
                }
                if !elem.is_from_history() {
                    if let Some(msg) = elem.message.as_mut() {
                        msg.content = render_template(&msg.content, &vars)?;
                        for part in msg.parts.iter_mut() {
                            if let ContentPart::Text { text } = part {
                                *text = render_template(text, &vars)?;
                            }
                        }
                    }
                }
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

fn template_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")
        .map_err(|e| TurnError::Config(format!("template pattern: {e}")))?;
    Ok(PATTERN.get_or_init(|| re))
}

/// Replace `{{ name }}` occurrences with values from `vars`; unknown names are left intact
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let re = template_pattern()?;
    Ok(re
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned())
}

/// Variables attached to an element as a string map
pub fn element_variables(elem: &StreamElement) -> HashMap<String, String> {
    elem.metadata
        .get(keys::VARIABLES)
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::types::Message;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_template() {
        let v = vars(&[("name", "Ada"), ("topic", "engines")]);
        assert_eq!(
            render_template("Hi {{name}}, let's talk {{ topic }} and {{unknown}}", &v).unwrap(),
            "Hi Ada, let's talk engines and {{unknown}}"
        );
    }

    #[tokio::test]
    async fn test_prompt_assembly_with_variables() {
        let registry = StaticPromptRegistry::new().with_prompt(
            "support",
            "You help {{customer}} with billing.",
            vec!["lookup_invoice".into()],
        );
        let pipeline = Pipeline::builder()
            .stage(VariableInjectionStage::new(
                vars(&[("customer", "Acme"), ("product", "widgets")]),
                Metadata::new(),
            ))
            .stage(PromptAssemblyStage::new(Some(Arc::new(registry)), "support"))
            .stage(TemplateStage)
            .build()
            .unwrap();

        let result = pipeline
            .execute_sync(StreamElement::from_message(Message::user(
                "Tell me about {{product}}",
            )))
            .await
            .unwrap();

        assert_eq!(
            result.metadata[keys::SYSTEM_PROMPT],
            json!("You help Acme with billing.")
        );
        assert_eq!(result.metadata[keys::ALLOWED_TOOLS], json!(["lookup_invoice"]));
        assert_eq!(result.messages[0].content, "Tell me about widgets");
    }

    #[tokio::test]
    async fn test_unknown_task_type_uses_default_prompt() {
        let pipeline = Pipeline::builder()
            .stage(PromptAssemblyStage::new(
                Some(Arc::new(StaticPromptRegistry::new())),
                "missing",
            ))
            .build()
            .unwrap();
        let result = pipeline
            .execute_sync(StreamElement::from_message(Message::user("hi")))
            .await
            .unwrap();
        assert_eq!(
            result.metadata[keys::SYSTEM_PROMPT],
            json!(DEFAULT_SYSTEM_PROMPT)
        );
    }
}
