//! Guardrail validators: checks on assistant output that are recorded, never enforced.

use crate::pipeline::{keys, Stage, StageInput, StageOutput};
use crate::types::{Message, Role};
use crate::{Result, TurnError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Declarative validator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorSpec {
    /// Case-insensitive whole-word matches fail the check
    BannedWords { words: Vec<String> },
    MaxSentences { max_sentences: usize },
    /// Token count is estimated as characters / 4
    Length {
        #[serde(default)]
        max_characters: Option<usize>,
        #[serde(default)]
        max_tokens: Option<usize>,
    },
    /// Substrings that must all appear
    RequiredFields { required_fields: Vec<String> },
    /// Output must read like a commitment ("decision", "next step", "commit")
    /// and mention every field, case-insensitively
    Commit { commit_fields: Vec<String> },
}

impl ValidatorSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ValidatorSpec::BannedWords { .. } => "banned_words",
            ValidatorSpec::MaxSentences { .. } => "max_sentences",
            ValidatorSpec::Length { .. } => "length",
            ValidatorSpec::RequiredFields { .. } => "required_fields",
            ValidatorSpec::Commit { .. } => "commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validator: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// A validator with its patterns compiled
#[derive(Debug, Clone)]
pub struct Validator {
    spec: ValidatorSpec,
    banned: Vec<(String, Regex)>,
    sentence_splitter: Regex,
}

impl Validator {
    pub fn compile(spec: ValidatorSpec) -> Result<Self> {
        let banned = match &spec {
            ValidatorSpec::BannedWords { words } => words
                .iter()
                .map(|w| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(w)))
                        .map(|re| (w.clone(), re))
                        .map_err(|e| TurnError::Config(format!("banned word '{w}': {e}")))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        let sentence_splitter =
            Regex::new(r"[.!?]+").map_err(|e| TurnError::Config(format!("sentence splitter: {e}")))?;
        Ok(Self {
            spec,
            banned,
            sentence_splitter,
        })
    }

    pub fn count_sentences(&self, content: &str) -> usize {
        self.sentence_splitter
            .split(content)
            .filter(|s| !s.trim().is_empty())
            .count()
    }

    pub fn spec(&self) -> &ValidatorSpec {
        &self.spec
    }

    pub fn validate(&self, content: &str) -> ValidationResult {
        let (ok, details) = match &self.spec {
            ValidatorSpec::BannedWords { .. } => {
                let violations: Vec<&str> = self
                    .banned
                    .iter()
                    .filter(|(_, re)| re.is_match(content))
                    .map(|(w, _)| w.as_str())
                    .collect();
                (violations.is_empty(), json!(violations))
            }
            ValidatorSpec::MaxSentences { max_sentences } => {
                let count = self.count_sentences(content);
                (count <= *max_sentences, json!({ "count": count, "max": max_sentences }))
            }
            ValidatorSpec::Length {
                max_characters,
                max_tokens,
            } => {
                let mut ok = true;
                let mut details = serde_json::Map::new();
                if let Some(max) = max_characters {
                    let count = content.chars().count();
                    ok &= count <= *max;
                    details.insert("character_count".into(), json!(count));
                    details.insert("max_characters".into(), json!(max));
                }
                if let Some(max) = max_tokens {
                    let count = content.chars().count() / 4;
                    ok &= count <= *max;
                    details.insert("token_count".into(), json!(count));
                    details.insert("max_tokens".into(), json!(max));
                }
                (ok, Value::Object(details))
            }
            ValidatorSpec::RequiredFields { required_fields } => {
                let missing: Vec<&String> = required_fields
                    .iter()
                    .filter(|f| !content.contains(f.as_str()))
                    .collect();
                (missing.is_empty(), json!({ "missing": missing }))
            }
            ValidatorSpec::Commit { commit_fields } => {
                let lower = content.to_lowercase();
                if !["decision", "next step", "commit"].iter().any(|k| lower.contains(k)) {
                    (false, json!({ "error": "missing commit structure" }))
                } else {
                    let missing: Vec<&String> = commit_fields
                        .iter()
                        .filter(|f| !lower.contains(&f.to_lowercase()))
                        .collect();
                    (missing.is_empty(), json!({ "missing_fields": missing }))
                }
            }
        };
        ValidationResult {
            validator: self.spec.name().to_string(),
            ok,
            details,
        }
    }
}

/// Runs validators over each final assistant message of the turn.
///
/// Results go to the message meta under `validations`; the element gets
/// `guardrails_passed`. Failures are logged and never stop the turn.
pub struct GuardrailStage {
    validators: Vec<Validator>,
}

impl GuardrailStage {
    pub fn new(specs: Vec<ValidatorSpec>) -> Result<Self> {
        let validators = specs
            .into_iter()
            .map(Validator::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { validators })
    }

    fn applies_to(message: &Message) -> bool {
        message.role == Role::Assistant && message.tool_calls.is_empty()
    }
}

#[async_trait]
impl Stage for GuardrailStage {
    fn name(&self) -> &str {
        "guardrails"
    }

    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        while let Some(mut elem) = input.recv().await {
            let from_history = elem.is_from_history();
            let mut passed = None;
            if let Some(msg) = elem.message.as_mut().filter(|m| !from_history && Self::applies_to(m)) {
                let content = msg.text();
                let results: Vec<ValidationResult> =
                    self.validators.iter().map(|v| v.validate(&content)).collect();
                let all_ok = results.iter().all(|r| r.ok);
                for failed in results.iter().filter(|r| !r.ok) {
                    warn!(target: "guardrails", validator = %failed.validator, details = %failed.details, "Guardrail check failed");
                }
                debug!(target: "guardrails", checks = results.len(), passed = all_ok, "Guardrails evaluated");
                msg.meta.insert(keys::VALIDATIONS.into(), serde_json::to_value(&results)?);
                passed = Some(all_ok);
            }
            if let Some(all_ok) = passed {
                elem.metadata.insert(keys::GUARDRAILS_PASSED.into(), json!(all_ok));
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, StreamElement};

    fn check(spec: ValidatorSpec, content: &str) -> ValidationResult {
        Validator::compile(spec).unwrap().validate(content)
    }

    #[test]
    fn test_every_validator_compiles_its_sentence_splitter() {
        let validator = Validator::compile(ValidatorSpec::RequiredFields {
            required_fields: vec!["id".into()],
        })
        .unwrap();
        assert_eq!(validator.count_sentences("First! Second? third"), 3);
    }

    #[test]
    fn test_banned_words_match_whole_words_only() {
        let spec = ValidatorSpec::BannedWords {
            words: vec!["darn".into()],
        };
        let r = check(spec.clone(), "Well, DARN it.");
        assert!(!r.ok);
        assert_eq!(r.details, json!(["darn"]));
        assert!(check(spec, "darnation is fine").ok);
    }

    #[test]
    fn test_sentence_and_length_limits() {
        let validator = Validator::compile(ValidatorSpec::MaxSentences { max_sentences: 2 }).unwrap();
        assert_eq!(validator.count_sentences("One. Two!! Three? "), 3);
        assert_eq!(validator.count_sentences("   "), 0);
        assert!(!check(ValidatorSpec::MaxSentences { max_sentences: 2 }, "A. B. C.").ok);

        let r = check(
            ValidatorSpec::Length {
                max_characters: Some(100),
                max_tokens: Some(2),
            },
            "twelve chars",
        );
        assert!(!r.ok);
        assert_eq!(r.details["token_count"], json!(3));
        assert_eq!(r.details["character_count"], json!(12));
    }

    #[test]
    fn test_required_and_commit_fields() {
        let r = check(
            ValidatorSpec::RequiredFields {
                required_fields: vec!["name".into(), "date".into()],
            },
            "name: x",
        );
        assert_eq!(r.details["missing"], json!(["date"]));

        let commit = ValidatorSpec::Commit {
            commit_fields: vec!["Owner".into()],
        };
        assert!(!check(commit.clone(), "owner is bob").ok);
        assert!(check(commit, "Decision: ship it. owner: bob").ok);
    }

    #[test]
    fn test_specs_parse_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            validators: Vec<ValidatorSpec>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[validators]]
            type = "banned_words"
            words = ["foo"]

            [[validators]]
            type = "length"
            max_characters = 10
            "#,
        )
        .unwrap();
        assert_eq!(doc.validators[1].name(), "length");
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_fatal() {
        let stage = GuardrailStage::new(vec![ValidatorSpec::BannedWords {
            words: vec!["secret".into()],
        }])
        .unwrap();
        let pipeline = Pipeline::builder().stage(stage).build().unwrap();
        let result = pipeline
            .execute_sync(StreamElement::from_message(Message::assistant("the secret is out")))
            .await
            .unwrap();

        assert_eq!(result.metadata[keys::GUARDRAILS_PASSED], json!(false));
        let recorded = &result.messages[0].meta[keys::VALIDATIONS];
        assert_eq!(recorded[0]["validator"], json!("banned_words"));
        assert_eq!(recorded[0]["ok"], json!(false));
    }
}
