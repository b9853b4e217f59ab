use std::fs;
use std::path::Path;

use loom_turn::validation::{AssertionConfig, ValidatorSpec};

/// Per-run settings for the turn runner; pipeline settings live in loom_turn.toml
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub conversation_id: String,
    pub user_id: String,
    pub task_type: String,
    pub system_prompt: String,
    /// Print text deltas as they arrive instead of waiting for the turn
    pub stream: bool,
    pub validators: Vec<ValidatorSpec>,
    pub assertions: Vec<AssertionConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            conversation_id: env_or("TURN_RUNNER_CONVERSATION", "local"),
            user_id: env_or("TURN_RUNNER_USER", "cli"),
            task_type: env_or("TURN_RUNNER_TASK", "assistant"),
            system_prompt: env_or(
                "TURN_RUNNER_SYSTEM_PROMPT",
                "You are a helpful and concise assistant. Answer briefly and clearly.",
            ),
            stream: std::env::var("TURN_RUNNER_STREAM")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            validators: Vec::new(),
            assertions: Vec::new(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl RunnerConfig {
    /// Overlay `TURN_RUNNER_CONFIG` (or ./turn_runner.toml) onto env-driven defaults
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("TURN_RUNNER_CONFIG").unwrap_or_else(|_| "turn_runner.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "turn_runner", path = %path, "No runner TOML found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<RunnerToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "turn_runner", error = %e, "Failed to parse runner TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "turn_runner", error = %e, "Failed to read runner TOML; using defaults");
                default
            }
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RunnerToml {
    conversation_id: Option<String>,
    user_id: Option<String>,
    task_type: Option<String>,
    system_prompt: Option<String>,
    stream: Option<bool>,
    #[serde(default)]
    validators: Vec<ValidatorSpec>,
    #[serde(default)]
    assertions: Vec<AssertionConfig>,
}

impl RunnerToml {
    fn overlay(self, mut base: RunnerConfig) -> RunnerConfig {
        if let Some(x) = self.conversation_id {
            base.conversation_id = x;
        }
        if let Some(x) = self.user_id {
            base.user_id = x;
        }
        if let Some(x) = self.task_type {
            base.task_type = x;
        }
        if let Some(x) = self.system_prompt {
            base.system_prompt = x;
        }
        if let Some(x) = self.stream {
            base.stream = x;
        }
        if !self.validators.is_empty() {
            base.validators = self.validators;
        }
        if !self.assertions.is_empty() {
            base.assertions = self.assertions;
        }
        base
    }
}
