//! Token Counting
//!
//! Provides token estimates for context window budgeting.

use crate::types::Message;
use std::sync::Arc;

/// Per-message framing overhead (role markers, separators)
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token counting interface for different LLM models
pub trait TokenCounter: Send + Sync {
    /// Count tokens in text
    fn count_text(&self, text: &str) -> usize;

    /// Estimate tokens for JSON content (conservative estimate)
    fn count_json(&self, json: &serde_json::Value) -> usize {
        self.count_text(&json.to_string())
    }

    /// Estimate tokens for a whole message, including tool-call arguments
    fn count_message(&self, message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD_TOKENS + self.count_text(&message.text());
        for call in &message.tool_calls {
            tokens += self.count_text(&call.name) + self.count_json(&call.arguments);
        }
        tokens
    }
}

/// Character-based estimator.
///
/// Uses a chars-per-token ratio per model family plus a 10% buffer for special
/// tokens; JSON is counted at a denser 3 chars/token.
pub struct HeuristicTokenCounter {
    model: String,
}

impl HeuristicTokenCounter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    fn chars_per_token(&self) -> f32 {
        if self.model.contains("gpt-4") || self.model.contains("claude") {
            4.0
        } else {
            3.5
        }
    }
}

impl Default for HeuristicTokenCounter {
    fn default() -> Self {
        Self::new("gpt-4")
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        let base_estimate = (text.len() as f32 / self.chars_per_token()).ceil() as usize;
        base_estimate + (base_estimate / 10)
    }

    fn count_json(&self, json: &serde_json::Value) -> usize {
        let json_str = json.to_string();
        let base_estimate = (json_str.len() as f32 / 3.0).ceil() as usize;
        base_estimate + (base_estimate / 10)
    }
}

/// Create a shared token counter for a model
pub fn create_counter(model: &str) -> Arc<dyn TokenCounter> {
    Arc::new(HeuristicTokenCounter::new(model))
}
