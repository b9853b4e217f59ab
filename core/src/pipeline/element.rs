//! Stream elements: the unit of data passed between stages.

use crate::types::{Message, Metadata};
use crate::TurnError;
use serde_json::Value;
use std::sync::Arc;

/// Metadata keys shared between stages
pub mod keys {
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const USER_ID: &str = "user_id";
    pub const FROM_HISTORY: &str = "from_history";
    pub const TURN_INDEX: &str = "turn_index";
    pub const HISTORY_LENGTH: &str = "history_length";
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const ALLOWED_TOOLS: &str = "allowed_tools";
    pub const VARIABLES: &str = "variables";
    pub const CONTEXT_TRUNCATED: &str = "context_truncated";
    pub const CONTEXT_TOKENS: &str = "context_tokens";
    pub const CONTEXT_DROPPED: &str = "context_dropped";
    pub const CACHE_BREAKPOINTS: &str = "enable_cache_breakpoints";
    pub const FINISH_REASON: &str = "finish_reason";
    pub const TOKEN_COUNT: &str = "token_count";
    pub const ROUNDS: &str = "rounds";
    pub const TOOL_CALLS: &str = "tool_calls";
    pub const COST: &str = "cost";
    pub const GUARDRAILS_PASSED: &str = "guardrails_passed";
    pub const VALIDATIONS: &str = "validations";
    pub const ASSERTIONS: &str = "assertions";
}

/// One item flowing through the pipeline.
///
/// An element may carry a completed message, a partial text delta, metadata,
/// or a terminal error. Errors are shared so elements stay cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StreamElement {
    pub message: Option<Message>,
    pub text_delta: Option<String>,
    pub metadata: Metadata,
    pub error: Option<Arc<TurnError>>,
}

impl StreamElement {
    pub fn from_message(message: Message) -> Self {
        Self {
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text_delta: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn from_error(error: TurnError) -> Self {
        Self {
            error: Some(Arc::new(error)),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_from_history(&self) -> bool {
        self.metadata
            .get(keys::FROM_HISTORY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Take back ownership of an element error once no other element shares it
pub fn into_turn_error(error: Arc<TurnError>) -> TurnError {
    Arc::try_unwrap(error).unwrap_or_else(|shared| TurnError::Pipeline(shared.to_string()))
}

/// Merge `src` into `dst`, keeping existing keys unless `overwrite` is set
pub fn merge_metadata(dst: &mut Metadata, src: &Metadata, overwrite: bool) {
    for (k, v) in src {
        if overwrite || !dst.contains_key(k) {
            dst.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_flag() {
        let elem = StreamElement::from_message(Message::user("hi"));
        assert!(!elem.is_from_history());
        let elem = elem.with_metadata(keys::FROM_HISTORY, json!(true));
        assert!(elem.is_from_history());
    }

    #[test]
    fn test_error_round_trip() {
        let elem = StreamElement::from_error(TurnError::Policy("too many rounds".into()));
        assert!(elem.is_error());
        let err = into_turn_error(elem.error.unwrap());
        assert!(matches!(err, TurnError::Policy(_)));
    }

    #[test]
    fn test_merge_metadata_respects_overwrite() {
        let mut dst = Metadata::new();
        dst.insert("a".into(), json!(1));
        let mut src = Metadata::new();
        src.insert("a".into(), json!(2));
        src.insert("b".into(), json!(3));

        merge_metadata(&mut dst, &src, false);
        assert_eq!(dst["a"], json!(1));
        assert_eq!(dst["b"], json!(3));

        merge_metadata(&mut dst, &src, true);
        assert_eq!(dst["a"], json!(2));
    }
}
