// Loom Turn Library
// Staged execution of one conversational turn: state, context, provider, media, assertions

pub mod config;
pub mod context;
pub mod media;
pub mod pipeline;
pub mod provider;
pub mod state;
pub mod tools;
pub mod turn;
pub mod types;
pub mod validation;

// Export core types
pub use config::RuntimeConfig;
pub use media::{MediaError, MediaErrorKind};
pub use pipeline::{ExecutionResult, Pipeline, PipelineConfig, PipelineStream, Stage, StreamElement};
pub use tools::{ToolError, ToolRegistry};
pub use turn::{TurnConfig, TurnOutcome, TurnPipeline, TurnServices};
pub use types::{ContentPart, ConversationState, Message, Role};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Context exceeds token budget: required {required} tokens, {available} available")]
    BudgetExceeded { required: usize, available: usize },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TurnError>;
