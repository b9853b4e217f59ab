//! Staged execution engine
//!
//! - `StreamElement`: unit of data passed between stages
//! - `Stage`: processing contract every stage implements
//! - `Pipeline`: ordered composition run as concurrent tasks over bounded queues
//! - utility stages for variables, prompt assembly and templating

pub mod element;
pub mod engine;
pub mod stage;
pub mod stages;

pub use element::{keys, merge_metadata, StreamElement};
pub use engine::{ExecutionResult, Pipeline, PipelineBuilder, PipelineConfig, PipelineStream};
pub use stage::{forward_all, stage_harness, Stage, StageInput, StageKind, StageOutput};
pub use stages::{
    render_template, AssembledPrompt, PassthroughStage, PromptAssemblyStage, PromptRegistry,
    StaticPromptRegistry, TemplateStage, VariableInjectionStage, DEFAULT_SYSTEM_PROMPT,
};
