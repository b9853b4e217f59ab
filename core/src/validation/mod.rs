//! Output checks on the assistant's answer
//!
//! - guardrail validators, recorded under `validations` and never fatal
//! - scenario assertions, recorded under `assertions` before the save and
//!   enforced by `AssertionVerdictStage` after it

pub mod assertion;
pub mod guardrail;

pub use assertion::{
    assertion_summary, AssertionConfig, AssertionKind, AssertionResult, AssertionStage,
    AssertionVerdictStage, TurnView,
};
pub use guardrail::{GuardrailStage, ValidationResult, Validator, ValidatorSpec};
