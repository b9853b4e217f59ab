use crate::{Result, TurnError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the model should use tools
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Let the model decide whether to call a tool
    #[default]
    Auto,
    /// The model must call a tool on the first round
    Required,
    /// Do not expose tools to the model
    None,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::Required => "required",
            ToolChoice::None => "none",
        }
    }
}

impl FromStr for ToolChoice {
    type Err = TurnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "required" | "any" => Ok(Self::Required),
            "none" => Ok(Self::None),
            other => Err(TurnError::Config(format!("unknown tool choice '{other}'"))),
        }
    }
}

/// Limits on the tool-calling loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPolicy {
    pub tool_choice: ToolChoice,
    /// Provider invocations per turn; 0 = unlimited
    pub max_rounds: usize,
    /// Tool calls per turn across all rounds; 0 = unlimited
    pub max_tool_calls_per_turn: usize,
    pub blocklist: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            tool_choice: ToolChoice::Auto,
            max_rounds: 10,
            max_tool_calls_per_turn: 0,
            blocklist: Vec::new(),
        }
    }
}

impl ToolPolicy {
    pub fn is_blocked(&self, tool: &str) -> bool {
        self.blocklist.iter().any(|b| b == tool)
    }

    /// Tool choice for a given round (1-based); later rounds always use `auto`
    pub fn choice_for_round(&self, round: usize) -> ToolChoice {
        match self.tool_choice {
            ToolChoice::None => ToolChoice::None,
            choice if round <= 1 => choice,
            _ => ToolChoice::Auto,
        }
    }
}
