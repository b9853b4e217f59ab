//! Context builder policy: budget, truncation strategy and relevance settings.

use crate::{Result, TurnError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How history is fitted into the token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationStrategy {
    /// Error out instead of dropping anything
    Fail,
    /// Drop the oldest removable messages first
    #[default]
    Oldest,
    /// Replace dropped messages with a summary in their place
    Summarize,
    /// Drop the messages least similar to the query first
    LeastRelevant,
}

impl FromStr for TruncationStrategy {
    type Err = TurnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "oldest" | "" => Ok(Self::Oldest),
            "summarize" => Ok(Self::Summarize),
            "least-relevant" | "least_relevant" | "relevance" => Ok(Self::LeastRelevant),
            other => Err(TurnError::Config(format!(
                "unknown truncation strategy '{other}' (expected fail, oldest, summarize, least-relevant)"
            ))),
        }
    }
}

impl fmt::Display for TruncationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::Oldest => "oldest",
            Self::Summarize => "summarize",
            Self::LeastRelevant => "least-relevant",
        })
    }
}

/// Where the relevance query text comes from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySource {
    /// Text of the most recent user message
    #[default]
    LastUser,
    /// The last N messages joined with spaces
    LastN(usize),
    /// A fixed query string
    Custom(String),
}

impl QuerySource {
    /// Parse `last_user`, `last_n` (with `last_n_count`) or `custom` (with `custom_query`)
    pub fn parse(name: &str, last_n_count: usize, custom_query: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "last_user" | "" => Ok(Self::LastUser),
            "last_n" => Ok(Self::LastN(if last_n_count == 0 { 3 } else { last_n_count })),
            "custom" => Ok(Self::Custom(custom_query.to_string())),
            other => Err(TurnError::Config(format!("unknown query source '{other}'"))),
        }
    }
}

/// Settings for the `least-relevant` strategy
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceConfig {
    /// Most recent non-system messages always kept
    pub min_recent_messages: usize,
    /// Candidates scoring below this are dropped even when they would fit; 0 disables it
    pub similarity_threshold: f32,
    pub query_source: QuerySource,
    pub always_keep_system_role: bool,
    /// Reuse embeddings for identical texts within one run
    pub cache_embeddings: bool,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            min_recent_messages: 3,
            similarity_threshold: 0.0,
            query_source: QuerySource::LastUser,
            always_keep_system_role: true,
            cache_embeddings: true,
        }
    }
}

/// Context builder policy
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPolicy {
    /// Total tokens for prompt plus response; 0 disables truncation
    pub token_budget: usize,
    /// Tokens held back for the model's answer
    pub reserve_for_output: usize,
    pub strategy: TruncationStrategy,
    /// Keep system-role messages under every strategy
    pub keep_system_role: bool,
    pub enable_cache_breakpoints: bool,
    pub relevance: Option<RelevanceConfig>,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            token_budget: 0,
            reserve_for_output: 0,
            strategy: TruncationStrategy::Oldest,
            keep_system_role: true,
            enable_cache_breakpoints: false,
            relevance: None,
        }
    }
}

impl ContextPolicy {
    pub fn with_budget(token_budget: usize, reserve_for_output: usize) -> Self {
        Self {
            token_budget,
            reserve_for_output,
            ..Default::default()
        }
    }

    pub fn strategy(mut self, strategy: TruncationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn relevance(mut self, relevance: RelevanceConfig) -> Self {
        self.relevance = Some(relevance);
        self
    }

    /// Whether system messages are protected for the active strategy
    pub fn protects_system_role(&self) -> bool {
        match (&self.strategy, &self.relevance) {
            (TruncationStrategy::LeastRelevant, Some(r)) => r.always_keep_system_role,
            _ => self.keep_system_role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("fail".parse::<TruncationStrategy>().unwrap(), TruncationStrategy::Fail);
        assert_eq!(
            "Least-Relevant".parse::<TruncationStrategy>().unwrap(),
            TruncationStrategy::LeastRelevant
        );
        assert_eq!(
            "relevance".parse::<TruncationStrategy>().unwrap(),
            TruncationStrategy::LeastRelevant
        );
        assert!(matches!(
            "random".parse::<TruncationStrategy>(),
            Err(TurnError::Config(_))
        ));
    }

    #[test]
    fn test_query_source_parsing() {
        assert_eq!(QuerySource::parse("last_n", 0, "").unwrap(), QuerySource::LastN(3));
        assert_eq!(
            QuerySource::parse("custom", 0, "billing").unwrap(),
            QuerySource::Custom("billing".into())
        );
        assert!(QuerySource::parse("first_user", 0, "").is_err());
    }
}
