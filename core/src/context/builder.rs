//! Context Window Builder
//!
//! Chooses which history messages are sent to the provider so the prompt fits
//! `token_budget - reserve_for_output - system_prompt_tokens`.
//!
//! Messages of the current turn are never dropped. System messages are kept
//! when the policy says so. If the protected set alone does not fit, the
//! builder returns a best-effort window instead of looping: the current turn
//! plus as many of the most recent other protected messages as fit.

use super::policy::{ContextPolicy, TruncationStrategy};
use super::relevance::{build_query, cosine_similarity, EmbeddingCache, EmbeddingProvider};
use super::token_counter::TokenCounter;
use crate::types::{Message, Role, SOURCE_SUMMARY};
use crate::{Result, TurnError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_SUMMARY_ATTEMPTS: usize = 3;

/// Condenses evicted messages into one summary text
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Outcome of fitting messages into the window
#[derive(Debug, Clone)]
pub struct WindowSelection {
    /// One flag per input message
    pub keep: Vec<bool>,
    /// Summary message and the input index it stands in for
    pub summary: Option<(usize, Message)>,
    pub tokens_used: usize,
    /// Tokens available for messages; `None` when unlimited
    pub available: Option<usize>,
    pub truncated: bool,
    /// The current turn alone exceeded the budget
    pub over_budget: bool,
}

impl WindowSelection {
    fn keep_all(count: usize, tokens_used: usize, available: Option<usize>) -> Self {
        Self {
            keep: vec![true; count],
            summary: None,
            tokens_used,
            available,
            truncated: false,
            over_budget: false,
        }
    }

    pub fn dropped(&self) -> usize {
        self.keep.iter().filter(|k| !**k).count()
    }

    /// Selected messages in conversation order, summary in place of what it replaced
    pub fn messages(&self, original: &[Message]) -> Vec<Message> {
        let mut out = Vec::new();
        for (i, msg) in original.iter().enumerate() {
            if let Some((at, summary)) = &self.summary {
                if *at == i {
                    out.push(summary.clone());
                }
            }
            if self.keep.get(i).copied().unwrap_or(false) {
                out.push(msg.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    tokens: usize,
    protected: bool,
    current: bool,
}

/// Builds the context window for one turn under a fixed policy
pub struct ContextWindowBuilder {
    policy: ContextPolicy,
    counter: Arc<dyn TokenCounter>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextWindowBuilder {
    pub fn new(policy: ContextPolicy, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            policy,
            counter,
            embedder: None,
            summarizer: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn policy(&self) -> &ContextPolicy {
        &self.policy
    }

    /// Check that the strategy has the collaborators it needs
    pub fn validate(&self) -> Result<()> {
        match self.policy.strategy {
            TruncationStrategy::Summarize if self.summarizer.is_none() => Err(TurnError::Config(
                "summarize strategy requires a summarizer".into(),
            )),
            TruncationStrategy::LeastRelevant if self.embedder.is_none() => Err(TurnError::Config(
                "least-relevant strategy requires an embedding provider".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Fit `messages` into the budget left after `system_prompt`
    pub async fn select(&self, messages: &[Message], system_prompt: &str) -> Result<WindowSelection> {
        let entries = self.entries(messages);
        let total: usize = entries.iter().map(|e| e.tokens).sum();

        if self.policy.token_budget == 0 {
            return Ok(WindowSelection::keep_all(messages.len(), total, None));
        }

        let system_tokens = self.counter.count_text(system_prompt);
        let overhead = self.policy.reserve_for_output + system_tokens;
        if overhead >= self.policy.token_budget {
            return Err(TurnError::BudgetExceeded {
                required: overhead,
                available: self.policy.token_budget,
            });
        }
        let available = self.policy.token_budget - overhead;

        if total <= available {
            return Ok(WindowSelection::keep_all(messages.len(), total, Some(available)));
        }

        debug!(
            target: "context_builder",
            strategy = %self.policy.strategy,
            total,
            available,
            "History exceeds budget"
        );

        let selection = match self.policy.strategy {
            TruncationStrategy::Fail => {
                return Err(TurnError::BudgetExceeded {
                    required: total,
                    available,
                })
            }
            TruncationStrategy::Oldest => self.truncate_oldest(&entries, available),
            TruncationStrategy::Summarize => self.summarize(messages, &entries, available).await?,
            TruncationStrategy::LeastRelevant => {
                self.least_relevant(messages, &entries, available).await
            }
        };

        info!(
            target: "context_builder",
            strategy = %self.policy.strategy,
            kept = selection.keep.iter().filter(|k| **k).count(),
            dropped = selection.dropped(),
            tokens = selection.tokens_used,
            available,
            "Context window built"
        );
        Ok(selection)
    }

    fn entries(&self, messages: &[Message]) -> Vec<Entry> {
        let turn_start = current_turn_start(messages);
        let keep_system = self.policy.protects_system_role();
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let current = i >= turn_start;
                Entry {
                    tokens: self.counter.count_message(m),
                    protected: current || (keep_system && m.role == Role::System),
                    current,
                }
            })
            .collect()
    }

    fn truncate_oldest(&self, entries: &[Entry], available: usize) -> WindowSelection {
        let mut keep = vec![true; entries.len()];
        let mut total: usize = entries.iter().map(|e| e.tokens).sum();
        for (i, entry) in entries.iter().enumerate() {
            if total <= available {
                break;
            }
            if !entry.protected {
                keep[i] = false;
                total -= entry.tokens;
            }
        }
        if total > available {
            return best_effort(entries, available);
        }
        WindowSelection {
            keep,
            summary: None,
            tokens_used: total,
            available: Some(available),
            truncated: true,
            over_budget: false,
        }
    }

    async fn summarize(
        &self,
        messages: &[Message],
        entries: &[Entry],
        available: usize,
    ) -> Result<WindowSelection> {
        let Some(summarizer) = &self.summarizer else {
            return Err(TurnError::Config(
                "summarize strategy requires a summarizer".into(),
            ));
        };

        let mut summary_reserve = 0;
        for attempt in 0..MAX_SUMMARY_ATTEMPTS {
            let base = self.truncate_oldest(entries, available.saturating_sub(summary_reserve));
            if base.over_budget {
                break;
            }
            let evicted: Vec<Message> = messages
                .iter()
                .zip(&base.keep)
                .filter(|(_, kept)| !**kept)
                .map(|(m, _)| m.clone())
                .collect();
            let Some(first_evicted) = base.keep.iter().position(|k| !*k) else {
                return Ok(base);
            };

            let text = match summarizer.summarize(&evicted).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "context_builder", error = %e, "Summarization failed; falling back to oldest");
                    return Ok(self.truncate_oldest(entries, available));
                }
            };

            let mut summary = Message::system(format!("Summary of earlier conversation:\n{text}"));
            summary.source = Some(SOURCE_SUMMARY.to_string());
            summary
                .meta
                .insert("summarized_messages".into(), json!(evicted.len()));
            let summary_tokens = self.counter.count_message(&summary);

            if base.tokens_used + summary_tokens <= available {
                return Ok(WindowSelection {
                    summary: Some((first_evicted, summary)),
                    tokens_used: base.tokens_used + summary_tokens,
                    ..base
                });
            }
            debug!(target: "context_builder", attempt, summary_tokens, "Summary does not fit; evicting further");
            summary_reserve = summary_tokens;
        }

        warn!(target: "context_builder", "Summary could not be fitted; falling back to oldest");
        Ok(self.truncate_oldest(entries, available))
    }

    async fn least_relevant(
        &self,
        messages: &[Message],
        entries: &[Entry],
        available: usize,
    ) -> WindowSelection {
        let Some(embedder) = &self.embedder else {
            warn!(target: "context_builder", "No embedding provider; falling back to oldest");
            return self.truncate_oldest(entries, available);
        };
        let relevance = self.policy.relevance.clone().unwrap_or_default();

        let query = build_query(messages, &relevance.query_source);
        if query.trim().is_empty() {
            warn!(target: "context_builder", "Empty relevance query; falling back to oldest");
            return self.truncate_oldest(entries, available);
        }

        let mut entries = entries.to_vec();
        let mut recent = 0;
        for i in (0..messages.len()).rev() {
            if recent >= relevance.min_recent_messages {
                break;
            }
            if messages[i].role != Role::System {
                entries[i].protected = true;
                recent += 1;
            }
        }

        let protected_tokens: usize = entries.iter().filter(|e| e.protected).map(|e| e.tokens).sum();
        if protected_tokens > available {
            warn!(target: "context_builder", protected_tokens, available, "Protected messages exceed budget");
            return best_effort(&entries, available);
        }

        let candidates: Vec<usize> = (0..entries.len()).filter(|i| !entries[*i].protected).collect();
        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(query);
        texts.extend(candidates.iter().map(|i| messages[*i].text()));

        let mut cache = EmbeddingCache::new(Arc::clone(embedder), relevance.cache_embeddings);
        let vectors = match cache.embed(&texts).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                warn!(target: "context_builder", expected = texts.len(), "Embedding count mismatch; falling back to oldest");
                return self.truncate_oldest(&entries, available);
            }
            Err(e) => {
                warn!(target: "context_builder", error = %e, "Embedding failed; falling back to oldest");
                return self.truncate_oldest(&entries, available);
            }
        };

        let query_vec = &vectors[0];
        let mut scored: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(k, i)| (*i, cosine_similarity(query_vec, &vectors[k + 1])))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));

        let mut keep: Vec<bool> = entries.iter().map(|e| e.protected).collect();
        let mut remaining = available - protected_tokens;
        for (i, score) in scored {
            if relevance.similarity_threshold > 0.0 && score < relevance.similarity_threshold {
                continue;
            }
            if entries[i].tokens <= remaining {
                keep[i] = true;
                remaining -= entries[i].tokens;
            }
        }

        WindowSelection {
            keep,
            summary: None,
            tokens_used: available - remaining,
            available: Some(available),
            truncated: true,
            over_budget: false,
        }
    }
}

/// Index where the current turn begins.
///
/// With loaded history present that is the first message not from history;
/// otherwise the most recent user message.
fn current_turn_start(messages: &[Message]) -> usize {
    if messages.iter().any(Message::is_from_history) {
        messages
            .iter()
            .position(|m| !m.is_from_history())
            .unwrap_or(messages.len())
    } else {
        messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(messages.len())
    }
}

/// Keep the current turn, then the most recent other protected messages that fit
fn best_effort(entries: &[Entry], available: usize) -> WindowSelection {
    let mut keep = vec![false; entries.len()];
    let mut total = 0;
    for (i, entry) in entries.iter().enumerate() {
        if entry.current {
            keep[i] = true;
            total += entry.tokens;
        }
    }
    for i in (0..entries.len()).rev() {
        let entry = entries[i];
        if !entry.current && entry.protected && total + entry.tokens <= available {
            keep[i] = true;
            total += entry.tokens;
        }
    }
    let over_budget = total > available;
    if over_budget {
        warn!(target: "context_builder", total, available, "Current turn alone exceeds the context budget");
    }
    WindowSelection {
        keep,
        summary: None,
        tokens_used: total,
        available: Some(available),
        truncated: true,
        over_budget,
    }
}
