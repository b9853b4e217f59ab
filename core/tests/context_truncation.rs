use async_trait::async_trait;
use loom_turn::context::{
    ContextPolicy, ContextWindowBuilder, EmbeddingProvider, RelevanceConfig, Summarizer, TokenCounter,
    TruncationStrategy,
};
use loom_turn::types::{Message, Role, SOURCE_HISTORY};
use loom_turn::{Result, TurnError};
use std::sync::Arc;

/// One token per byte, so every padded message below costs 4 + 20 = 24
struct ByteCounter;

impl TokenCounter for ByteCounter {
    fn count_text(&self, text: &str) -> usize {
        text.len()
    }
}

struct FixedSummary;

#[async_trait]
impl Summarizer for FixedSummary {
    async fn summarize(&self, _messages: &[Message]) -> Result<String> {
        Ok("short".into())
    }
}

/// Two-dimensional embedding: is the text about cats or not
struct CatEmbedder;

#[async_trait]
impl EmbeddingProvider for CatEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| if t.contains("cats") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
            .collect())
    }
}

fn padded(role: Role, text: &str) -> Message {
    let mut msg = match role {
        Role::System => Message::system(format!("{text:<20}")),
        Role::User => Message::user(format!("{text:<20}")),
        _ => Message::assistant(format!("{text:<20}")),
    };
    msg.source = Some(SOURCE_HISTORY.into());
    msg
}

/// System message, five history messages and the current user message
fn conversation() -> Vec<Message> {
    let mut messages = vec![
        padded(Role::System, "be helpful"),
        padded(Role::User, "cats purr"),
        padded(Role::Assistant, "dogs bark"),
        padded(Role::User, "cats nap"),
        padded(Role::Assistant, "weather is fine"),
        padded(Role::User, "news today"),
    ];
    messages.push(Message::user(format!("{:<20}", "tell me about cats")));
    messages
}

fn builder(policy: ContextPolicy) -> ContextWindowBuilder {
    ContextWindowBuilder::new(policy, Arc::new(ByteCounter))
        .with_summarizer(Arc::new(FixedSummary))
        .with_embedder(Arc::new(CatEmbedder))
}

fn window_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| ByteCounter.count_message(m)).sum()
}

#[tokio::test]
async fn test_strategies_never_exceed_budget() {
    let messages = conversation();
    assert_eq!(window_tokens(&messages), 168);

    for strategy in [
        TruncationStrategy::Oldest,
        TruncationStrategy::Summarize,
        TruncationStrategy::LeastRelevant,
    ] {
        for budget in (48..=200).step_by(12) {
            let policy = ContextPolicy::with_budget(budget, 0)
                .strategy(strategy)
                .relevance(RelevanceConfig::default());
            let selection = builder(policy).select(&messages, "").await.unwrap();
            let window = selection.messages(&messages);

            assert!(!selection.over_budget, "{strategy} at {budget}");
            assert!(window_tokens(&window) <= budget, "{strategy} at {budget}");
            assert_eq!(window_tokens(&window), selection.tokens_used, "{strategy} at {budget}");
            assert_eq!(window.last(), messages.last(), "{strategy} at {budget}");
        }
    }
}

#[tokio::test]
async fn test_reserve_and_system_prompt_shrink_the_window() {
    let messages = conversation();
    let policy = ContextPolicy::with_budget(130, 20);
    let selection = builder(policy).select(&messages, "ten chars!").await.unwrap();

    assert_eq!(selection.available, Some(100));
    assert!(selection.tokens_used <= 100);
    assert!(selection.truncated);
}

#[tokio::test]
async fn test_fail_strategy_reports_budget_exceeded() {
    let messages = conversation();
    let policy = ContextPolicy::with_budget(100, 0).strategy(TruncationStrategy::Fail);
    let err = builder(policy).select(&messages, "").await.unwrap_err();

    assert!(matches!(
        err,
        TurnError::BudgetExceeded {
            required: 168,
            available: 100
        }
    ));
}

#[tokio::test]
async fn test_overhead_beyond_budget_is_rejected() {
    let policy = ContextPolicy::with_budget(50, 40);
    let err = builder(policy).select(&conversation(), "0123456789").await.unwrap_err();
    assert!(matches!(err, TurnError::BudgetExceeded { required: 50, available: 50 }));
}

#[tokio::test]
async fn test_zero_budget_keeps_everything() {
    let messages = conversation();
    let selection = builder(ContextPolicy::default()).select(&messages, "").await.unwrap();
    assert_eq!(selection.dropped(), 0);
    assert_eq!(selection.available, None);
    assert!(!selection.truncated);
}

#[tokio::test]
async fn test_least_relevant_keeps_recent_and_system_then_best_match() {
    let messages = conversation();
    let policy = ContextPolicy::with_budget(120, 0)
        .strategy(TruncationStrategy::LeastRelevant)
        .relevance(RelevanceConfig::default());
    let selection = builder(policy).select(&messages, "").await.unwrap();

    // system + three most recent + the later of the two cat messages
    assert_eq!(
        selection.keep,
        vec![true, false, false, true, true, true, true]
    );
    assert_eq!(selection.tokens_used, 120);
}

#[tokio::test]
async fn test_oldest_drops_from_the_front_but_keeps_system() {
    let messages = conversation();
    let policy = ContextPolicy::with_budget(96, 0);
    let selection = builder(policy).select(&messages, "").await.unwrap();

    assert_eq!(
        selection.keep,
        vec![true, false, false, false, true, true, true]
    );
    assert_eq!(selection.tokens_used, 96);
}
