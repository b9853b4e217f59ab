//! Context window management
//!
//! Token counting, truncation policy, relevance scoring and the stage that
//! fits conversation history into the provider's budget.

pub mod builder;
pub mod policy;
pub mod relevance;
pub mod stage;
pub mod token_counter;

pub use builder::{ContextWindowBuilder, Summarizer, WindowSelection};
pub use policy::{ContextPolicy, QuerySource, RelevanceConfig, TruncationStrategy};
pub use relevance::{build_query, cosine_similarity, EmbeddingCache, EmbeddingProvider};
pub use stage::ContextBuilderStage;
pub use token_counter::{create_counter, HeuristicTokenCounter, TokenCounter};
