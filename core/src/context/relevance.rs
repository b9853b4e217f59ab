//! Semantic relevance: embeddings, similarity and query construction.

use super::policy::QuerySource;
use crate::types::{Message, Role};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Produces one embedding vector per input text, in order
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cosine similarity in `[-1, 1]`; zero or mismatched vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Build the query text for relevance scoring; empty when nothing applies
pub fn build_query(messages: &[Message], source: &QuerySource) -> String {
    match source {
        QuerySource::Custom(q) => q.clone(),
        QuerySource::LastN(n) => {
            let start = messages.len().saturating_sub((*n).max(1));
            messages[start..]
                .iter()
                .map(Message::text)
                .collect::<Vec<_>>()
                .join(" ")
        }
        QuerySource::LastUser => messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| messages.last())
            .map(Message::text)
            .unwrap_or_default(),
    }
}

/// Embedding lookups for one run.
///
/// With caching on, identical texts are embedded once and later requests are
/// served from memory. The cache never outlives the turn that created it.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    enabled: bool,
    vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, enabled: bool) -> Self {
        Self {
            provider,
            enabled,
            vectors: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Embed `texts`, returning vectors in the same order.
    ///
    /// Returns `Ok(None)` when the provider answered with the wrong number of vectors.
    pub async fn embed(&mut self, texts: &[String]) -> Result<Option<Vec<Vec<f32>>>> {
        if !self.enabled {
            let vectors = self.provider.embed(texts).await?;
            return Ok((vectors.len() == texts.len()).then_some(vectors));
        }

        let mut missing: Vec<String> = Vec::new();
        for t in texts {
            if !self.vectors.contains_key(t) && !missing.contains(t) {
                missing.push(t.clone());
            }
        }
        if !missing.is_empty() {
            let fetched = self.provider.embed(&missing).await?;
            if fetched.len() != missing.len() {
                return Ok(None);
            }
            debug!(target: "context_builder", embedded = missing.len(), cached = self.vectors.len(), "Embedded texts");
            self.vectors.extend(missing.into_iter().zip(fetched));
        }

        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t).cloned())
            .collect::<Option<Vec<_>>>())
    }
}
