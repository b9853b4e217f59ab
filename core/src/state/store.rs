//! Conversation state storage interface and the in-memory implementation.

use crate::types::ConversationState;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Storage for conversation state, shared across concurrent turns.
///
/// Implementations must be internally synchronized. `load` returns `Ok(None)`
/// for an unknown conversation; any `Err` is a real storage failure.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the state for `conversation_id`, if any
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>>;

    /// Persist `state`, replacing what was stored under its id
    async fn save(&self, state: &ConversationState) -> Result<()>;
}

/// In-memory implementation of StateStore.
///
/// Uses DashMap for concurrent access and stores owned copies, so callers
/// never share mutable state with the store.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, ConversationState>,
}

impl InMemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        let state = self.states.get(conversation_id).map(|s| s.value().clone());
        trace!(target: "statestore", conversation_id, found = state.is_some(), "load");
        Ok(state)
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        trace!(target: "statestore", conversation_id = %state.id, messages = state.messages.len(), "save");
        self.states.insert(state.id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let store = InMemoryStateStore::new();
        let mut state = ConversationState::new("conv-1", "user-1");
        state.messages.push(Message::user("hello"));
        state.messages.push(Message::assistant("hi there"));
        state.metadata.insert("topic".into(), json!("greeting"));

        store.save(&state).await.unwrap();
        let loaded = store.load("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = InMemoryStateStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_loaded_copy_is_detached() {
        let store = InMemoryStateStore::new();
        store
            .save(&ConversationState::new("conv-2", "u"))
            .await
            .unwrap();
        let mut copy = store.load("conv-2").await.unwrap().unwrap();
        copy.messages.push(Message::user("local only"));

        let fresh = store.load("conv-2").await.unwrap().unwrap();
        assert!(fresh.messages.is_empty());
    }
}
