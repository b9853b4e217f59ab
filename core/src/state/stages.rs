//! State store load/save stages.

use super::StateStore;
use crate::pipeline::{keys, Stage, StageInput, StageKind, StageOutput, StreamElement};
use crate::types::{ConversationState, Message, Metadata, SOURCE_HISTORY};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Element metadata that describes a single turn and is not carried into the
/// persisted conversation metadata
const TRANSIENT_KEYS: &[&str] = &[
    keys::FROM_HISTORY,
    keys::SYSTEM_PROMPT,
    keys::ALLOWED_TOOLS,
    keys::TOKEN_COUNT,
    keys::FINISH_REASON,
    keys::CONTEXT_TRUNCATED,
    keys::CONTEXT_TOKENS,
    keys::CONTEXT_DROPPED,
    keys::CACHE_BREAKPOINTS,
];

/// Loads prior conversation state and emits it ahead of the turn's input.
///
/// History messages are tagged with source `statestore` and element metadata
/// `from_history = true`. Input elements are forwarded with the conversation
/// id, user id, the turn index computed from the full loaded history, and the
/// history length.
pub struct StateStoreLoadStage {
    store: Arc<dyn StateStore>,
    conversation_id: String,
    user_id: String,
}

impl StateStoreLoadStage {
    pub fn new(
        store: Arc<dyn StateStore>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl Stage for StateStoreLoadStage {
    fn name(&self) -> &str {
        "statestore_load"
    }

    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    #[instrument(name = "statestore.load", skip_all, fields(conversation_id = %self.conversation_id))]
    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let state = match self.store.load(&self.conversation_id).await? {
            Some(state) => state,
            None => {
                debug!(target: "statestore", conversation_id = %self.conversation_id, "No prior state; starting fresh");
                ConversationState::new(&self.conversation_id, &self.user_id)
            }
        };

        let turn_index = state.turn_count();
        let history_length = state.messages.len();
        info!(
            target: "statestore",
            conversation_id = %self.conversation_id,
            history_length,
            turn_index,
            "Loaded conversation history"
        );

        for mut msg in state.messages {
            msg.source = Some(SOURCE_HISTORY.to_string());
            let elem = StreamElement::from_message(msg)
                .with_metadata(keys::FROM_HISTORY, json!(true))
                .with_metadata(keys::CONVERSATION_ID, json!(self.conversation_id));
            output.send(elem).await?;
        }

        while let Some(mut elem) = input.recv().await {
            elem.metadata
                .insert(keys::CONVERSATION_ID.into(), json!(self.conversation_id));
            elem.metadata
                .insert(keys::USER_ID.into(), json!(self.user_id));
            elem.metadata
                .insert(keys::TURN_INDEX.into(), json!(turn_index));
            elem.metadata
                .insert(keys::HISTORY_LENGTH.into(), json!(history_length));
            if let Some(msg) = elem.message.as_mut() {
                msg.meta
                    .entry(keys::TURN_INDEX.to_string())
                    .or_insert_with(|| json!(turn_index));
            }
            output.send(elem).await?;
        }
        Ok(())
    }
}

/// Appends this turn's messages to the stored conversation and forwards every element.
///
/// The state is re-read at save time so concurrent writers and truncated
/// context windows never cause history to be dropped or duplicated. Nothing
/// is saved when upstream ended with an error. Text deltas pass through as
/// they arrive; message elements are held until the save completes.
pub struct StateStoreSaveStage {
    store: Arc<dyn StateStore>,
    conversation_id: String,
    user_id: String,
}

impl StateStoreSaveStage {
    pub fn new(
        store: Arc<dyn StateStore>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }

    fn turn_messages(elements: &[StreamElement]) -> Vec<Message> {
        elements
            .iter()
            .filter(|e| !e.is_from_history())
            .filter_map(|e| e.message.as_ref())
            .filter(|m| m.is_persistable())
            .cloned()
            .collect()
    }

    fn turn_metadata(elements: &[StreamElement]) -> Metadata {
        let mut merged = Metadata::new();
        for elem in elements.iter().filter(|e| !e.is_from_history()) {
            for (k, v) in &elem.metadata {
                if !TRANSIENT_KEYS.contains(&k.as_str()) {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
    }
}

#[async_trait]
impl Stage for StateStoreSaveStage {
    fn name(&self) -> &str {
        "statestore_save"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    #[instrument(name = "statestore.save", skip_all, fields(conversation_id = %self.conversation_id))]
    async fn process(&self, mut input: StageInput, output: StageOutput) -> Result<()> {
        let elements = input.collect_messages(&output).await?;
        if input.is_halted() {
            debug!(target: "statestore", conversation_id = %self.conversation_id, "Upstream failed; skipping save");
            return output.send_all(elements).await;
        }

        let new_messages = Self::turn_messages(&elements);
        let mut state = self
            .store
            .load(&self.conversation_id)
            .await?
            .unwrap_or_else(|| ConversationState::new(&self.conversation_id, &self.user_id));
        if state.user_id.is_empty() {
            state.user_id = self.user_id.clone();
        }
        for (k, v) in Self::turn_metadata(&elements) {
            state.metadata.insert(k, v);
        }
        let appended = new_messages.len();
        state.messages.extend(new_messages);
        state.updated_at = Utc::now();

        self.store.save(&state).await?;
        info!(
            target: "statestore",
            conversation_id = %self.conversation_id,
            appended,
            total = state.messages.len(),
            "Saved conversation state"
        );

        output.send_all(elements).await
    }
}
