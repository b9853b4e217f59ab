//! Persistent RocksDB-based conversation state store.
//!
//! Each conversation is one JSON value under `conversation:<id>`, so a load
//! after save returns exactly what was written.

use crate::types::ConversationState;
use crate::{Result, TurnError};
use async_trait::async_trait;
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::StateStore;

const KEY_PREFIX: &str = "conversation:";

/// Persistent RocksDB implementation of StateStore
pub struct RocksDbStateStore {
    db: DB,
}

impl RocksDbStateStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| TurnError::Storage(e.to_string()))?;

        info!(target: "statestore", "RocksDbStateStore initialized");
        Ok(Arc::new(Self { db }))
    }

    fn key(conversation_id: &str) -> String {
        format!("{KEY_PREFIX}{conversation_id}")
    }

    /// Ids of every stored conversation
    pub fn conversation_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.db.prefix_iterator(KEY_PREFIX.as_bytes()) {
            let (key, _) = entry.map_err(|e| TurnError::Storage(e.to_string()))?;
            let Some(id) = key.strip_prefix(KEY_PREFIX.as_bytes()) else {
                break;
            };
            ids.push(String::from_utf8_lossy(id).into_owned());
        }
        Ok(ids)
    }
}

#[async_trait]
impl StateStore for RocksDbStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        match self.db.get(Self::key(conversation_id)) {
            Ok(Some(data)) => {
                let state = serde_json::from_slice(&data)?;
                debug!(target: "statestore", conversation_id, "Loaded state");
                Ok(Some(state))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(TurnError::Storage(e.to_string())),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let serialized = serde_json::to_vec(state)?;
        self.db
            .put(Self::key(&state.id), serialized)
            .map_err(|e| TurnError::Storage(e.to_string()))?;
        debug!(target: "statestore", conversation_id = %state.id, messages = state.messages.len(), "Saved state");
        Ok(())
    }
}
