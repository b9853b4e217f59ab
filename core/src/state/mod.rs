//! Conversation state: storage backends and the load/save stages around a turn.

mod persistent;
mod stages;
mod store;

pub use persistent::RocksDbStateStore;
pub use stages::{StateStoreLoadStage, StateStoreSaveStage};
pub use store::{InMemoryStateStore, StateStore};
