//! In-memory cursor store.

use std::{collections::HashMap, sync::RwLock};

use agent_link_core::{CursorStore, MessageId, StorageError};
use async_trait::async_trait;

/// In-memory cursor store.
///
/// Useful for tests and short-lived processes. Cursors are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<String, MessageId>>,
}

impl MemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor, as if persisted by an earlier run.
    #[must_use]
    pub fn with_cursor(self, session_id: impl Into<String>, cursor: impl Into<MessageId>) -> Self {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(session_id.into(), cursor.into());
        }
        self
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, session_id: &str) -> Result<Option<MessageId>, StorageError> {
        Ok(self
            .cursors
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(session_id)
            .cloned())
    }

    async fn save(&self, session_id: &str, cursor: &MessageId) -> Result<(), StorageError> {
        self.cursors
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(session_id.to_string(), cursor.clone());
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<(), StorageError> {
        self.cursors
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(session_id);
        Ok(())
    }
}
