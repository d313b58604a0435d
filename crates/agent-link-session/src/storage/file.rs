//! File-backed cursor store.
//!
//! One small JSON record per session under a directory. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves
//! a half-written cursor behind.

use std::{
    fmt::Write as _,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use agent_link_core::{CursorStore, MessageId, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    session_id: String,
    last_message_id: MessageId,
    updated_at: i64,
}

/// Cursor store keeping one JSON file per session.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    dir: PathBuf,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Map a session id to a safe file stem. Bytes outside `[A-Za-z0-9_-]` are
/// percent-encoded.
fn file_stem(session_id: &str) -> String {
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

impl FileCursorStore {
    /// Store cursors under `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory, e.g. `~/.local/share/agent-link/cursors`.
    #[must_use]
    pub fn default_location() -> Option<Self> {
        dirs::data_local_dir().map(|d| Self::new(d.join("agent-link").join("cursors")))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, session_id: &str) -> Result<Option<MessageId>, StorageError> {
        let data = match tokio::fs::read(self.path_for(session_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CursorRecord =
            serde_json::from_slice(&data).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        if record.session_id != session_id {
            return Err(StorageError::Corrupt(format!(
                "record for {} found under {session_id}",
                record.session_id
            )));
        }
        Ok(Some(record.last_message_id))
    }

    async fn save(&self, session_id: &str, cursor: &MessageId) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = CursorRecord {
            session_id: session_id.to_string(),
            last_message_id: cursor.clone(),
            updated_at: now(),
        };
        let data =
            serde_json::to_vec(&record).map_err(|e| StorageError::Internal(e.to_string()))?;

        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
