//! File-backed stores.
//!
//! Layout under the data directory:
//!
//! ```text
//! conversations/<id>.json
//! variables/local/<id>.json
//! variables/global.json
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so a crash never leaves a half-written file behind.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationStore, ConversationSummary, validate_id};
use crate::variables::{VariableStore, empty_object};
use crate::StorageError;

/// Write `body` to `path` atomically via temp file + rename.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| StorageError::Io(format!("Failed to write {}: {e}", tmp.display())))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StorageError::Io(format!(
            "Failed to move {} into place: {e}",
            path.display()
        )));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(format!("Failed to read {}: {e}", path.display()))),
    }
}

/// One pretty-printed JSON file per conversation.
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File conversation store ready");
        Self { dir }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn parse(id: &str, content: &str) -> Result<Conversation, StorageError> {
        let conversation: Conversation =
            serde_json::from_str(content).map_err(|e| StorageError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        conversation.tree.validate().map_err(|e| StorageError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(conversation)
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, id: &str) -> Result<Conversation, StorageError> {
        let path = self.path_for(id)?;
        let content = read_optional(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Self::parse(id, &content)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let path = self.path_for(&conversation.id)?;
        let body = serde_json::to_vec_pretty(conversation)?;
        write_atomic(&path, &body).await?;
        debug!(id = %conversation.id, nodes = conversation.tree.node_count(), "Conversation saved");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(format!("Failed to delete {}: {e}", path.display()))),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            let path = entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            if validate_id(id).is_err() {
                continue;
            }
            let Some(content) = read_optional(&path).await? else {
                continue;
            };
            match Self::parse(id, &content) {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => warn!(error = %e, "Skipping corrupted conversation file"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

/// Variable maps as JSON files.
pub struct FileVariableStore {
    dir: PathBuf,
}

impl FileVariableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn local_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self.dir.join("local").join(format!("{id}.json")))
    }

    fn global_path(&self) -> PathBuf {
        self.dir.join("global.json")
    }

    async fn read_map(path: &Path) -> Result<Value, StorageError> {
        match read_optional(path).await? {
            Some(content) => match serde_json::from_str::<Value>(&content) {
                Ok(value) if value.is_object() => Ok(value),
                Ok(_) | Err(_) => {
                    warn!(path = %path.display(), "Variable file is not a JSON object, starting empty");
                    Ok(empty_object())
                }
            },
            None => Ok(empty_object()),
        }
    }
}

#[async_trait]
impl VariableStore for FileVariableStore {
    async fn load_local(&self, conversation_id: &str) -> Result<Value, StorageError> {
        Self::read_map(&self.local_path(conversation_id)?).await
    }

    async fn save_local(&self, conversation_id: &str, value: &Value) -> Result<(), StorageError> {
        let path = self.local_path(conversation_id)?;
        write_atomic(&path, &serde_json::to_vec_pretty(value)?).await
    }

    async fn delete_local(&self, conversation_id: &str) -> Result<(), StorageError> {
        let path = self.local_path(conversation_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn load_global(&self) -> Result<Value, StorageError> {
        Self::read_map(&self.global_path()).await
    }

    async fn save_global(&self, value: &Value) -> Result<(), StorageError> {
        write_atomic(&self.global_path(), &serde_json::to_vec_pretty(value)?).await
    }
}
