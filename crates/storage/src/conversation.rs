//! The persisted conversation record and the store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loomweave_core::BranchTree;
use serde::{Deserialize, Serialize};

use crate::StorageError;

/// A conversation: metadata plus its branch tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Character asset this conversation was started with, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tree: BranchTree,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>, tree: BranchTree) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            character: None,
            created_at: now,
            updated_at: now,
            tree,
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            character: self.character.clone(),
            updated_at: self.updated_at,
            node_count: self.tree.node_count(),
            depth: self.tree.active_path().len(),
        }
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub node_count: usize,
    pub depth: usize,
}

/// Conversation persistence.
///
/// Implementations do no locking of their own; callers serialise writes to
/// one conversation through [`crate::ConversationLocks`].
#[async_trait]
pub trait ConversationStore: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, id: &str) -> Result<Conversation, StorageError>;

    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError>;

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        match self.load(id).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Conversation ids become file names: `[A-Za-z0-9_-]{1,128}`.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let ok = (1..=128).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}
