//! Conversation operations as "lock, load, mutate, save".

use chrono::Utc;
use loomweave_core::{BranchIndicator, BranchTree, Direction, Role, RetryOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationStore, ConversationSummary, validate_id};
use crate::locks::ConversationLocks;
use crate::variables::VariableStore;
use crate::StorageError;

/// Parameters for creating a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewConversation {
    /// Generated when absent
    pub id: Option<String>,
    pub title: String,
    /// Content of the root system node
    pub system_prompt: String,
    /// Opening assistant message, typically a character's first message
    pub greeting: Option<String>,
    pub character: Option<String>,
}

/// Result of a smart branch deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
    /// Sibling selected in place of the deleted node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    /// Empty assistant node created because the parent lost its last reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// Delete `node_id`, then repair the active path.
///
/// If the deleted node was on the active path, the sibling that moved into
/// its slot is selected (or the previous one when it was last). When no
/// siblings remain and the deleted node was an assistant reply, an empty
/// assistant placeholder is created so the user turn still has a slot for
/// a reply.
pub fn smart_delete(tree: &mut BranchTree, node_id: &str) -> DeleteOutcome {
    let Some(node) = tree.node(node_id) else {
        return DeleteOutcome::default();
    };
    let Some(parent) = node.parent_id.clone() else {
        return DeleteOutcome::default();
    };
    let role = node.role;
    let index = tree
        .children_of(&parent)
        .iter()
        .position(|id| id == node_id)
        .unwrap_or(0);
    let was_active = tree.active_path().iter().any(|id| id == node_id);

    if !tree.delete_branch(node_id) {
        return DeleteOutcome::default();
    }
    let mut outcome = DeleteOutcome {
        deleted: true,
        ..DeleteOutcome::default()
    };
    if !was_active {
        return outcome;
    }

    let remaining = tree.children_of(&parent).to_vec();
    if let Some(pick) = remaining.get(index.min(remaining.len().saturating_sub(1))) {
        tree.select(pick);
        outcome.selected = Some(pick.clone());
    } else if role == Role::Assistant {
        outcome.placeholder = tree.append_at(&parent, Role::Assistant, "");
    }
    outcome
}

pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    variables: Arc<dyn VariableStore>,
    locks: ConversationLocks,
    globals: Arc<Mutex<()>>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn ConversationStore>, variables: Arc<dyn VariableStore>) -> Self {
        Self {
            store,
            variables,
            locks: ConversationLocks::new(),
            globals: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn variables(&self) -> &Arc<dyn VariableStore> {
        &self.variables
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    /// Exclusive access to the global variable document. Every
    /// conversation shares it, so read-modify-write cycles on it must
    /// hold this guard. Take it after any conversation lock.
    pub async fn lock_globals(&self) -> OwnedMutexGuard<()> {
        self.globals.clone().lock_owned().await
    }

    pub async fn create(&self, params: NewConversation) -> Result<Conversation, StorageError> {
        let id = match params.id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => Uuid::new_v4().simple().to_string(),
        };
        let _guard = self.locks.lock(&id).await;
        if self.store.exists(&id).await? {
            return Err(StorageError::AlreadyExists(id));
        }

        let mut tree = BranchTree::new(params.system_prompt);
        if let Some(greeting) = params.greeting.filter(|g| !g.is_empty()) {
            let root = tree.root_id().to_string();
            tree.append(&root, Role::Assistant, greeting)?;
        }
        let mut conversation = Conversation::new(id, params.title, tree);
        conversation.character = params.character;
        self.store.save(&conversation).await?;
        info!(id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, id: &str) -> Result<Conversation, StorageError> {
        self.store.load(id).await
    }

    pub async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        self.store.list().await
    }

    /// Remove the conversation and its local variables.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.locks.lock(id).await;
        let deleted = self.store.delete(id).await?;
        if deleted {
            self.variables.delete_local(id).await?;
            info!(id, "Conversation deleted");
        }
        Ok(deleted)
    }

    /// Lock, load, apply `f`, save. An error from `f` aborts without saving.
    pub async fn mutate<T, F>(&self, id: &str, f: F) -> Result<(Conversation, T), StorageError>
    where
        F: FnOnce(&mut BranchTree) -> Result<T, StorageError>,
    {
        let _guard = self.locks.lock(id).await;
        let mut conversation = self.store.load(id).await?;
        let out = f(&mut conversation.tree)?;
        conversation.updated_at = Utc::now();
        self.store.save(&conversation).await?;
        debug!(id, depth = conversation.tree.active_path().len(), "Conversation mutated");
        Ok((conversation, out))
    }

    /// Append under `parent_id`, or under the active tail when `None`.
    pub async fn append(
        &self,
        id: &str,
        parent_id: Option<&str>,
        role: Role,
        content: &str,
    ) -> Result<(Conversation, String), StorageError> {
        self.mutate(id, |tree| {
            let parent = parent_id
                .map(str::to_string)
                .unwrap_or_else(|| tree.active_tail().to_string());
            Ok(tree.append(&parent, role, content)?)
        })
        .await
    }

    pub async fn append_at(
        &self,
        id: &str,
        node_id: &str,
        role: Role,
        content: &str,
    ) -> Result<(Conversation, Option<String>), StorageError> {
        self.mutate(id, |tree| Ok(tree.append_at(node_id, role, content)))
            .await
    }

    pub async fn switch_branch(
        &self,
        id: &str,
        depth: usize,
        direction: Direction,
    ) -> Result<(Conversation, Option<String>), StorageError> {
        self.mutate(id, |tree| Ok(tree.switch_branch(depth, direction)))
            .await
    }

    pub async fn delete_branch(
        &self,
        id: &str,
        node_id: &str,
    ) -> Result<(Conversation, DeleteOutcome), StorageError> {
        self.mutate(id, |tree| Ok(smart_delete(tree, node_id))).await
    }

    pub async fn truncate_after(
        &self,
        id: &str,
        depth: usize,
    ) -> Result<(Conversation, bool), StorageError> {
        self.mutate(id, |tree| Ok(tree.truncate_after(depth))).await
    }

    pub async fn retry(
        &self,
        id: &str,
        user_node_id: &str,
    ) -> Result<(Conversation, Option<RetryOutcome>), StorageError> {
        self.mutate(id, |tree| Ok(tree.retry_user_message(user_node_id)))
            .await
    }

    pub async fn select(&self, id: &str, node_id: &str) -> Result<(Conversation, bool), StorageError> {
        self.mutate(id, |tree| Ok(tree.select(node_id))).await
    }

    pub async fn update_content(
        &self,
        id: &str,
        node_id: &str,
        content: &str,
    ) -> Result<(Conversation, bool), StorageError> {
        self.mutate(id, |tree| Ok(tree.update_content(node_id, content)))
            .await
    }

    pub async fn branches(&self, id: &str) -> Result<Vec<BranchIndicator>, StorageError> {
        Ok(self.store.load(id).await?.tree.branch_table())
    }
}
