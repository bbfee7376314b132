//! In-memory stores for tests and ephemeral deployments.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::conversation::{Conversation, ConversationStore, ConversationSummary};
use crate::variables::{VariableStore, empty_object};
use crate::StorageError;

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self, id: &str) -> Result<Conversation, StorageError> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StorageError> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.conversations.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .read()
            .await
            .values()
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

#[derive(Default)]
pub struct InMemoryVariableStore {
    local: RwLock<HashMap<String, Value>>,
    global: RwLock<Option<Value>>,
}

impl InMemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn load_local(&self, conversation_id: &str) -> Result<Value, StorageError> {
        Ok(self
            .local
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(empty_object))
    }

    async fn save_local(&self, conversation_id: &str, value: &Value) -> Result<(), StorageError> {
        self.local
            .write()
            .await
            .insert(conversation_id.to_string(), value.clone());
        Ok(())
    }

    async fn delete_local(&self, conversation_id: &str) -> Result<(), StorageError> {
        self.local.write().await.remove(conversation_id);
        Ok(())
    }

    async fn load_global(&self) -> Result<Value, StorageError> {
        Ok(self.global.read().await.clone().unwrap_or_else(empty_object))
    }

    async fn save_global(&self, value: &Value) -> Result<(), StorageError> {
        *self.global.write().await = Some(value.clone());
        Ok(())
    }
}
