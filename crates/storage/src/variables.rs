//! Variable persistence: one local map per conversation, one global map.

use async_trait::async_trait;
use serde_json::Value;

use crate::StorageError;

#[async_trait]
pub trait VariableStore: Send + Sync {
    /// Missing state loads as an empty object.
    async fn load_local(&self, conversation_id: &str) -> Result<Value, StorageError>;

    async fn save_local(&self, conversation_id: &str, value: &Value) -> Result<(), StorageError>;

    async fn delete_local(&self, conversation_id: &str) -> Result<(), StorageError>;

    /// Missing state loads as an empty object.
    async fn load_global(&self) -> Result<Value, StorageError>;

    async fn save_global(&self, value: &Value) -> Result<(), StorageError>;
}

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}
