//! Persistence for Loomweave: conversation trees, variable maps, and the
//! per-conversation locks that serialise writers.

pub mod conversation;
pub mod file_store;
pub mod in_memory;
pub mod locks;
pub mod service;
pub mod variables;

pub use conversation::{Conversation, ConversationStore, ConversationSummary, validate_id};
pub use file_store::{FileConversationStore, FileVariableStore};
pub use in_memory::{InMemoryConversationStore, InMemoryVariableStore};
pub use locks::{ConversationGuard, ConversationLocks};
pub use service::{ConversationService, DeleteOutcome, NewConversation};
pub use variables::VariableStore;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("invalid conversation id: {0:?}")]
    InvalidId(String),

    #[error("conversation already exists: {0}")]
    AlreadyExists(String),

    #[error("stored conversation {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("storage I/O failed: {0}")]
    Io(String),

    #[error(transparent)]
    Tree(#[from] loomweave_core::TreeError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
