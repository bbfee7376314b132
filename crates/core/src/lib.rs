//! # Loomweave Core
//!
//! Domain types and traits shared by every Loomweave crate: the
//! conversation [`BranchTree`], the model-facing [`Message`], the
//! [`Provider`] abstraction over LLM backends, and the error taxonomy.
//!
//! This crate has no framework dependencies. Storage, assembly and
//! transport live in their own crates and depend inward on this one.

pub mod error;
pub mod message;
pub mod provider;
pub mod tree;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, TreeError};
pub use message::{Message, Role, View};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use tree::{BranchIndicator, BranchTree, Direction, Node, RetryOutcome};
