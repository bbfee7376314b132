//! LLM provider implementations for Loomweave.
//!
//! Every provider implements [`loomweave_core::Provider`]. Loomweave talks
//! to any OpenAI-compatible endpoint; per-character `llm` overrides pick the
//! base URL, model and key at request time.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
