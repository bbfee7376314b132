//! Character cards, personas, presets, world books, regex sets and model
//! endpoint configs, plus the normalizer that resolves them for a build.

pub mod model;
pub mod normalize;
pub mod store;

pub use model::{
    Activation, Character, EntryPosition, LlmConfig, Persona, Preset, PromptSlot,
    RegexPlacement, RegexRule, RegexSet, RuleMode, SlotPosition, WorldBook, WorldBookEntry,
    markers,
};
pub use normalize::{AssetBundle, AssetNormalizer, AssetRefs, BookEntry};
pub use store::{AssetKind, AssetStore, FileAssetStore, InMemoryAssetStore};

/// Asset loading errors.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("{kind} asset not found: {name}")]
    NotFound { kind: AssetKind, name: String },

    #[error("invalid asset name: {0:?}")]
    InvalidName(String),

    #[error("{kind} asset {name} is malformed: {reason}")]
    Invalid {
        kind: AssetKind,
        name: String,
        reason: String,
    },

    #[error("asset storage I/O failed: {0}")]
    Io(String),
}
