//! Stage items and their provenance.

use loomweave_core::Role;
use serde::{Deserialize, Serialize};

/// Where a piece of prompt text came from.
///
/// This is the authoritative provenance; [`SourcedContent::tag`] is a
/// label derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A preset slot contributing its own content
    Preset { identifier: String },
    /// A character card field (`description`, `personality`, ...)
    Character { field: String },
    /// The persona description
    Persona,
    /// A world-book entry
    WorldBook { book: String, uid: String },
    /// A chat history message; `node_id` is absent for inline messages
    History {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        index: usize,
    },
    /// Caller-supplied instruction prefixed to inline messages
    ExtraSystem,
}

impl Source {
    /// Kind name matched by regex rule `targets`.
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Preset { .. } => "preset",
            Source::Character { .. } => "character",
            Source::Persona => "persona",
            Source::WorldBook { .. } => "world_book",
            Source::History { .. } => "history",
            Source::ExtraSystem => "extra_system",
        }
    }

    pub fn tag(&self) -> String {
        match self {
            Source::Preset { identifier } => format!("preset:{identifier}"),
            Source::Character { field } => format!("char:{field}"),
            Source::Persona => "persona".into(),
            Source::WorldBook { book, uid } => format!("worldbook:{book}#{uid}"),
            Source::History { index, .. } => format!("history:{index}"),
            Source::ExtraSystem => "extra_system".into(),
        }
    }

    pub fn is_history(&self) -> bool {
        matches!(self, Source::History { .. })
    }
}

/// One item of a stage: text plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedContent {
    pub source: Source,
    pub tag: String,
    pub role: Role,
    pub text: String,
    /// Distance from the newest history message (0 = newest); history only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_depth: Option<usize>,
}

impl SourcedContent {
    pub fn new(source: Source, role: Role, text: impl Into<String>) -> Self {
        let tag = source.tag();
        Self {
            source,
            tag,
            role,
            text: text.into(),
            history_depth: None,
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.history_depth = Some(depth);
        self
    }
}

/// Snapshots of every stage of one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSet {
    pub raw: Vec<SourcedContent>,
    pub after_before_macro_regex: Vec<SourcedContent>,
    pub after_macro: Vec<SourcedContent>,
    pub after_regex: Vec<SourcedContent>,
}

/// The text of one item through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerItemTrace {
    pub index: usize,
    pub source: Source,
    pub tag: String,
    pub role: Role,
    pub raw: String,
    pub after_before_macro_regex: String,
    pub after_macro: String,
    pub after_regex: String,
}

impl StageSet {
    /// Zip the four stages item by item.
    pub fn per_item(&self) -> Vec<PerItemTrace> {
        self.raw
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let text_at = |stage: &[SourcedContent]| {
                    stage.get(index).map(|i| i.text.clone()).unwrap_or_default()
                };
                PerItemTrace {
                    index,
                    source: item.source.clone(),
                    tag: item.tag.clone(),
                    role: item.role,
                    raw: item.text.clone(),
                    after_before_macro_regex: text_at(&self.after_before_macro_regex),
                    after_macro: text_at(&self.after_macro),
                    after_regex: text_at(&self.after_regex),
                }
            })
            .collect()
    }
}
