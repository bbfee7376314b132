//! Asset data types: characters, personas, presets, world books, regex
//! rules and model endpoint configs.
//!
//! Every field carries a serde default so partially written asset files
//! still load.

use loomweave_core::{Role, View};
use serde::{Deserialize, Deserializer, Serialize};

fn default_true() -> bool {
    true
}

/// Accept `"7"` or `7` for identifiers that different tools write differently.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
        Missing(()),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
        Raw::Missing(()) => String::new(),
    })
}

// ── Characters & personas ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub first_message: String,
    pub example_dialogue: String,
    /// Replaces the preset's `main` slot when non-empty
    pub system_prompt: String,
    /// Replaces the preset's `post_history_instructions` slot when non-empty
    pub post_history_instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worldbook: Option<WorldBook>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<RegexRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    pub name: String,
    pub description: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "User".into(),
            description: String::new(),
        }
    }
}

// ── Presets ─────────────────────────────────────────────────────────────

/// Where a prompt slot lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotPosition {
    /// In preset order, relative to the other slots.
    #[default]
    Relative,
    /// Injected into the chat history, `depth` items from the end.
    InChat {
        #[serde(default)]
        depth: usize,
        #[serde(default)]
        order: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSlot {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_slot_role")]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub position: SlotPosition,
}

fn default_slot_role() -> Role {
    Role::System
}

impl PromptSlot {
    /// A relative system slot.
    pub fn relative(identifier: &str, content: &str) -> Self {
        Self {
            identifier: identifier.into(),
            name: identifier.into(),
            role: Role::System,
            content: content.into(),
            enabled: true,
            position: SlotPosition::Relative,
        }
    }
}

/// Slot identifiers whose text comes from other assets rather than the slot.
pub mod markers {
    pub const MAIN: &str = "main";
    pub const PERSONA_DESCRIPTION: &str = "persona_description";
    pub const CHAR_DESCRIPTION: &str = "char_description";
    pub const CHAR_PERSONALITY: &str = "char_personality";
    pub const SCENARIO: &str = "scenario";
    pub const DIALOGUE_EXAMPLES: &str = "dialogue_examples";
    pub const WORLD_INFO_BEFORE: &str = "world_info_before";
    pub const WORLD_INFO_AFTER: &str = "world_info_after";
    pub const CHAT_HISTORY: &str = "chat_history";
    pub const POST_HISTORY_INSTRUCTIONS: &str = "post_history_instructions";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub name: String,
    #[serde(default = "Preset::default_layout")]
    pub prompts: Vec<PromptSlot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<RegexRule>,
}

impl Preset {
    /// Slot order used when no preset is referenced.
    pub fn default_layout() -> Vec<PromptSlot> {
        use markers::*;
        vec![
            PromptSlot::relative(
                MAIN,
                "Write {{char}}'s next reply in a fictional chat between {{char}} and {{user}}.",
            ),
            PromptSlot::relative(WORLD_INFO_BEFORE, ""),
            PromptSlot::relative(PERSONA_DESCRIPTION, ""),
            PromptSlot::relative(CHAR_DESCRIPTION, ""),
            PromptSlot::relative(CHAR_PERSONALITY, ""),
            PromptSlot::relative(SCENARIO, ""),
            PromptSlot::relative(WORLD_INFO_AFTER, ""),
            PromptSlot::relative(DIALOGUE_EXAMPLES, ""),
            PromptSlot::relative(CHAT_HISTORY, ""),
            PromptSlot::relative(POST_HISTORY_INSTRUCTIONS, ""),
        ]
    }
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            name: "default".into(),
            prompts: Self::default_layout(),
            regex: Vec::new(),
        }
    }
}

// ── World books ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Always,
    #[default]
    Keyword,
    /// Reserved for embedding-based retrieval; never fires.
    Vector,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPosition {
    #[default]
    BeforeCharacter,
    AfterCharacter,
    InChat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldBookEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub uid: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub keys: Vec<String>,
    /// When non-empty, at least one of these must also match.
    #[serde(default)]
    pub secondary_keys: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub position: EntryPosition,
    /// Distance from the end of history for `in_chat` entries
    #[serde(default = "default_entry_depth")]
    pub depth: usize,
    #[serde(default = "default_entry_order")]
    pub order: i64,
    #[serde(default = "default_slot_role")]
    pub role: Role,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

fn default_entry_depth() -> usize {
    4
}
fn default_entry_order() -> i64 {
    100
}

impl Default for WorldBookEntry {
    fn default() -> Self {
        Self {
            uid: String::new(),
            comment: String::new(),
            keys: Vec::new(),
            secondary_keys: Vec::new(),
            content: String::new(),
            activation: Activation::default(),
            position: EntryPosition::default(),
            depth: default_entry_depth(),
            order: default_entry_order(),
            role: Role::System,
            enabled: true,
            case_sensitive: false,
            min_depth: None,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldBook {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entries: Vec<WorldBookEntry>,
}

// ── Regex rules ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexPlacement {
    BeforeMacro,
    #[default]
    AfterMacro,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    #[default]
    Always,
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub find: String,
    #[serde(default)]
    pub replace: String,
    /// Inline flags: `i` (case-insensitive), `m` (multi-line), `s` (dot
    /// matches newline), `x` (verbose); `g` is accepted and ignored since
    /// replacement is always global.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub placement: RegexPlacement,
    /// Source kinds the rule applies to (empty = all)
    #[serde(default)]
    pub targets: Vec<String>,
    /// Views the rule applies to (empty = all)
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(default)]
    pub mode: RuleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RegexRule {
    pub fn new(find: &str, replace: &str) -> Self {
        Self {
            id: None,
            name: String::new(),
            find: find.into(),
            replace: replace.into(),
            flags: String::new(),
            placement: RegexPlacement::default(),
            targets: Vec::new(),
            views: Vec::new(),
            mode: RuleMode::Always,
            condition: None,
            enabled: true,
        }
    }
}

/// A file holding regex rules: either a bare array or `{ "rules": [...] }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegexSet {
    List(Vec<RegexRule>),
    Named {
        #[serde(default)]
        rules: Vec<RegexRule>,
    },
}

impl RegexSet {
    pub fn into_rules(self) -> Vec<RegexRule> {
        match self {
            RegexSet::List(rules) | RegexSet::Named { rules } => rules,
        }
    }
}

// ── Model endpoint ──────────────────────────────────────────────────────

/// Per-request overrides for the model endpoint. Unset fields fall back to
/// the application config.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}
