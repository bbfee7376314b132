//! Raw-stage assembly: preset slots, character and persona fields,
//! world-book entries and chat history in final order.

use loomweave_assets::{AssetBundle, EntryPosition, PromptSlot, SlotPosition, markers};
use loomweave_core::Role;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stage::{Source, SourcedContent};
use crate::worldbook::FiredEntry;

// ── Types ──────────────────────────────────────────────────────────────

/// One message of chat history, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Tree node this came from; `None` for inline messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub role: Role,
    pub text: String,
}

pub struct AssemblyInput<'a> {
    pub bundle: &'a AssetBundle,
    pub history: &'a [HistoryItem],
    /// Instruction placed ahead of inline history
    pub extra_system: Option<&'a str>,
    pub fired: &'a [FiredEntry],
}

/// Something injected into the history at `len - depth`.
struct Injection {
    depth: usize,
    order: i64,
    /// 0 = preset slot, 1 = world-book entry
    rank: u8,
    item: SourcedContent,
}

// ── Assembly ───────────────────────────────────────────────────────────

/// Produce the `raw` stage. Items with empty text are dropped.
pub fn assemble_raw(input: &AssemblyInput<'_>) -> Vec<SourcedContent> {
    let AssetBundle {
        character,
        persona,
        preset,
        ..
    } = input.bundle;

    let history = history_block(input);
    let mut history = Some(history);
    let mut out = Vec::new();

    for slot in &preset.prompts {
        if !matches!(slot.position, SlotPosition::Relative) {
            continue;
        }
        // The history anchor holds its place even when switched off
        if slot.identifier == markers::CHAT_HISTORY {
            if let Some(block) = history.take() {
                out.extend(block);
            }
            continue;
        }
        if !slot.enabled {
            continue;
        }
        let field = |name: &str, text: &str| {
            SourcedContent::new(
                Source::Character { field: name.into() },
                slot.role,
                text,
            )
        };
        match slot.identifier.as_str() {
            markers::MAIN if !character.system_prompt.is_empty() => {
                out.push(field("system_prompt", &character.system_prompt));
            }
            markers::POST_HISTORY_INSTRUCTIONS if !character.post_history_instructions.is_empty() => {
                out.push(field(
                    "post_history_instructions",
                    &character.post_history_instructions,
                ));
            }
            markers::PERSONA_DESCRIPTION => out.push(SourcedContent::new(
                Source::Persona,
                slot.role,
                persona.description.as_str(),
            )),
            markers::CHAR_DESCRIPTION => out.push(field("description", &character.description)),
            markers::CHAR_PERSONALITY => out.push(field("personality", &character.personality)),
            markers::SCENARIO => out.push(field("scenario", &character.scenario)),
            markers::DIALOGUE_EXAMPLES => {
                out.push(field("example_dialogue", &character.example_dialogue))
            }
            markers::WORLD_INFO_BEFORE => {
                out.extend(entries_at(input.fired, EntryPosition::BeforeCharacter))
            }
            markers::WORLD_INFO_AFTER => {
                out.extend(entries_at(input.fired, EntryPosition::AfterCharacter))
            }
            _ => out.push(slot_item(slot)),
        }
    }

    if let Some(block) = history {
        debug!(preset = %preset.name, "Preset has no chat_history slot; appending history");
        out.extend(block);
    }

    out.retain(|item| !item.text.is_empty());
    out
}

fn slot_item(slot: &PromptSlot) -> SourcedContent {
    SourcedContent::new(
        Source::Preset {
            identifier: slot.identifier.clone(),
        },
        slot.role,
        slot.content.as_str(),
    )
}

fn entry_item(fired: &FiredEntry) -> SourcedContent {
    SourcedContent::new(
        Source::WorldBook {
            book: fired.book.clone(),
            uid: fired.entry.uid.clone(),
        },
        fired.entry.role,
        fired.entry.content.as_str(),
    )
}

/// Entries for one position, lowest `order` first.
fn entries_at(fired: &[FiredEntry], position: EntryPosition) -> Vec<SourcedContent> {
    let mut matching: Vec<&FiredEntry> = fired
        .iter()
        .filter(|f| f.entry.position == position)
        .collect();
    matching.sort_by_key(|f| f.entry.order);
    matching.into_iter().map(entry_item).collect()
}

/// Chat history with in-chat slots and entries woven in.
fn history_block(input: &AssemblyInput<'_>) -> Vec<SourcedContent> {
    let n = input.history.len();
    let mut items: Vec<SourcedContent> = Vec::with_capacity(n + 1);
    if let Some(extra) = input.extra_system.filter(|s| !s.is_empty()) {
        items.push(SourcedContent::new(Source::ExtraSystem, Role::System, extra));
    }

    let mut injections: Vec<Injection> = input
        .bundle
        .preset
        .prompts
        .iter()
        .filter(|slot| slot.enabled)
        .filter_map(|slot| match slot.position {
            SlotPosition::InChat { depth, order } => Some(Injection {
                depth,
                order,
                rank: 0,
                item: slot_item(slot),
            }),
            SlotPosition::Relative => None,
        })
        .chain(
            input
                .fired
                .iter()
                .filter(|f| f.entry.position == EntryPosition::InChat)
                .map(|f| Injection {
                    depth: f.entry.depth,
                    order: f.entry.order,
                    rank: 1,
                    item: entry_item(f),
                }),
        )
        .collect();
    injections.sort_by_key(|inj| (inj.depth, inj.order, inj.rank));

    // Deeper injections sit earlier; ties keep the sorted order
    let mut pending = injections
        .into_iter()
        .map(|inj| (n - inj.depth.min(n), inj.item))
        .collect::<Vec<_>>();
    pending.sort_by_key(|(pos, _)| *pos);
    let mut pending = pending.into_iter().peekable();

    for (i, message) in input.history.iter().enumerate() {
        while let Some((_, item)) = pending.next_if(|(pos, _)| *pos == i) {
            items.push(item);
        }
        items.push(
            SourcedContent::new(
                Source::History {
                    node_id: message.node_id.clone(),
                    index: i,
                },
                message.role,
                message.text.as_str(),
            )
            .with_depth(n - 1 - i),
        );
    }
    items.extend(pending.map(|(_, item)| item));
    items
}
