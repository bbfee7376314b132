//! Resolve asset references into one deduplicated bundle.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::model::{
    Character, LlmConfig, Persona, Preset, RegexPlacement, RegexRule, RegexSet, WorldBook,
    WorldBookEntry,
};
use crate::store::{AssetKind, AssetStore};
use crate::AssetError;

/// Named assets a build wants. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub worldbooks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<String>,
}

/// A world-book entry together with the book it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub book: String,
    pub entry: WorldBookEntry,
}

/// Everything the assembler needs, with defaults filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBundle {
    pub character: Character,
    pub persona: Persona,
    pub preset: Preset,
    pub worldbook_entries: Vec<BookEntry>,
    pub regex_rules: Vec<RegexRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,
}

pub struct AssetNormalizer {
    store: Arc<dyn AssetStore>,
}

impl AssetNormalizer {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    /// Load every referenced asset and merge world books and regex rules.
    ///
    /// World-book entries are deduplicated by `(book, uid)`; regex rules by
    /// `id`, or by `(find, replace, placement)` when anonymous. The first
    /// occurrence wins in both cases. A referenced asset that does not exist
    /// fails the whole call.
    pub async fn normalize(&self, refs: &AssetRefs) -> Result<AssetBundle, AssetError> {
        let character: Character = self.load_or_default(AssetKind::Character, &refs.character).await?;
        let persona: Persona = self.load_or_default(AssetKind::Persona, &refs.persona).await?;
        let preset: Preset = self.load_or_default(AssetKind::Preset, &refs.preset).await?;
        let llm = match &refs.llm_config {
            Some(name) => Some(self.load_typed::<LlmConfig>(AssetKind::LlmConfig, name).await?),
            None => None,
        };

        let mut books: Vec<WorldBook> = Vec::new();
        if let Some(embedded) = &character.worldbook {
            let mut book = embedded.clone();
            if book.name.is_empty() {
                book.name = character.name.clone();
            }
            books.push(book);
        }
        for name in &refs.worldbooks {
            let mut book: WorldBook = self.load_typed(AssetKind::WorldBook, name).await?;
            if book.name.is_empty() {
                book.name = name.clone();
            }
            books.push(book);
        }
        let worldbook_entries = merge_worldbooks(books);

        let mut rule_sources: Vec<Vec<RegexRule>> =
            vec![preset.regex.clone(), character.regex.clone()];
        for name in &refs.regex {
            let set: RegexSet = self.load_typed(AssetKind::Regex, name).await?;
            rule_sources.push(set.into_rules());
        }
        let regex_rules = merge_regex_rules(rule_sources);

        info!(
            character = %character.name,
            preset = %preset.name,
            entries = worldbook_entries.len(),
            rules = regex_rules.len(),
            "Assets normalized"
        );

        Ok(AssetBundle {
            character,
            persona,
            preset,
            worldbook_entries,
            regex_rules,
            llm,
        })
    }

    async fn load_typed<T: DeserializeOwned>(
        &self,
        kind: AssetKind,
        name: &str,
    ) -> Result<T, AssetError> {
        let raw = self.store.load(kind, name).await?;
        serde_json::from_value(raw).map_err(|e| AssetError::Invalid {
            kind,
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn load_or_default<T: DeserializeOwned + Default>(
        &self,
        kind: AssetKind,
        name: &Option<String>,
    ) -> Result<T, AssetError> {
        match name {
            Some(name) => self.load_typed(kind, name).await,
            None => {
                debug!(%kind, "No asset referenced, using defaults");
                Ok(T::default())
            }
        }
    }
}

/// Flatten books into entries, first `(book, uid)` wins.
pub fn merge_worldbooks(books: Vec<WorldBook>) -> Vec<BookEntry> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::new();
    for book in books {
        for entry in book.entries {
            if !entry.uid.is_empty() && !seen.insert((book.name.clone(), entry.uid.clone())) {
                debug!(book = %book.name, uid = %entry.uid, "Dropping duplicate world-book entry");
                continue;
            }
            out.push(BookEntry {
                book: book.name.clone(),
                entry,
            });
        }
    }
    out
}

/// Concatenate rule lists, first occurrence of each identity wins.
pub fn merge_regex_rules(sources: Vec<Vec<RegexRule>>) -> Vec<RegexRule> {
    #[derive(PartialEq, Eq, Hash)]
    enum Identity {
        Id(String),
        Shape(String, String, RegexPlacement),
    }

    let mut seen: HashSet<Identity> = HashSet::new();
    let mut out = Vec::new();
    for rule in sources.into_iter().flatten() {
        let identity = match &rule.id {
            Some(id) if !id.is_empty() => Identity::Id(id.clone()),
            _ => Identity::Shape(rule.find.clone(), rule.replace.clone(), rule.placement),
        };
        if seen.insert(identity) {
            out.push(rule);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAssetStore;
    use serde_json::json;

    fn rule(id: Option<&str>, find: &str, replace: &str) -> RegexRule {
        RegexRule {
            id: id.map(String::from),
            ..RegexRule::new(find, replace)
        }
    }

    async fn seeded() -> Arc<InMemoryAssetStore> {
        let store = Arc::new(InMemoryAssetStore::new());
        store
            .insert(
                AssetKind::Character,
                "alice",
                json!({
                    "name": "Alice",
                    "description": "A curious fox.",
                    "worldbook": {
                        "entries": [
                            {"uid": 1, "keys": ["forest"], "content": "The forest is old."}
                        ]
                    },
                    "regex": [{"id": "strip", "find": "\\*", "replace": ""}]
                }),
            )
            .await;
        store
            .insert(
                AssetKind::WorldBook,
                "lore",
                json!({
                    "name": "lore",
                    "entries": [
                        {"uid": 1, "keys": ["city"], "content": "The city never sleeps."},
                        {"uid": 1, "keys": ["dup"], "content": "duplicate uid"},
                        {"uid": 2, "activation": "always", "content": "Magic exists."}
                    ]
                }),
            )
            .await;
        store
            .insert(
                AssetKind::Regex,
                "cleanup",
                json!([
                    {"id": "strip", "find": "other", "replace": "ignored"},
                    {"find": "foo", "replace": "bar"},
                    {"find": "foo", "replace": "bar"}
                ]),
            )
            .await;
        store
    }

    #[tokio::test]
    async fn normalize_merges_books_and_rules() {
        let store = seeded().await;
        let normalizer = AssetNormalizer::new(store);
        let refs = AssetRefs {
            character: Some("alice".into()),
            worldbooks: vec!["lore".into()],
            regex: vec!["cleanup".into()],
            ..AssetRefs::default()
        };
        let bundle = normalizer.normalize(&refs).await.unwrap();

        assert_eq!(bundle.character.name, "Alice");
        assert_eq!(bundle.persona, Persona::default());
        assert_eq!(bundle.preset.prompts, Preset::default_layout());

        let books: Vec<(&str, &str)> = bundle
            .worldbook_entries
            .iter()
            .map(|e| (e.book.as_str(), e.entry.uid.as_str()))
            .collect();
        assert_eq!(books, vec![("Alice", "1"), ("lore", "1"), ("lore", "2")]);

        let finds: Vec<&str> = bundle.regex_rules.iter().map(|r| r.find.as_str()).collect();
        assert_eq!(finds, vec!["\\*", "foo"]);
    }

    #[tokio::test]
    async fn missing_reference_is_an_error() {
        let normalizer = AssetNormalizer::new(Arc::new(InMemoryAssetStore::new()));
        let refs = AssetRefs {
            preset: Some("nope".into()),
            ..AssetRefs::default()
        };
        let err = normalizer.normalize(&refs).await.unwrap_err();
        assert!(matches!(err, AssetError::NotFound { kind: AssetKind::Preset, .. }));
    }

    #[tokio::test]
    async fn malformed_asset_is_invalid() {
        let store = Arc::new(InMemoryAssetStore::new());
        store
            .insert(AssetKind::WorldBook, "bad", json!({"entries": "nope"}))
            .await;
        let normalizer = AssetNormalizer::new(store);
        let refs = AssetRefs {
            worldbooks: vec!["bad".into()],
            ..AssetRefs::default()
        };
        assert!(matches!(
            normalizer.normalize(&refs).await,
            Err(AssetError::Invalid { .. })
        ));
    }

    #[test]
    fn anonymous_rules_dedup_by_shape_including_placement() {
        let mut late = rule(None, "x", "y");
        late.placement = RegexPlacement::BeforeMacro;
        let merged = merge_regex_rules(vec![
            vec![rule(None, "x", "y"), rule(Some("a"), "1", "2")],
            vec![late, rule(Some("a"), "3", "4"), rule(None, "x", "y")],
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].find, "1");
        assert_eq!(merged[2].placement, RegexPlacement::BeforeMacro);
    }

    #[test]
    fn entries_without_uid_are_never_deduplicated() {
        let book = WorldBook {
            name: "b".into(),
            entries: vec![WorldBookEntry::default(), WorldBookEntry::default()],
        };
        assert_eq!(merge_worldbooks(vec![book]).len(), 2);
    }
}
