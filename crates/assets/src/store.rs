//! Where asset JSON comes from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use crate::AssetError;

/// The asset families, each stored under its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Character,
    Persona,
    Preset,
    WorldBook,
    Regex,
    LlmConfig,
}

impl AssetKind {
    pub const ALL: [AssetKind; 6] = [
        AssetKind::Character,
        AssetKind::Persona,
        AssetKind::Preset,
        AssetKind::WorldBook,
        AssetKind::Regex,
        AssetKind::LlmConfig,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Character => "characters",
            AssetKind::Persona => "personas",
            AssetKind::Preset => "presets",
            AssetKind::WorldBook => "worldbooks",
            AssetKind::Regex => "regex",
            AssetKind::LlmConfig => "llm_configs",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Raw asset storage. Parsing into typed assets happens in the normalizer.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn load(&self, kind: AssetKind, name: &str) -> Result<Value, AssetError>;

    async fn save(&self, kind: AssetKind, name: &str, value: &Value) -> Result<(), AssetError>;

    async fn list(&self, kind: AssetKind) -> Result<Vec<String>, AssetError>;
}

/// Asset names become file names, so they must not escape their directory.
pub fn validate_name(name: &str) -> Result<(), AssetError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '));
    if ok {
        Ok(())
    } else {
        Err(AssetError::InvalidName(name.to_string()))
    }
}

/// One JSON file per asset: `<root>/<kind>/<name>.json`.
pub struct FileAssetStore {
    root: PathBuf,
}

impl FileAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, kind: AssetKind, name: &str) -> Result<PathBuf, AssetError> {
        validate_name(name)?;
        Ok(self.root.join(kind.dir_name()).join(format!("{name}.json")))
    }
}

#[async_trait]
impl AssetStore for FileAssetStore {
    async fn load(&self, kind: AssetKind, name: &str) -> Result<Value, AssetError> {
        let path = self.path_for(kind, name)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AssetError::NotFound {
                    kind,
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(AssetError::Io(format!("{}: {e}", path.display()))),
        };
        debug!(%kind, name, "Loaded asset file");
        serde_json::from_str(&content).map_err(|e| AssetError::Invalid {
            kind,
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn save(&self, kind: AssetKind, name: &str, value: &Value) -> Result<(), AssetError> {
        let path = self.path_for(kind, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AssetError::Io(format!("Failed to create asset directory: {e}")))?;
        }
        let body = serde_json::to_string_pretty(value).map_err(|e| AssetError::Invalid {
            kind,
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AssetError::Io(format!("{}: {e}", path.display())))
    }

    async fn list(&self, kind: AssetKind) -> Result<Vec<String>, AssetError> {
        let dir = self.root.join(kind.dir_name());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AssetError::Io(format!("{}: {e}", dir.display()))),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AssetError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Asset store held entirely in memory. Used by tests and embedders.
#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: RwLock<HashMap<(AssetKind, String), Value>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, kind: AssetKind, name: &str, value: Value) {
        self.assets
            .write()
            .await
            .insert((kind, name.to_string()), value);
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn load(&self, kind: AssetKind, name: &str) -> Result<Value, AssetError> {
        self.assets
            .read()
            .await
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| AssetError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn save(&self, kind: AssetKind, name: &str, value: &Value) -> Result<(), AssetError> {
        self.insert(kind, name, value.clone()).await;
        Ok(())
    }

    async fn list(&self, kind: AssetKind) -> Result<Vec<String>, AssetError> {
        let mut names: Vec<String> = self
            .assets
            .read()
            .await
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_cannot_escape_the_root() {
        for bad in ["", "../etc", "a/b", ".hidden", "a\\b"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_name("Alice v2.1").is_ok());
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssetStore::new(dir.path());
        store
            .save(AssetKind::Character, "alice", &json!({"name": "Alice"}))
            .await
            .unwrap();
        store
            .save(AssetKind::Character, "bob", &json!({"name": "Bob"}))
            .await
            .unwrap();

        let loaded = store.load(AssetKind::Character, "alice").await.unwrap();
        assert_eq!(loaded["name"], "Alice");
        assert_eq!(
            store.list(AssetKind::Character).await.unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert!(store.list(AssetKind::Preset).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAssetStore::new(dir.path());
        let err = store.load(AssetKind::Persona, "ghost").await.unwrap_err();
        assert!(matches!(err, AssetError::NotFound { .. }));

        let presets = dir.path().join("presets");
        std::fs::create_dir_all(&presets).unwrap();
        std::fs::write(presets.join("broken.json"), "{not json").unwrap();
        let err = store.load(AssetKind::Preset, "broken").await.unwrap_err();
        assert!(matches!(err, AssetError::Invalid { .. }));
    }

    #[tokio::test]
    async fn in_memory_store_lists_by_kind() {
        let store = InMemoryAssetStore::new();
        store.insert(AssetKind::Regex, "clean", json!([])).await;
        store.insert(AssetKind::Preset, "clean", json!({})).await;
        assert_eq!(store.list(AssetKind::Regex).await.unwrap(), vec!["clean"]);
        assert!(store.load(AssetKind::Persona, "clean").await.is_err());
    }
}
