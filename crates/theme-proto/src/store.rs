//! Persistent game → theme-track mapping.
//!
//! The settings surface writes one entry per game; the daemon only ever reads
//! them.  `JsonFileStore` is the default engine binding: a single JSON object
//! keyed by game identifier.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Per-game persisted preference.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IdentifierCacheEntry {
    #[serde(rename = "videoId", default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub volume: Option<f32>,
}

impl IdentifierCacheEntry {
    pub fn new(video_id: &str) -> Self {
        Self {
            video_id: Some(video_id.to_string()),
            volume: None,
        }
    }

    /// The music-track identifier, if the entry names a non-empty one.
    pub fn track_id(&self) -> Option<&str> {
        self.video_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed store data: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Key-value access to identifier entries.
#[async_trait]
pub trait IdentifierStore: Send + Sync {
    async fn get(&self, game_id: &str) -> Result<Option<IdentifierCacheEntry>, StoreError>;

    async fn set(&self, game_id: &str, entry: IdentifierCacheEntry) -> Result<(), StoreError>;
}

/// JSON document on disk.  A missing file is an empty store.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_document(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("store: {:?} does not exist yet", self.path);
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl IdentifierStore for JsonFileStore {
    async fn get(&self, game_id: &str) -> Result<Option<IdentifierCacheEntry>, StoreError> {
        let mut document = self.read_document().await?;
        match document.remove(game_id) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, game_id: &str, entry: IdentifierCacheEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(game_id.to_string(), serde_json::to_value(&entry)?);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(&self.path, json).await?;
        debug!("store: wrote entry for game {}", game_id);
        Ok(())
    }
}

/// Process-local store, for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, IdentifierCacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentifierStore for MemoryStore {
    async fn get(&self, game_id: &str) -> Result<Option<IdentifierCacheEntry>, StoreError> {
        Ok(self.entries.read().await.get(game_id).cloned())
    }

    async fn set(&self, game_id: &str, entry: IdentifierCacheEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(game_id.to_string(), entry);
        Ok(())
    }
}
