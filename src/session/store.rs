//! Durable turn-list storage, one entry per conversation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::types::Turn;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored history is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("conversation id {0:?} cannot be used as a storage key")]
    InvalidKey(String),
}

/// Storage key for a conversation's history
pub fn storage_key(conversation_id: &str) -> String {
    format!("chat_messages_{}", conversation_id)
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Stored turns for `conversation_id`, or an empty list
    async fn load(&self, conversation_id: &str) -> StoreResult<Vec<Turn>>;

    /// Replace the stored turns for `conversation_id`
    async fn save(&self, conversation_id: &str, turns: &[Turn]) -> StoreResult<()>;
}

/// Keeps serialized histories in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryTurnStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw serialized entry, as it would be written to disk
    pub async fn raw(&self, conversation_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&storage_key(conversation_id))
            .cloned()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn load(&self, conversation_id: &str) -> StoreResult<Vec<Turn>> {
        match self.entries.read().await.get(&storage_key(conversation_id)) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, conversation_id: &str, turns: &[Turn]) -> StoreResult<()> {
        let raw = serde_json::to_string(turns)?;
        self.entries
            .write()
            .await
            .insert(storage_key(conversation_id), raw);
        Ok(())
    }
}

/// One JSON file per conversation under a directory
#[derive(Debug, Clone)]
pub struct FileTurnStore {
    dir: PathBuf,
}

impl FileTurnStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, conversation_id: &str) -> StoreResult<PathBuf> {
        let valid = !conversation_id.is_empty()
            && !conversation_id.starts_with('.')
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey(conversation_id.to_string()));
        }
        Ok(self
            .dir
            .join(format!("{}.json", storage_key(conversation_id))))
    }
}

#[async_trait]
impl TurnStore for FileTurnStore {
    async fn load(&self, conversation_id: &str) -> StoreResult<Vec<Turn>> {
        let path = self.path_for(conversation_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, conversation_id: &str, turns: &[Turn]) -> StoreResult<()> {
        let path = self.path_for(conversation_id)?;
        let raw = serde_json::to_string(turns)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        // Write-then-rename so a crash never leaves a half-written history
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
