//! File-based history: persistent JSON-lines storage.
//!
//! Each line is a JSON-encoded record `{conversation_id, item}`.
//!
//! Storage location: `~/.devassist/history/history.jsonl` unless configured.

use async_trait::async_trait;
use devassist_core::error::HistoryError;
use devassist_core::history::{HistoryItem, HistoryStore};
use devassist_core::message::ConversationId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{conversation_ids, Record};

/// A file-backed history store using JSONL (one record per line).
///
/// Records are loaded on creation and flushed to disk on every mutation.
pub struct FileHistory {
    path: PathBuf,
    records: Arc<RwLock<Vec<Record>>>,
}

impl FileHistory {
    /// Open a store at the given path. A missing file means an empty store;
    /// the file is created on first write.
    pub fn new(path: PathBuf) -> Self {
        let records = Self::load_from_disk(&path);
        debug!(path = %path.display(), count = records.len(), "File history loaded");
        Self {
            path,
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_disk(path: &Path) -> Vec<Record> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Record>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted history line");
                    None
                }
            })
            .collect()
    }

    async fn flush(&self) -> Result<(), HistoryError> {
        let records = self.records.read().await;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HistoryError::Storage(format!("Failed to create history directory: {e}"))
            })?;
        }

        let mut content = String::new();
        for record in records.iter() {
            let line = serde_json::to_string(record).map_err(|e| {
                HistoryError::Storage(format!("Failed to serialize history record: {e}"))
            })?;
            content.push_str(&line);
            content.push('\n');
        }

        std::fs::write(&self.path, &content)
            .map_err(|e| HistoryError::Storage(format!("Failed to write history file: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    fn name(&self) -> &str {
        "file"
    }

    async fn add_history_item(
        &self,
        conversation: &ConversationId,
        item: HistoryItem,
    ) -> Result<(), HistoryError> {
        self.records.write().await.push(Record {
            conversation_id: conversation.clone(),
            item,
        });
        self.flush().await
    }

    async fn read_all(&self, conversation: &ConversationId) -> Result<Vec<HistoryItem>, HistoryError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| &r.conversation_id == conversation)
            .map(|r| r.item.clone())
            .collect())
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, HistoryError> {
        Ok(conversation_ids(&self.records.read().await))
    }

    async fn clear(&self, conversation: &ConversationId) -> Result<bool, HistoryError> {
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|r| &r.conversation_id != conversation);
            records.len() < before
        };
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }
}
