//! In-memory history: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use devassist_core::error::HistoryError;
use devassist_core::history::{HistoryItem, HistoryStore};
use devassist_core::message::ConversationId;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{conversation_ids, Record};

/// A history store that keeps every record in a Vec.
pub struct InMemoryHistory {
    records: Arc<RwLock<Vec<Record>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    fn name(&self) -> &str {
        "in_memory"
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
        Ok(())
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
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| &r.conversation_id != conversation);
        Ok(records.len() < before)
    }
}
