//! Conversation history stores for DevAssist.
//!
//! Both stores keep one flat, append-only list of records tagged with the
//! conversation they belong to, which is also the on-disk line format of
//! [`FileHistory`].

pub mod in_memory;
pub mod file_backend;

use devassist_core::history::HistoryItem;
use devassist_core::message::ConversationId;
use serde::{Deserialize, Serialize};

pub use in_memory::InMemoryHistory;
pub use file_backend::FileHistory;

/// One stored history line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Record {
    pub conversation_id: ConversationId,
    pub item: HistoryItem,
}

/// Conversation ids in order of first appearance.
pub(crate) fn conversation_ids(records: &[Record]) -> Vec<ConversationId> {
    let mut ids: Vec<ConversationId> = Vec::new();
    for record in records {
        if !ids.contains(&record.conversation_id) {
            ids.push(record.conversation_id.clone());
        }
    }
    ids
}
