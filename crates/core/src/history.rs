//! History store trait: the persisted, append-only conversation log.
//!
//! The run loop appends one item per chat message at the end of a turn.
//! Stores are append-only per conversation; `read_all` returns the items in
//! the order they were added so a previous conversation can be rebuilt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::HistoryError;
use crate::message::{ChatMessage, ConversationId, ErrorKind, Step};

/// The kind of a persisted history item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryItemKind {
    User,
    Answer,
    Error,
}

/// A single persisted history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub kind: HistoryItemKind,

    #[serde(default)]
    pub text: String,

    /// Structured extras: steps, suggestions, error kind.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl HistoryItem {
    /// Convert a chat message into its persisted form.
    pub fn from_chat(message: &ChatMessage) -> Self {
        let mut metadata = serde_json::Map::new();
        let (kind, text) = match message {
            ChatMessage::User { text, image } => {
                if let Some(image) = image {
                    metadata.insert("image".into(), serde_json::json!(image));
                }
                (HistoryItemKind::User, text.clone())
            }
            ChatMessage::Model {
                answer,
                steps,
                error,
                suggestions,
            } => {
                if !steps.is_empty() {
                    metadata.insert("steps".into(), serde_json::json!(steps));
                }
                if !suggestions.is_empty() {
                    metadata.insert("suggestions".into(), serde_json::json!(suggestions));
                }
                match error {
                    Some(kind) => {
                        metadata.insert("error".into(), serde_json::json!(kind));
                        (HistoryItemKind::Error, answer.clone().unwrap_or_default())
                    }
                    None => (HistoryItemKind::Answer, answer.clone().unwrap_or_default()),
                }
            }
        };
        Self {
            kind,
            text,
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Rebuild the chat message this item was created from.
    pub fn to_chat(&self) -> ChatMessage {
        let field = |name: &str| self.metadata.get(name).cloned();
        match self.kind {
            HistoryItemKind::User => ChatMessage::User {
                text: self.text.clone(),
                image: field("image").and_then(|v| serde_json::from_value(v).ok()),
            },
            HistoryItemKind::Answer | HistoryItemKind::Error => {
                let steps: Vec<Step> = field("steps")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let suggestions: Vec<String> = field("suggestions")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let error: Option<ErrorKind> = field("error").and_then(|v| serde_json::from_value(v).ok());
                let answer = if self.kind == HistoryItemKind::Answer || !self.text.is_empty() {
                    Some(self.text.clone())
                } else {
                    None
                };
                ChatMessage::Model {
                    answer,
                    steps,
                    error,
                    suggestions,
                }
            }
        }
    }
}

/// Rebuild a chat history from persisted items.
pub fn rebuild_chat(items: &[HistoryItem]) -> Vec<ChatMessage> {
    items.iter().map(HistoryItem::to_chat).collect()
}

/// The persisted history collaborator.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Store backend name (e.g., "in_memory", "file").
    fn name(&self) -> &str;

    /// Append an item to a conversation's log.
    async fn add_history_item(
        &self,
        conversation: &ConversationId,
        item: HistoryItem,
    ) -> Result<(), HistoryError>;

    /// All items of a conversation, in insertion order.
    async fn read_all(&self, conversation: &ConversationId) -> Result<Vec<HistoryItem>, HistoryError>;

    /// Conversations with at least one item, in order of first appearance.
    async fn conversations(&self) -> Result<Vec<ConversationId>, HistoryError>;

    /// Drop a conversation's log. Returns whether anything was removed.
    async fn clear(&self, conversation: &ConversationId) -> Result<bool, HistoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_round_trips_through_item() {
        let step = Step {
            title: "Investigating".into(),
            action: "getEventByKey({\"eventKey\":\"r-1\"})".into(),
            output: Some("{}".into()),
            canceled: false,
        };
        let chat = ChatMessage::answer("All good", vec![step], vec!["Why?".into()]);
        let item = HistoryItem::from_chat(&chat);
        assert_eq!(item.kind, HistoryItemKind::Answer);
        assert_eq!(item.to_chat(), chat);
    }

    #[test]
    fn blocked_answer_has_no_text() {
        let chat = ChatMessage::failure(ErrorKind::Block, vec![]);
        let item = HistoryItem::from_chat(&chat);
        assert_eq!(item.kind, HistoryItemKind::Error);
        assert!(item.text.is_empty());
        assert_eq!(item.to_chat(), chat);
    }

    #[test]
    fn rebuild_keeps_order() {
        let items = vec![
            HistoryItem::from_chat(&ChatMessage::user("q")),
            HistoryItem::from_chat(&ChatMessage::answer("a", vec![], vec![])),
        ];
        let chat = rebuild_chat(&items);
        assert_eq!(chat[0], ChatMessage::user("q"));
        assert!(matches!(&chat[1], ChatMessage::Model { answer: Some(a), .. } if a == "a"));
    }
}
