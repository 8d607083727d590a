//! Message and Conversation domain types.
//!
//! Two layers live here:
//! - [`Message`] is the model-level transcript entry (system, user, assistant,
//!   tool result) that is sent to the model service.
//! - [`ChatMessage`] is the user-facing conversation history: one user turn
//!   followed by one model turn, appended only at turn boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in the model transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// System instructions (preamble)
    System,
    /// Function call result
    Tool,
}

/// A single entry in the model transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Function calls requested by the model (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a function result, which call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create an assistant message that only carries function calls.
    pub fn function_calls(calls: Vec<MessageToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, String::new());
        msg.tool_calls = calls;
        msg
    }

    /// Create a function result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// A function call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this call
    pub id: String,

    /// Name of the declared function to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

/// Terminal failure classification for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Transport or service failure.
    Unknown,
    /// The turn was cancelled by the caller.
    Abort,
    /// The model kept calling functions past the step limit.
    MaxSteps,
    /// The model service declined to answer.
    Block,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unknown => "UNKNOWN",
            Self::Abort => "ABORT",
            Self::MaxSteps => "MAX_STEPS",
            Self::Block => "BLOCK",
        };
        f.write_str(label)
    }
}

/// An image attached to a user query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatImage {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// One function call made while answering a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Human-readable progress title.
    pub title: String,
    /// Canonical action label (e.g. `getEventByKey({"eventKey":"r-3"})`).
    pub action: String,
    /// Text fed back to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub canceled: bool,
}

/// A user-facing conversation history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum ChatMessage {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<ChatImage>,
    },
    Model {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        #[serde(default)]
        steps: Vec<Step>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorKind>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        suggestions: Vec<String>,
    },
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            image: None,
        }
    }

    pub fn answer(text: impl Into<String>, steps: Vec<Step>, suggestions: Vec<String>) -> Self {
        Self::Model {
            answer: Some(text.into()),
            steps,
            error: None,
            suggestions,
        }
    }

    pub fn failure(kind: ErrorKind, steps: Vec<Step>) -> Self {
        Self::Model {
            answer: None,
            steps,
            error: Some(kind),
            suggestions: Vec::new(),
        }
    }
}

/// A conversation is the ordered, append-only chat history shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered chat history
    pub messages: Vec<ChatMessage>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,

    /// Title of the first context the conversation was about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title: None,
        }
    }

    /// Append one complete turn (user query plus model reply).
    pub fn push_turn(&mut self, user: ChatMessage, model: ChatMessage) {
        self.updated_at = Utc::now();
        self.messages.push(user);
        self.messages.push(model);
    }

    /// Drop the whole history ("new chat"). The id is regenerated.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
