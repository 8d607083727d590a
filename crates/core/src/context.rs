//! Conversation context: the focus the assistant answers questions about.
//!
//! A context is an immutable wrapper around a focus object (a trace, a call
//! tree, an insight). It decides which facts, functions and one-time
//! structured descriptions accompany a turn. Two contexts are the same
//! context when their origins are equal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use crate::error::FunctionError;
use crate::fact::Fact;
use crate::function::FunctionRegistry;

/// Stable identifier of a focus object, used to key per-focus caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FocusId(pub String);

impl FocusId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FocusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// When a structured description should be re-sent with the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowPolicy {
    /// Sent at most once per conversation for a given object id.
    Once,
    /// Sent whenever it differs from the last object of the same kind.
    WhenChanged,
}

/// A structured object that is described in text once, ahead of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredContext {
    /// Explicit identity of the object (e.g. the call tree's root event key).
    pub id: String,
    /// Kind of object ("call_tree", "insight").
    pub kind: String,
    /// Text prepended to the query.
    pub description: String,
    pub policy: ShowPolicy,
}

/// A titled block shown in the context preamble event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDetail {
    pub title: String,
    pub text: String,
}

/// Literal URL → event key, used to rewrite links in answers.
pub type LinkIndex = HashMap<String, String>;

/// The focus wrapper a conversation turn is about.
pub trait ConversationContext: Send + Sync {
    /// Identity of the context; equality is by origin.
    fn origin(&self) -> &str;

    /// Key for per-focus caches. Defaults to the origin.
    fn focus_id(&self) -> FocusId {
        FocusId::new(self.origin())
    }

    /// Display title.
    fn title(&self) -> String;

    /// Suggested follow-up questions.
    fn suggestions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Instructions framing the model's role for this kind of context.
    fn preamble(&self) -> Option<String> {
        None
    }

    /// Always-present facts (format descriptions).
    fn static_facts(&self) -> Vec<Fact> {
        Vec::new()
    }

    /// Facts summarising the context. Computed once per distinct origin.
    fn summary_facts(&self) -> Vec<Fact> {
        Vec::new()
    }

    /// Structured object to describe ahead of the query, if any.
    fn structured_context(&self) -> Option<StructuredContext> {
        None
    }

    /// Blocks shown in the context preamble event.
    fn details(&self) -> Vec<ContextDetail> {
        Vec::new()
    }

    /// Known entities that answers may link to.
    fn link_index(&self) -> LinkIndex {
        LinkIndex::new()
    }

    /// Declare the functions available for this context.
    fn declare_functions(&self, _registry: &mut FunctionRegistry) -> Result<(), FunctionError> {
        Ok(())
    }
}

/// Whether two contexts are the same context.
pub fn same_origin(a: &dyn ConversationContext, b: &dyn ConversationContext) -> bool {
    a.origin() == b.origin()
}
