//! # DevAssist Core
//!
//! Domain types, traits, and error definitions for the DevAssist
//! conversation agent. This crate defines the model every other crate
//! implements against: the model service boundary, declared functions,
//! facts, conversation contexts and the persisted history.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here. Implementations live in
//! their respective crates, so the run loop can be driven by scripted
//! providers and in-memory stores in tests.

pub mod error;
pub mod message;
pub mod provider;
pub mod fact;
pub mod function;
pub mod context;
pub mod history;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ChatMessage, Conversation, ConversationId, ErrorKind, Message, Role, Step};
pub use provider::{ModelProvider, ModelRequest, ModelResponse, StreamChunk};
pub use fact::{Fact, FactPriority, FactStore};
pub use function::{DeclaredFunction, DisplayInfo, FunctionOutcome, FunctionRegistry, ParameterSchema};
pub use context::{ConversationContext, FocusId, LinkIndex, ShowPolicy, StructuredContext};
pub use history::{HistoryItem, HistoryItemKind, HistoryStore};
pub use event::{DomainEvent, EventBus};
