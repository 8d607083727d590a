//! Performance traces as a conversation context.
//!
//! A recorded trace is loaded into a [`TraceModel`]. A [`PerformanceContext`]
//! wraps the trace together with what the user selected (nothing, a single
//! event, a call tree or an insight) and gives the agent:
//! - summary and format facts
//! - the serialized call tree or insight as one-time structured context
//! - declared functions to drill into the trace
//! - a link index so answers can point back at network requests

pub mod call_tree;
pub mod context;
pub mod format;
pub mod functions;
pub mod resources;
pub mod trace;

pub use call_tree::{CallTree, CallTreeNode};
pub use context::{PerformanceContext, PerformanceFocus, Selection};
pub use resources::{ResourceLoader, TraceResourceLoader};
pub use trace::{Bounds, EventKind, Insight, ThreadKind, TraceError, TraceEvent, TraceModel};
