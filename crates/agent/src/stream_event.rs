//! Response events emitted by the run loop.
//!
//! `ResponseData` is what a front end consumes while a turn is running:
//! - `context`: preamble shown once per distinct context
//! - `querying`: a model request is about to be sent
//! - `answer`: partial (accumulated) or final answer text
//! - `action`: a function call being made, with its output
//! - `error`: terminal failure classification for the turn

use devassist_core::context::ContextDetail;
use devassist_core::message::ErrorKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Information about the context the answer is about.
    Context {
        title: String,
        details: Vec<ContextDetail>,
    },

    /// A model request for the given step is in flight.
    Querying { step: u32 },

    /// Answer text. Partial events carry everything received so far.
    Answer {
        text: String,
        complete: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        suggestions: Vec<String>,
    },

    /// A function call made on the model's behalf.
    Action {
        name: String,
        title: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default)]
        canceled: bool,
    },

    /// The turn ended without an answer.
    Error { kind: ErrorKind },
}

impl ResponseData {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Context { .. } => "context",
            Self::Querying { .. } => "querying",
            Self::Answer { .. } => "answer",
            Self::Action { .. } => "action",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this is the final answer of a turn.
    pub fn is_final_answer(&self) -> bool {
        matches!(self, Self::Answer { complete: true, .. })
    }
}
