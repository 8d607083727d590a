//! The parsed performance trace.
//!
//! Timestamps and durations are in microseconds. Every event has a stable
//! textual key (`e-12` for main-thread work, `r-3` for network requests)
//! that the model uses to refer back to it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid trace JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate event key: {0}")]
    DuplicateKey(String),

    #[error("Invalid trace bounds: min {min} is after max {max}")]
    InvalidBounds { min: u64, max: u64 },

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),
}

/// A closed time range in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: u64,
    pub max: u64,
}

impl Bounds {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn duration(&self) -> u64 {
        self.max.saturating_sub(self.min)
    }

    /// Whether `[start, end]` overlaps this range.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start <= self.max && end >= self.min
    }

    /// Whether `other` lies entirely within this range.
    pub fn contains(&self, other: &Bounds) -> bool {
        other.min >= self.min && other.max <= self.max
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    #[default]
    Main,
    Worker,
}

/// What a trace event represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A top-level unit of main-thread work.
    Task,
    /// A sampled JavaScript function call.
    Function {
        function_name: String,
        #[serde(default)]
        url: String,
        #[serde(default)]
        line: u32,
        #[serde(default)]
        column: u32,
    },
    NetworkRequest {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        status: u16,
        #[serde(default)]
        mime_type: String,
        #[serde(default)]
        transfer_size: u64,
        #[serde(default)]
        priority: String,
        #[serde(default)]
        render_blocking: bool,
    },
    Other,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub key: String,
    pub name: String,
    pub ts: u64,
    #[serde(default)]
    pub dur: u64,
    /// Key of the enclosing event on the same thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub thread: ThreadKind,
    pub kind: EventKind,
}

impl TraceEvent {
    pub fn end(&self) -> u64 {
        self.ts.saturating_add(self.dur)
    }

    pub fn is_network_request(&self) -> bool {
        matches!(self.kind, EventKind::NetworkRequest { .. })
    }

    /// Main-thread, non-network work. Only these events form call trees.
    pub fn is_main_thread_work(&self) -> bool {
        self.thread == ThreadKind::Main
            && matches!(self.kind, EventKind::Task | EventKind::Function { .. })
    }

    /// `url:line:column` for function events.
    pub fn location(&self) -> Option<String> {
        match &self.kind {
            EventKind::Function { url, line, column, .. } if !url.is_empty() => {
                Some(format!("{url}:{line}:{column}"))
            }
            _ => None,
        }
    }
}

/// A precomputed finding about the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub related_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

/// A loaded trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceModel {
    pub id: String,
    pub url: String,
    pub bounds: Bounds,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
    #[serde(default)]
    pub insights: Vec<Insight>,
    /// Resource content by URL, as captured with the trace.
    #[serde(default)]
    pub resources: HashMap<String, String>,

    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl TraceModel {
    /// Parse and index a trace.
    pub fn from_json(json: &str) -> Result<Self, TraceError> {
        let mut model: TraceModel = serde_json::from_str(json)?;
        if model.bounds.min > model.bounds.max {
            return Err(TraceError::InvalidBounds {
                min: model.bounds.min,
                max: model.bounds.max,
            });
        }

        model.index = HashMap::with_capacity(model.events.len());
        for (i, event) in model.events.iter().enumerate() {
            if model.index.insert(event.key.clone(), i).is_some() {
                return Err(TraceError::DuplicateKey(event.key.clone()));
            }
        }

        debug!(
            trace_id = %model.id,
            events = model.events.len(),
            insights = model.insights.len(),
            "Trace loaded"
        );
        Ok(model)
    }

    pub async fn load(path: &Path) -> Result<Self, TraceError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn event(&self, key: &str) -> Option<&TraceEvent> {
        self.index.get(key).map(|&i| &self.events[i])
    }

    /// Direct children of an event, in trace order.
    pub fn children<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a TraceEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.parent.as_deref() == Some(key))
    }

    pub fn insight(&self, id: &str) -> Option<&Insight> {
        self.insights.iter().find(|i| i.id == id)
    }

    /// Main-thread work overlapping the bounds.
    pub fn main_thread_events_in(&self, bounds: &Bounds) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(move |e| e.is_main_thread_work() && bounds.overlaps(e.ts, e.end()))
    }

    /// Network requests overlapping the bounds.
    pub fn network_requests_in(&self, bounds: &Bounds) -> impl Iterator<Item = &TraceEvent> {
        self.events
            .iter()
            .filter(move |e| e.is_network_request() && bounds.overlaps(e.ts, e.end()))
    }

    pub fn network_requests(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter().filter(|e| e.is_network_request())
    }
}
