//! The performance conversation context.

use std::fmt;
use std::sync::{Arc, OnceLock};

use devassist_core::context::{
    ContextDetail, ConversationContext, LinkIndex, ShowPolicy, StructuredContext,
};
use devassist_core::error::FunctionError;
use devassist_core::fact::Fact;
use devassist_core::function::FunctionRegistry;

use crate::call_tree::CallTree;
use crate::format;
use crate::functions;
use crate::resources::{ResourceLoader, TraceResourceLoader};
use crate::trace::{EventKind, TraceError, TraceModel};

const PREAMBLE: &str = "\
You are a performance expert helping a web developer understand a recorded \
performance trace of their page. Use the facts and the functions you are given \
to investigate before answering. Refer to trace events by their key (for \
example e-12 or r-3), give concrete and actionable advice, and keep answers \
short. Only answer questions about web performance and this trace.";

/// What the user selected in the trace.
///
/// A single event and a call tree are separate selections; a call tree can
/// only be rooted at main-thread work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    None,
    Event(String),
    CallTree(String),
    Insight(String),
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("overview"),
            Self::Event(key) => write!(f, "event:{key}"),
            Self::CallTree(key) => write!(f, "call-tree:{key}"),
            Self::Insight(id) => write!(f, "insight:{id}"),
        }
    }
}

/// A trace and what is selected in it.
#[derive(Debug, Clone)]
pub struct PerformanceFocus {
    pub trace: Arc<TraceModel>,
    pub selection: Selection,
}

/// Conversation context over a [`PerformanceFocus`].
pub struct PerformanceContext {
    focus: PerformanceFocus,
    origin: String,
    loader: Arc<dyn ResourceLoader>,
    call_tree: Option<CallTree>,
    suggestions: OnceLock<Vec<String>>,
}

impl PerformanceContext {
    /// Wrap a focus, checking that the selection refers to something in the
    /// trace.
    pub fn new(trace: Arc<TraceModel>, selection: Selection) -> Result<Self, TraceError> {
        let call_tree = match &selection {
            Selection::None => None,
            Selection::Event(key) => {
                if trace.event(key).is_none() {
                    return Err(TraceError::InvalidSelection(format!("no event with key {key}")));
                }
                None
            }
            Selection::CallTree(key) => match CallTree::build(&trace, key) {
                Some(tree) => Some(tree),
                None => {
                    return Err(TraceError::InvalidSelection(format!(
                        "{key} is not main-thread work"
                    )));
                }
            },
            Selection::Insight(id) => {
                if trace.insight(id).is_none() {
                    return Err(TraceError::InvalidSelection(format!("no insight with id {id}")));
                }
                None
            }
        };

        let origin = format!("trace:{}/{}", trace.id, selection);
        let loader: Arc<dyn ResourceLoader> = Arc::new(TraceResourceLoader::new(trace.clone()));
        Ok(Self {
            focus: PerformanceFocus { trace, selection },
            origin,
            loader,
            call_tree,
            suggestions: OnceLock::new(),
        })
    }

    /// Use a host loader for `getResourceContent` instead of the trace's
    /// embedded resources.
    pub fn with_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn focus(&self) -> &PerformanceFocus {
        &self.focus
    }

    fn trace(&self) -> &TraceModel {
        &self.focus.trace
    }

    fn compute_suggestions(&self) -> Vec<String> {
        let list: &[&str] = match &self.focus.selection {
            Selection::None => &[
                "What are the biggest performance problems in this trace?",
                "How can I make this page load faster?",
            ],
            Selection::Event(key) => match self.trace().event(key).map(|e| &e.kind) {
                Some(EventKind::NetworkRequest { .. }) => &[
                    "Why is this request slow?",
                    "Is this request render-blocking?",
                ],
                _ => &["What is this event doing?", "Is this event slow?"],
            },
            Selection::CallTree(_) => &[
                "Where is most of the time being spent in this call tree?",
                "How can I reduce the time of this task?",
            ],
            Selection::Insight(_) => &[
                "Help me optimize this",
                "What does this insight mean?",
            ],
        };
        list.iter().map(|s| s.to_string()).collect()
    }
}

impl ConversationContext for PerformanceContext {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn title(&self) -> String {
        let trace = self.trace();
        match &self.focus.selection {
            Selection::None => format!("Trace of {}", trace.url),
            Selection::Event(key) => match trace.event(key) {
                Some(event) => format!("Event {} ({key})", event.name),
                None => format!("Event {key}"),
            },
            Selection::CallTree(key) => match trace.event(key) {
                Some(event) => format!("Call tree {} ({key})", event.name),
                None => format!("Call tree {key}"),
            },
            Selection::Insight(id) => match trace.insight(id) {
                Some(insight) => format!("Insight: {}", insight.title),
                None => format!("Insight {id}"),
            },
        }
    }

    fn suggestions(&self) -> Vec<String> {
        self.suggestions
            .get_or_init(|| self.compute_suggestions())
            .clone()
    }

    fn preamble(&self) -> Option<String> {
        Some(PREAMBLE.to_string())
    }

    fn static_facts(&self) -> Vec<Fact> {
        vec![
            Fact::required(format::CALL_TREE_FORMAT, "call-tree-format"),
            Fact::required(format::NETWORK_REQUEST_FORMAT, "network-request-format"),
        ]
    }

    fn summary_facts(&self) -> Vec<Fact> {
        let trace = self.trace();
        let mut facts = vec![Fact::critical(format::trace_summary(trace), "trace-summary")];
        if let Selection::Event(key) = &self.focus.selection {
            if let Some(event) = trace.event(key) {
                facts.push(Fact::critical(
                    format!("# Selected event\n\n{}", format::event_details(trace, event)),
                    "selected-event",
                ));
            }
        }
        facts
    }

    fn structured_context(&self) -> Option<StructuredContext> {
        match &self.focus.selection {
            Selection::CallTree(key) => self.call_tree.as_ref().map(|tree| StructuredContext {
                id: key.clone(),
                kind: "call_tree".into(),
                description: format!("# Selected call tree\n\n{}", tree.serialize()),
                policy: ShowPolicy::Once,
            }),
            Selection::Insight(id) => self.trace().insight(id).map(|insight| StructuredContext {
                id: id.clone(),
                kind: "insight".into(),
                description: format!(
                    "# Selected insight\n\n{}",
                    format::insight_details(self.trace(), insight)
                ),
                policy: ShowPolicy::WhenChanged,
            }),
            Selection::None | Selection::Event(_) => None,
        }
    }

    fn details(&self) -> Vec<ContextDetail> {
        let trace = self.trace();
        let mut details = vec![ContextDetail {
            title: "Trace".into(),
            text: format!("{} ({})", trace.url, format::fmt_ms(trace.bounds.duration())),
        }];
        match &self.focus.selection {
            Selection::None => {}
            Selection::Event(key) => {
                if let Some(event) = trace.event(key) {
                    details.push(ContextDetail {
                        title: "Selected event".into(),
                        text: format::event_details(trace, event),
                    });
                }
            }
            Selection::CallTree(_) => {
                if let Some(tree) = &self.call_tree {
                    details.push(ContextDetail {
                        title: "Selected call tree".into(),
                        text: tree.serialize(),
                    });
                }
            }
            Selection::Insight(id) => {
                if let Some(insight) = trace.insight(id) {
                    details.push(ContextDetail {
                        title: "Selected insight".into(),
                        text: insight.summary.clone(),
                    });
                }
            }
        }
        details
    }

    fn link_index(&self) -> LinkIndex {
        self.trace()
            .network_requests()
            .filter_map(|event| match &event.kind {
                EventKind::NetworkRequest { url, .. } => Some((url.clone(), event.key.clone())),
                _ => None,
            })
            .collect()
    }

    fn declare_functions(&self, registry: &mut FunctionRegistry) -> Result<(), FunctionError> {
        functions::declare_all(registry, &self.focus.trace, &self.loader)
    }
}
