//! Query enhancement with one-time structured context.
//!
//! Large structured objects (a serialized call tree, an insight) are
//! described in the query only when the model has not seen them yet in this
//! conversation. [`ShownObjects`] is the explicit registry of what was sent.

use devassist_core::context::{ShowPolicy, StructuredContext};
use std::collections::{HashMap, HashSet};

/// Registry of structured objects already described to the model.
#[derive(Debug, Default)]
pub struct ShownObjects {
    /// `(kind, id)` pairs sent under [`ShowPolicy::Once`].
    once: HashSet<(String, String)>,
    /// Last id sent per kind.
    last_by_kind: HashMap<String, String>,
}

impl ShownObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the object has to be described with the next query.
    pub fn needs_showing(&self, object: &StructuredContext) -> bool {
        match object.policy {
            ShowPolicy::Once => !self
                .once
                .contains(&(object.kind.clone(), object.id.clone())),
            ShowPolicy::WhenChanged => {
                self.last_by_kind.get(&object.kind) != Some(&object.id)
            }
        }
    }

    /// Record that the object reached the model.
    pub fn mark_shown(&mut self, object: &StructuredContext) {
        if object.policy == ShowPolicy::Once {
            self.once.insert((object.kind.clone(), object.id.clone()));
        }
        self.last_by_kind
            .insert(object.kind.clone(), object.id.clone());
    }

    pub fn clear(&mut self) {
        self.once.clear();
        self.last_by_kind.clear();
    }
}

/// Prepend an object's description to the user query.
pub fn enhance_query(query: &str, object: Option<&StructuredContext>) -> String {
    match object {
        Some(object) => format!("{}\n\n# User request\n\n{query}", object.description),
        None => query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(kind: &str, id: &str, policy: ShowPolicy) -> StructuredContext {
        StructuredContext {
            id: id.into(),
            kind: kind.into(),
            description: format!("# Selected {kind} {id}"),
            policy,
        }
    }

    #[test]
    fn once_objects_are_sent_a_single_time() {
        let mut shown = ShownObjects::new();
        let tree = object("call_tree", "e-1", ShowPolicy::Once);
        let other = object("call_tree", "e-2", ShowPolicy::Once);

        assert!(shown.needs_showing(&tree));
        shown.mark_shown(&tree);
        assert!(!shown.needs_showing(&tree));

        shown.mark_shown(&other);
        // switching back to the first tree does not resend it
        assert!(!shown.needs_showing(&tree));
    }

    #[test]
    fn when_changed_objects_follow_the_last_sent() {
        let mut shown = ShownObjects::new();
        let a = object("insight", "LCP", ShowPolicy::WhenChanged);
        let b = object("insight", "CLS", ShowPolicy::WhenChanged);

        shown.mark_shown(&a);
        assert!(!shown.needs_showing(&a));
        assert!(shown.needs_showing(&b));

        shown.mark_shown(&b);
        assert!(shown.needs_showing(&a));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut shown = ShownObjects::new();
        let tree = object("call_tree", "e-1", ShowPolicy::Once);
        shown.mark_shown(&tree);
        shown.clear();
        assert!(shown.needs_showing(&tree));
    }

    #[test]
    fn enhanced_query_layout() {
        let tree = object("call_tree", "e-1", ShowPolicy::Once);
        assert_eq!(
            enhance_query("Why slow?", Some(&tree)),
            "# Selected call_tree e-1\n\n# User request\n\nWhy slow?"
        );
        assert_eq!(enhance_query("Why slow?", None), "Why slow?");
    }
}
