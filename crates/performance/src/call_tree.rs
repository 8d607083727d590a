//! Call trees rooted at a main-thread event.

use std::collections::HashSet;
use std::fmt::Write;

use crate::format::fmt_ms;
use crate::trace::TraceModel;

#[derive(Debug, Clone, PartialEq)]
pub struct CallTreeNode {
    pub key: String,
    pub name: String,
    pub location: Option<String>,
    /// Total duration in microseconds.
    pub total: u64,
    /// Duration not covered by children.
    pub self_time: u64,
    pub children: Vec<CallTreeNode>,
}

/// The tree of main-thread work below one event.
#[derive(Debug, Clone, PartialEq)]
pub struct CallTree {
    pub root: CallTreeNode,
}

impl CallTree {
    /// Build the tree below `key`.
    ///
    /// Returns `None` when the key is unknown or names something other than
    /// main-thread work (network requests never root a call tree).
    pub fn build(model: &TraceModel, key: &str) -> Option<Self> {
        let event = model.event(key)?;
        if !event.is_main_thread_work() {
            return None;
        }
        let mut visited = HashSet::new();
        let root = build_node(model, key, &mut visited)?;
        Some(Self { root })
    }

    pub fn root_key(&self) -> &str {
        &self.root.key
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &CallTreeNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        count(&self.root)
    }

    /// Indented text form, one node per line:
    /// `key name (url:line:column) total=12.3ms self=4.0ms`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        write_node(&self.root, 0, &mut out);
        out
    }
}

fn build_node(model: &TraceModel, key: &str, visited: &mut HashSet<String>) -> Option<CallTreeNode> {
    // malformed traces may contain parent cycles
    if !visited.insert(key.to_string()) {
        return None;
    }
    let event = model.event(key)?;

    let children: Vec<CallTreeNode> = model
        .children(key)
        .filter(|child| child.is_main_thread_work())
        .filter_map(|child| build_node(model, &child.key, visited))
        .collect();
    let covered: u64 = children.iter().map(|c| c.total).sum();

    Some(CallTreeNode {
        key: event.key.clone(),
        name: event.name.clone(),
        location: event.location(),
        total: event.dur,
        self_time: event.dur.saturating_sub(covered),
        children,
    })
}

fn write_node(node: &CallTreeNode, depth: usize, out: &mut String) {
    let _ = write!(out, "{}{} {}", "  ".repeat(depth), node.key, node.name);
    if let Some(location) = &node.location {
        let _ = write!(out, " ({location})");
    }
    let _ = writeln!(
        out,
        " total={} self={}",
        fmt_ms(node.total),
        fmt_ms(node.self_time)
    );
    for child in &node.children {
        write_node(child, depth + 1, out);
    }
}
