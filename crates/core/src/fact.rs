//! Facts: prioritized context snippets injected into every model request.

use serde::{Deserialize, Serialize};

/// How important a fact is when the request has to be trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactPriority {
    Default = 1,
    Critical = 2,
    /// Never dropped.
    Required = 3,
}

impl FactPriority {
    pub fn score(self) -> u8 {
        self as u8
    }
}

/// A text snippet handed to the model alongside the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub text: String,
    /// Where the fact came from (formatter name, function call, ...).
    pub source: String,
    pub priority: FactPriority,
}

impl Fact {
    pub fn new(text: impl Into<String>, source: impl Into<String>, priority: FactPriority) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            priority,
        }
    }

    pub fn required(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(text, source, FactPriority::Required)
    }

    pub fn critical(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(text, source, FactPriority::Critical)
    }
}

/// Ordered set of facts for the active context.
///
/// Insertion order is kept; exact duplicates are ignored.
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    facts: Vec<Fact>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fact. Returns `false` if an identical fact is already present.
    pub fn add_fact(&mut self, fact: Fact) -> bool {
        if self.facts.contains(&fact) {
            return false;
        }
        self.facts.push(fact);
        true
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        for fact in facts {
            self.add_fact(fact);
        }
    }

    pub fn clear_facts(&mut self) {
        self.facts.clear();
    }

    /// All facts in insertion order.
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Facts to send with a request, highest priority first.
    ///
    /// With a byte budget, lower-priority facts that would overflow it are
    /// skipped; `Required` facts are always kept.
    pub fn select(&self, budget_bytes: Option<usize>) -> Vec<Fact> {
        let mut ordered: Vec<&Fact> = self.facts.iter().collect();
        // sort_by is stable, so equal priorities keep insertion order
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let Some(budget) = budget_bytes else {
            return ordered.into_iter().cloned().collect();
        };

        let mut used = 0usize;
        let mut selected = Vec::with_capacity(ordered.len());
        for fact in ordered {
            let size = fact.text.len();
            if fact.priority == FactPriority::Required || used + size <= budget {
                used += size;
                selected.push(fact.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_scores() {
        assert_eq!(FactPriority::Required.score(), 3);
        assert_eq!(FactPriority::Critical.score(), 2);
        assert_eq!(FactPriority::Default.score(), 1);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut store = FactStore::new();
        assert!(store.add_fact(Fact::required("a", "src")));
        assert!(!store.add_fact(Fact::required("a", "src")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn select_orders_by_priority_keeping_insertion_order() {
        let mut store = FactStore::new();
        store.add_fact(Fact::new("d1", "x", FactPriority::Default));
        store.add_fact(Fact::critical("c1", "x"));
        store.add_fact(Fact::new("d2", "x", FactPriority::Default));
        store.add_fact(Fact::required("r1", "x"));
        store.add_fact(Fact::critical("c2", "x"));

        let texts: Vec<String> = store.select(None).into_iter().map(|f| f.text).collect();
        assert_eq!(texts, vec!["r1", "c1", "c2", "d1", "d2"]);
    }

    #[test]
    fn select_with_budget_drops_low_priority_first() {
        let mut store = FactStore::new();
        store.add_fact(Fact::new("default-fact", "x", FactPriority::Default));
        store.add_fact(Fact::critical("critical", "x"));
        store.add_fact(Fact::required("required-but-very-long", "x"));

        let selected = store.select(Some(30));
        let texts: Vec<&str> = selected.iter().map(|f| f.text.as_str()).collect();
        // 22 (required) + 8 (critical) = 30, the default fact no longer fits
        assert_eq!(texts, vec!["required-but-very-long", "critical"]);
    }

    #[test]
    fn required_facts_survive_zero_budget() {
        let mut store = FactStore::new();
        store.add_fact(Fact::required("format", "x"));
        store.add_fact(Fact::critical("summary", "x"));
        let selected = store.select(Some(0));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].text, "format");
    }

    #[test]
    fn clear_empties_store() {
        let mut store = FactStore::new();
        store.extend(vec![Fact::required("a", "x"), Fact::critical("b", "x")]);
        store.clear_facts();
        assert!(store.is_empty());
    }
}
