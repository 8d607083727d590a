//! Function-result cache, keyed per focus.
//!
//! Entries live for the whole session and are only dropped by
//! [`FunctionResultCache::clear_focus`] or [`FunctionResultCache::clear_all`].
//! Successful results are re-injected as facts on every turn for the same
//! focus so the model keeps access to everything it already looked up.

use devassist_core::context::FocusId;
use devassist_core::fact::{Fact, FactPriority};
use devassist_core::function::FunctionOutcome;
use std::collections::HashMap;

/// A memoized function result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    pub text: String,
    pub is_error: bool,
}

impl CachedResult {
    pub fn to_outcome(&self) -> FunctionOutcome {
        if self.is_error {
            FunctionOutcome::Error(self.text.clone())
        } else {
            FunctionOutcome::Result(self.text.clone())
        }
    }
}

impl From<&FunctionOutcome> for CachedResult {
    fn from(outcome: &FunctionOutcome) -> Self {
        Self {
            text: outcome.text().to_string(),
            is_error: outcome.is_error(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FunctionResultCache {
    // per focus, in insertion order
    entries: HashMap<FocusId, Vec<(String, CachedResult)>>,
}

impl FunctionResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, focus: &FocusId, key: &str) -> Option<&CachedResult> {
        self.entries
            .get(focus)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, result)| result)
    }

    /// Store a result. An existing entry for the same key is replaced in place.
    pub fn set(&mut self, focus: &FocusId, key: impl Into<String>, result: CachedResult) {
        let key = key.into();
        let entries = self.entries.entry(focus.clone()).or_default();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = result,
            None => entries.push((key, result)),
        }
    }

    /// Facts for every successful cached call of a focus.
    pub fn facts_for(&self, focus: &FocusId) -> Vec<Fact> {
        self.entries
            .get(focus)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, result)| !result.is_error)
                    .map(|(key, result)| Self::fact(key, &result.text))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The fact injected for a successful call.
    pub fn fact(key: &str, text: &str) -> Fact {
        Fact::new(
            format!("This is the result of calling {key}:\n{text}"),
            key,
            FactPriority::Default,
        )
    }

    pub fn clear_focus(&mut self, focus: &FocusId) {
        self.entries.remove(focus);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Total number of entries across all foci.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
