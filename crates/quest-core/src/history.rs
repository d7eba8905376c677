//! Append-only execution history (spec §3 `HistoryEntry`, §9 "History").

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::TestResult;
use quest_plugin_core::ResponseData;

/// One completed request's entry in the run-wide history (spec §3).
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub iteration: u32,
    pub response: Option<ResponseData>,
    pub tests: Vec<TestResult>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only store; readers take a snapshot by index (spec §9).
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    entries: Vec<HistoryEntry>,
}

impl ExecutionHistory {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed entry. History only grows within a run.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    /// A read-only snapshot of every entry so far, in execution order.
    pub fn snapshot(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The most recent entry for `id`, if any has run yet.
    pub fn latest(&self, id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.id == id)
    }

    /// Filter entries whose `path` matches a glob-style `criteria`
    /// (`*` → `.*`, anchored to the full path), grounded on the teacher's
    /// glob-to-regex conversions used for its filter-regex CLI flag.
    pub fn filter(&self, criteria: &str) -> Vec<&HistoryEntry> {
        let pattern = glob_to_anchored_regex(criteria);
        self.entries.iter().filter(|e| pattern.is_match(&e.path)).collect()
    }
}

fn glob_to_anchored_regex(glob: &str) -> Regex {
    let escaped = regex::escape(glob).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).unwrap_or_else(|_| EMPTY_NEVER_MATCH.clone())
}

static EMPTY_NEVER_MATCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"$^").expect("static regex"));

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> HistoryEntry {
        HistoryEntry {
            id: path.to_string(),
            name: path.to_string(),
            path: path.to_string(),
            iteration: 1,
            response: None,
            tests: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn history_grows_monotonically() {
        let mut history = ExecutionHistory::new();
        history.push(entry("request:/a"));
        history.push(entry("request:/b"));
        assert_eq!(history.snapshot().len(), 2);
    }

    #[test]
    fn filter_matches_glob_anchored_to_full_path() {
        let mut history = ExecutionHistory::new();
        history.push(entry("request:/folder/a"));
        history.push(entry("request:/folder/b"));
        history.push(entry("request:/other/c"));
        let matches = history.filter("request:/folder/*");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn filter_is_fully_anchored_not_substring() {
        let mut history = ExecutionHistory::new();
        history.push(entry("request:/folder/a"));
        assert!(history.filter("folder/a").is_empty());
    }
}
