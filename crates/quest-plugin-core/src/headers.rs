//! Case-insensitive, order-preserving, multi-valued header storage.
//!
//! The spec mandates case-insensitive header lookup "throughout" the engine
//! (request building, response reading, `Set-Cookie` ingestion) without naming
//! a dedicated module for it, so every header-bearing type in this workspace
//! shares this single implementation instead of re-deriving the rule.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An ordered multimap of header name/value pairs with case-insensitive access.
///
/// Original casing of the first occurrence of each name is preserved for
/// display (`to_map`), but all lookups, inserts, and removals are
/// case-insensitive, matching real HTTP header semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    /// Create an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bag from an iterator of (name, value) pairs, preserving order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut bag = Self::new();
        for (k, v) in pairs {
            bag.append(k, v);
        }
        bag
    }

    /// Append a header occurrence without removing existing ones with the
    /// same name (used for multi-valued headers like `Set-Cookie`).
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Set a header, replacing every existing case-insensitive match. If none
    /// existed, the new header is appended.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut replaced = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(&key) {
                if !replaced {
                    *v = value.clone();
                    replaced = true;
                    true
                } else {
                    false
                }
            } else {
                true
            }
        });
        if !replaced {
            self.entries.push((key, value));
        }
    }

    /// Set the header only if no case-insensitive match already exists.
    ///
    /// Used where the engine must not clobber a caller-set value, e.g.
    /// auth plugins must not overwrite an existing `Authorization` header.
    pub fn set_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !self.contains(&key) {
            self.entries.push((key, value.into()));
        }
    }

    /// First value matching `key`, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values matching `key`, case-insensitively, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether any header matches `key`, case-insensitively.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Remove every occurrence matching `key`, case-insensitively.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Iterate all (name, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the bag has no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collapse into a display map: single values as strings, repeated names
    /// as arrays, matching the `quest.response.headers` shape in the spec
    /// (`map<string, string | list<string>>`).
    pub fn to_map(&self) -> IndexMap<String, Vec<String>> {
        let mut out: IndexMap<String, Vec<String>> = IndexMap::new();
        for (k, v) in &self.entries {
            let canonical = out.keys().find(|existing| existing.eq_ignore_ascii_case(k)).cloned();
            let key = canonical.unwrap_or_else(|| k.clone());
            out.entry(key).or_default().push(v.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut bag = HeaderBag::new();
        bag.append("Content-Type", "application/json");
        assert_eq!(bag.get("content-type"), Some("application/json"));
        assert_eq!(bag.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn set_replaces_all_case_variants() {
        let mut bag = HeaderBag::new();
        bag.append("X-Foo", "1");
        bag.append("x-foo", "2");
        bag.set("X-FOO", "3");
        assert_eq!(bag.get_all("x-foo"), vec!["3"]);
    }

    #[test]
    fn set_if_absent_preserves_caller_value() {
        let mut bag = HeaderBag::new();
        bag.append("Authorization", "Bearer caller-token");
        bag.set_if_absent("authorization", "Basic plugin-applied");
        assert_eq!(bag.get("Authorization"), Some("Bearer caller-token"));
    }

    #[test]
    fn multi_valued_headers_survive_to_map() {
        let mut bag = HeaderBag::new();
        bag.append("Set-Cookie", "a=1");
        bag.append("set-cookie", "b=2");
        let map = bag.to_map();
        assert_eq!(map.get("Set-Cookie").map(Vec::len), Some(2));
    }
}
