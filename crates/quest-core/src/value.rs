//! Variable values, the null sentinel, and `{{name}}` template interpolation.
//!
//! Grounded on the teacher's `templating.rs` token-replacement approach
//! (`Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}")` plus literal-on-miss fallback),
//! generalized per spec §4.1 to resolve through an arbitrary precedence chain
//! instead of a fixed token table.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

/// An ordered variable map. `IndexMap` (not `HashMap`) so that
/// `ScopeChain::to_object` and `Cookies::toObject`-style dumps have a
/// deterministic, insertion-order iteration — useful for snapshot tests and
/// matching how the teacher's `ChainContext`/`Profile.data` preserve
/// declaration order.
pub type VarMap = indexmap::IndexMap<String, JsonValue>;

/// The outcome of a variable lookup.
///
/// Spec §4.1: "A miss returns the null sentinel" — distinct from an empty
/// string. [`Resolved::Null`] is that sentinel; [`Resolved::Found`] carries
/// whatever JSON value was stored (strings, numbers, objects, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// A value was found.
    Found(JsonValue),
    /// No layer had the key.
    Null,
}

impl Resolved {
    /// Whether this is the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The found value, if any.
    pub fn into_value(self) -> Option<JsonValue> {
        match self {
            Self::Found(v) => Some(v),
            Self::Null => None,
        }
    }

    /// Render as the string a template placeholder would be replaced with.
    ///
    /// Strings render bare (no quotes); everything else renders as its JSON
    /// form, matching ordinary template-engine behavior (a number fills in
    /// as `42`, not `"42"`).
    pub fn display_string(&self) -> Option<String> {
        match self {
            Self::Found(JsonValue::String(s)) => Some(s.clone()),
            Self::Found(other) => Some(other.to_string()),
            Self::Null => None,
        }
    }
}

impl From<Option<JsonValue>> for Resolved {
    fn from(value: Option<JsonValue>) -> Self {
        match value {
            Some(v) => Self::Found(v),
            None => Self::Null,
        }
    }
}

/// Matches a single, non-nested `{{ident}}` placeholder. Deliberately
/// excludes `{` and `}` from the identifier body so that `{{{{a}}}}`-style
/// nesting is not matched recursively (spec §4.1: "Matching is performed
/// once per occurrence (no recursive expansion)").
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("static regex"));

/// Replace every `{{ident}}` occurrence in `template` using `resolve`.
///
/// Unresolved placeholders are left literal (spec §4.1). A whitespace-only
/// template is returned unchanged without invoking `resolve` at all.
pub fn replace_in(template: &str, mut resolve: impl FnMut(&str) -> Resolved) -> String {
    if template.trim().is_empty() {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).expect("group 0 always matches");
        let ident = caps.get(1).expect("group 1 required by pattern").as_str();
        out.push_str(&template[last..whole.start()]);
        match resolve(ident).display_string() {
            Some(value) => out.push_str(&value),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Resolved + '_ {
        move |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| Resolved::Found(JsonValue::String((*v).to_string())))
                .unwrap_or(Resolved::Null)
        }
    }

    #[test]
    fn replaces_known_placeholder() {
        let out = replace_in("hello {{name}}", resolver(&[("name", "world")]));
        assert_eq!(out, "hello world");
    }

    #[test]
    fn leaves_unresolved_placeholder_literal() {
        let out = replace_in("hello {{missing}}", resolver(&[]));
        assert_eq!(out, "hello {{missing}}");
    }

    #[test]
    fn whitespace_only_template_is_unchanged() {
        let out = replace_in("   \t  ", resolver(&[("x", "y")]));
        assert_eq!(out, "   \t  ");
    }

    #[test]
    fn does_not_recursively_expand() {
        // A resolved value that itself looks like a placeholder is not
        // re-expanded: matching happens once per occurrence in the source.
        let out = replace_in("{{a}}", resolver(&[("a", "{{b}}")]));
        assert_eq!(out, "{{b}}");
    }

    #[test]
    fn numbers_render_bare() {
        let out = replace_in("count={{n}}", |name| {
            if name == "n" {
                Resolved::Found(JsonValue::Number(42.into()))
            } else {
                Resolved::Null
            }
        });
        assert_eq!(out, "count=42");
    }

    #[test]
    fn no_placeholders_returns_input_unchanged() {
        let out = replace_in("plain text", resolver(&[]));
        assert_eq!(out, "plain text");
    }
}
