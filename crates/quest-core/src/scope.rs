//! Scope frames and the scope chain (spec §3 "Scope Frame", §4.1 "Mutation").

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value::{Resolved, VarMap};

/// The level a [`ScopeFrame`] was pushed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// The run-wide collection frame, always present at the bottom.
    Collection,
    /// A folder instance frame, pushed on entry and popped on exit.
    Folder,
    /// A single request's frame, pushed at pre-script time and popped after
    /// the request's own + inherited post-scripts complete.
    Request,
}

/// A single named, mutable variable frame (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeFrame {
    /// The level this frame represents.
    pub level: ScopeLevel,
    /// The id of the collection/folder/request this frame belongs to.
    pub id: String,
    /// The frame's own variables.
    pub vars: VarMap,
}

impl ScopeFrame {
    /// Create an empty frame for the given level/id.
    pub fn new(level: ScopeLevel, id: impl Into<String>) -> Self {
        Self { level, id: id.into(), vars: VarMap::new() }
    }
}

/// A non-empty stack of [`ScopeFrame`]s, always collection-frame-at-bottom.
///
/// Resolution walks top → bottom (spec §4.1); mutation finds the first frame
/// (top → bottom) that already holds the key, falling back to the top frame.
#[derive(Debug, Clone)]
pub struct ScopeChain {
    frames: Vec<ScopeFrame>,
}

impl ScopeChain {
    /// Start a new chain with only the collection frame.
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self { frames: vec![ScopeFrame::new(ScopeLevel::Collection, collection_id)] }
    }

    /// Rebuild a chain from an already-ordered (bottom-to-top) frame list,
    /// e.g. when re-snapshotting shared ancestor frames before a script call.
    pub fn from_frames(frames: Vec<ScopeFrame>) -> Self {
        debug_assert!(!frames.is_empty(), "scope chain requires at least a collection frame");
        Self { frames }
    }

    /// Consume the chain, returning its frames bottom-to-top.
    pub fn into_frames(self) -> Vec<ScopeFrame> {
        self.frames
    }

    /// Push a new frame onto the top of the chain.
    pub fn push(&mut self, frame: ScopeFrame) {
        self.frames.push(frame);
    }

    /// Pop the top frame. Never pops the last remaining (collection) frame.
    pub fn pop(&mut self) -> Option<ScopeFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// The top frame.
    pub fn top(&self) -> &ScopeFrame {
        self.frames.last().expect("scope chain is never empty")
    }

    /// The top frame, mutably.
    pub fn top_mut(&mut self) -> &mut ScopeFrame {
        self.frames.last_mut().expect("scope chain is never empty")
    }

    /// All frames, bottom to top.
    pub fn frames(&self) -> &[ScopeFrame] {
        &self.frames
    }

    /// Look up `key`, walking top → bottom. Returns the null sentinel if no
    /// frame has it.
    pub fn get(&self, key: &str) -> Resolved {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.vars.get(key) {
                return Resolved::Found(value.clone());
            }
        }
        Resolved::Null
    }

    /// `scope.set(k, v)`: overwrite the first frame (top → bottom) that
    /// already has `key`; else set it on the top frame.
    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        let key = key.into();
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.contains_key(&key) {
                frame.vars.insert(key, value);
                return;
            }
        }
        self.top_mut().vars.insert(key, value);
    }

    /// `scope.clear()`: clears only the top frame.
    pub fn clear_top(&mut self) {
        self.top_mut().vars.clear();
    }

    /// `scope.remove(k)`: removes `key` from whichever frame holds it, if
    /// any.
    pub fn remove(&mut self, key: &str) {
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.shift_remove(key).is_some() {
                return;
            }
        }
    }

    /// `scope.toObject()`: merge bottom → top so the top frame shadows.
    pub fn to_object(&self) -> VarMap {
        let mut merged = VarMap::new();
        for frame in &self.frames {
            for (k, v) in &frame.vars {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> JsonValue {
        JsonValue::String(v.to_string())
    }

    #[test]
    fn resolution_walks_top_to_bottom() {
        let mut chain = ScopeChain::new("col");
        chain.top_mut().vars.insert("apiUrl".into(), s("col"));
        chain.push(ScopeFrame::new(ScopeLevel::Folder, "f1"));
        chain.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        chain.top_mut().vars.insert("apiUrl".into(), s("req"));
        assert_eq!(chain.get("apiUrl"), Resolved::Found(s("req")));
    }

    #[test]
    fn set_overwrites_existing_lower_frame_in_place() {
        let mut chain = ScopeChain::new("col");
        chain.top_mut().vars.insert("x".into(), s("col-value"));
        chain.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        chain.set("x", s("new-value"));
        // Overwritten in the collection frame, not duplicated on top.
        assert_eq!(chain.frames()[1].vars.get("x"), None);
        assert_eq!(chain.frames()[0].vars.get("x"), Some(&s("new-value")));
    }

    #[test]
    fn set_writes_to_top_when_key_is_new() {
        let mut chain = ScopeChain::new("col");
        chain.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        chain.set("y", s("top-value"));
        assert_eq!(chain.frames()[1].vars.get("y"), Some(&s("top-value")));
    }

    #[test]
    fn clear_only_affects_top_frame() {
        let mut chain = ScopeChain::new("col");
        chain.top_mut().vars.insert("x".into(), s("col"));
        chain.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        chain.top_mut().vars.insert("y".into(), s("req"));
        chain.clear_top();
        assert_eq!(chain.get("y"), Resolved::Null);
        assert_eq!(chain.get("x"), Resolved::Found(s("col")));
    }

    #[test]
    fn to_object_merges_with_top_shadowing() {
        let mut chain = ScopeChain::new("col");
        chain.top_mut().vars.insert("x".into(), s("col"));
        chain.push(ScopeFrame::new(ScopeLevel::Request, "r1"));
        chain.top_mut().vars.insert("x".into(), s("req"));
        chain.top_mut().vars.insert("y".into(), s("only-in-req"));
        let obj = chain.to_object();
        assert_eq!(obj.get("x"), Some(&s("req")));
        assert_eq!(obj.get("y"), Some(&s("only-in-req")));
    }

    #[test]
    fn pop_never_removes_collection_frame() {
        let mut chain = ScopeChain::new("col");
        assert!(chain.pop().is_none());
        assert_eq!(chain.frames().len(), 1);
    }
}
