//! Cooperative cancellation token shared between the engine and every plugin.
//!
//! Grounded on the teacher's `ChainExecutionEngine` timeout/abort handling in
//! `request_chaining.rs`, generalized per spec §4.7/§9 into a single
//! `{aborted, reason}` cell with child tokens that flip when the parent does.
//! The primitive lives here (not in `quest-core`) because `ProtocolPlugin`
//! and `AuthPlugin` must accept it without depending on the engine crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    aborted: AtomicBool,
    reason: parking_lot_free::ReasonCell,
    notify: Notify,
    parent: Option<CancellationToken>,
}

/// A cooperative abort signal. Cloning shares the same underlying state.
///
/// Setting is idempotent: the first `trip` wins and its reason is retained;
/// later calls are no-ops, matching the "duplicate abort leaves the first
/// reason" property in spec §8.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a fresh, un-tripped root token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                reason: parking_lot_free::ReasonCell::new(),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child token. The child is considered aborted whenever the
    /// parent is aborted (checked lazily, not via a background task), and can
    /// also be tripped independently (e.g. a per-request timeout that must
    /// not abort the whole run).
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                reason: parking_lot_free::ReasonCell::new(),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Trip the token with `reason`. No-op if already tripped (on this token
    /// or an ancestor).
    pub fn trip(&self, reason: impl Into<String>) {
        if self.is_aborted() {
            return;
        }
        if self.inner.aborted.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.inner.reason.set(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether this token or any ancestor has been tripped.
    pub fn is_aborted(&self) -> bool {
        if self.inner.aborted.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_aborted(),
            None => false,
        }
    }

    /// The reason the token (or its nearest tripped ancestor) was aborted.
    pub fn reason(&self) -> Option<String> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(reason);
        }
        self.inner.parent.as_ref().and_then(CancellationToken::reason)
    }

    /// Resolve once the token becomes aborted. Resolves immediately if
    /// already aborted. Races this token's own trip against every ancestor's,
    /// since tripping a parent only notifies waiters registered on the
    /// parent's own `Notify`, not a child's.
    pub async fn aborted(&self) {
        match self.inner.parent.clone() {
            Some(parent) => {
                tokio::select! {
                    _ = self.wait_self() => {}
                    _ = Box::pin(parent.aborted()) => {}
                }
            }
            None => self.wait_self().await,
        }
    }

    /// Resolve once this exact token (ignoring ancestors) is tripped.
    async fn wait_self(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.aborted.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
            if self.inner.aborted.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A tiny dependency-free mutex-backed cell, kept local so this crate does
/// not need to pick between `std::sync::Mutex` (blocking) and `parking_lot`
/// for a single `Option<String>` write-once-ish slot.
mod parking_lot_free {
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct ReasonCell(Mutex<Option<String>>);

    impl ReasonCell {
        pub fn new() -> Self {
            Self(Mutex::new(None))
        }

        pub fn set(&self, reason: String) {
            let mut guard = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
            if guard.is_none() {
                *guard = Some(reason);
            }
        }

        pub fn get(&self) -> Option<String> {
            self.0.lock().unwrap_or_else(|poison| poison.into_inner()).clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_trip_keeps_first_reason() {
        let token = CancellationToken::new();
        token.trip("first");
        token.trip("second");
        assert!(token.is_aborted());
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn child_observes_parent_trip() {
        let parent = CancellationToken::new();
        let child = parent.child();
        assert!(!child.is_aborted());
        parent.trip("run aborted");
        assert!(child.is_aborted());
        assert_eq!(child.reason().as_deref(), Some("run aborted"));
    }

    #[test]
    fn child_trip_does_not_affect_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.trip("request timeout");
        assert!(child.is_aborted());
        assert!(!parent.is_aborted());
    }

    #[tokio::test]
    async fn aborted_future_resolves_on_trip() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.aborted().await;
        });
        token.trip("go");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn child_aborted_future_resolves_on_parent_trip() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let waiter = child.clone();
        let handle = tokio::spawn(async move {
            waiter.aborted().await;
        });
        parent.trip("run aborted");
        handle.await.unwrap();
    }
}
