//! The typed event envelope stream (spec §4.8/§6/§9).
//!
//! Delivery is synchronous with respect to the emitting operation: the
//! engine blocks on each subscriber's return before continuing, which is
//! what makes the ordering guarantees in spec §5 hold.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collection::CollectionInfo;
use crate::context::{RequestResult, RunResult, TestResult};
use crate::sandbox::ScriptOutcome;
use quest_plugin_core::{RequestData, ResponseData, ValidationError};

/// The kind of item a path segment refers to (spec §6 "Paths are formed
/// as `<kind>:/<segments>`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    Collection,
    Folder,
    Request,
}

/// Common metadata attached to most events (spec §4.8/§6/GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub path: String,
    pub path_type: PathType,
    pub collection_info: CollectionInfo,
    pub iteration: Option<u32>,
}

/// Severity of a captured `console.*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// A pre-run validation summary (spec §6 `beforeRun`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub errors: Vec<ValidationError>,
}

impl ValidationSummary {
    pub fn ok() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The full set of typed events the engine emits (spec §6 table).
#[derive(Debug, Clone)]
pub enum Event {
    BeforeRun { collection_info: CollectionInfo, options_summary: String, validation: ValidationSummary, expected_test_count: usize },
    AfterRun { collection_info: CollectionInfo, result: RunResult },

    BeforeIteration { envelope: Envelope },
    AfterIteration { envelope: Envelope, duration_ms: u64 },

    BeforeFolder { envelope: Envelope },
    AfterFolder { envelope: Envelope, duration_ms: u64 },

    BeforeFolderPreScript { envelope: Envelope },
    AfterFolderPreScript { envelope: Envelope, result: ScriptOutcome },
    BeforeFolderPostScript { envelope: Envelope },
    AfterFolderPostScript { envelope: Envelope, result: ScriptOutcome },

    BeforeCollectionPreScript { envelope: Envelope },
    AfterCollectionPreScript { envelope: Envelope, result: ScriptOutcome },
    BeforeCollectionPostScript { envelope: Envelope },
    AfterCollectionPostScript { envelope: Envelope, result: ScriptOutcome },

    BeforeItem { envelope: Envelope, request: RequestData },
    AfterItem { envelope: Envelope, request: RequestData, response: Option<ResponseData>, result: RequestResult },

    BeforePreScript { envelope: Envelope, request: RequestData },
    AfterPreScript { envelope: Envelope, request: RequestData, result: ScriptOutcome },

    BeforeRequest { envelope: Envelope, request: RequestData },
    AfterRequest { envelope: Envelope, request: RequestData, response: Option<ResponseData>, duration_ms: u64 },

    BeforePostScript { envelope: Envelope, request: RequestData },
    AfterPostScript { envelope: Envelope, request: RequestData, response: Option<ResponseData>, result: ScriptOutcome },

    Assertion { test: TestResult, request: Option<RequestData>, response: Option<ResponseData> },
    Console { envelope: Envelope, line: String, level: ConsoleLevel },
    Exception { envelope: Envelope, error: String },
}

/// A subscriber to the event bus. Implementors are invoked synchronously,
/// in registration order, for every emitted event.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventSubscriber for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Synchronous, ordered dispatcher (spec §4.8/§9).
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are owned by the caller (usually
    /// the runner) and simply dropped at run end; there is no separate
    /// deregistration call.
    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Deliver `event` to every subscriber, in registration order, blocking
    /// on each before moving to the next (spec §9: "Ordering is preserved
    /// by executing callbacks on the emitting task").
    pub fn emit(&self, event: Event) {
        for subscriber in &self.subscribers {
            subscriber.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_see_events_in_emission_order() {
        let mut bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen_clone = seen.clone();
        bus.subscribe(Arc::new(move |event: &Event| {
            let label = match event {
                Event::BeforeIteration { .. } => "before",
                Event::AfterIteration { .. } => "after",
                _ => "other",
            };
            seen_clone.lock().unwrap().push(label.to_string());
        }));
        let envelope = Envelope {
            path: "collection:/".into(),
            path_type: PathType::Collection,
            collection_info: CollectionInfo { id: "c".into(), name: "c".into(), version: None, description: None },
            iteration: Some(1),
        };
        bus.emit(Event::BeforeIteration { envelope: envelope.clone() });
        bus.emit(Event::AfterIteration { envelope, duration_ms: 10 });
        assert_eq!(*seen.lock().unwrap(), vec!["before".to_string(), "after".to_string()]);
    }

    #[test]
    fn multiple_subscribers_all_invoked() {
        let mut bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(Arc::new(move |_event: &Event| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        bus.emit(Event::Exception { envelope: Envelope { path: "request:/a".into(), path_type: PathType::Request, collection_info: CollectionInfo { id: "c".into(), name: "c".into(), version: None, description: None }, iteration: None }, error: "boom".into() });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
