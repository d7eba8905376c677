//! Protocol-opaque request/response types and plugin capability descriptors.
//!
//! These are the shapes §3's `data` payload and `currentResponse` reduce to
//! once a concrete protocol plugin (HTTP, gRPC, GraphQL, ...) has done its
//! work; the engine and the sandbox never interpret their contents beyond
//! what's modeled here, matching §1's "protocol-opaque" framing.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::headers::HeaderBag;

/// A protocol-agnostic outbound request, as built from a request item's
/// `data` payload and mutated by `quest.request.*` facades / auth plugins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    /// Method/verb (`GET`, `POST`, a gRPC method name, ...). Defaults to
    /// `"GET"` for ad-hoc `quest.sendRequest` configs that omit it.
    pub method: String,
    /// Fully resolved URL (templates already expanded).
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HeaderBag,
    /// Request body, already resolved. `None` for bodyless requests.
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestData {
    /// Build a request with no headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self { method: method.into(), url: url.into(), headers: HeaderBag::new(), body: None }
    }
}

/// A protocol-agnostic response, as returned by a [`crate::ProtocolPlugin`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    /// Numeric status code (HTTP status, gRPC status mapped to an int, ...).
    pub status: u16,
    /// Human-readable status text (`"OK"`, `"Not Found"`, ...).
    #[serde(default)]
    pub status_text: String,
    /// Response headers.
    #[serde(default)]
    pub headers: HeaderBag,
    /// Body parsed as JSON, when the plugin could parse it as such.
    #[serde(default)]
    pub body: Option<Value>,
    /// Raw body text, always present when the plugin has textual content,
    /// backing `quest.response.text()` even when `json()` fails.
    #[serde(default)]
    pub raw_body: Option<String>,
    /// Wall-clock duration of the request, in milliseconds.
    pub time_ms: u64,
}

impl ResponseData {
    /// The parsed JSON body, or the null sentinel represented as `None`.
    pub fn json(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// The raw textual body, falling back to a JSON re-serialization of
    /// `body` when no raw text was captured.
    pub fn text(&self) -> String {
        self.raw_body
            .clone()
            .or_else(|| self.body.as_ref().map(|v| v.to_string()))
            .unwrap_or_default()
    }
}

/// Per-request execution options threaded through to the protocol plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Request-level timeout override, in milliseconds. The effective
    /// timeout is the first non-null of the request's own override and the
    /// run-wide default (spec §5).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A single message/event emitted mid-request by a streaming-capable
/// protocol (spec §4.6's "multi-event protocols"). Counted against
/// `quest.expectMessages(n)` and fed into `plugin-event` scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Event name, matched against the plugin's advertised
    /// [`EventCapability`] list.
    pub name: String,
    /// Event payload, handed to the `plugin-event` script as `quest.event`.
    pub payload: Value,
}

/// The full result of a protocol plugin's `execute` call: the final
/// response plus any interim events captured along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// The final response.
    pub response: ResponseData,
    /// Interim events observed during execution, in emission order.
    #[serde(default)]
    pub events: Vec<PluginEvent>,
}

impl ExecutionOutcome {
    /// Wrap a bare response with no interim events.
    pub fn from_response(response: ResponseData) -> Self {
        Self { response, events: Vec::new() }
    }
}

/// An event a protocol advertises as capable of carrying its own
/// `plugin-event` script and assertions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCapability {
    /// Event name (matches [`PluginEvent::name`]).
    pub name: String,
    /// Whether scripts bound to this event may run assertions
    /// (`quest.expectMessages` only counts events where this is `true`).
    pub can_have_tests: bool,
}

/// Static capability/identity descriptor for a protocol plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolCapabilities {
    /// Plugin name, as shown in diagnostics.
    pub name: String,
    /// Plugin semantic version.
    pub version: String,
    /// Protocol tag this plugin handles (matches `Collection.protocol`).
    pub protocol: String,
    /// Auth types this protocol accepts (used for validation, not dispatch;
    /// dispatch is by the auth plugin's own `auth_types`/`protocols`).
    #[serde(default)]
    pub auth_types: Vec<String>,
    /// When `true`, only auth types in `auth_types` are accepted; otherwise
    /// any registered auth plugin whose `protocols` include this one works.
    #[serde(default)]
    pub strict_auth_list: bool,
    /// Events this protocol may emit mid-request.
    #[serde(default)]
    pub events: Vec<EventCapability>,
}

/// Trait object a caller supplies so plugins can resolve a collection/scope
/// variable by name without the plugin crate depending on the engine's
/// scope-chain types.
pub trait VariableResolver: Send + Sync {
    /// Resolve `name` through the caller's precedence rules. Returns `None`
    /// for the null sentinel (spec §4.1).
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Read-only context handed to plugins for the duration of one call.
#[derive(Clone)]
pub struct PluginContext {
    /// The collection's declared protocol tag.
    pub protocol: String,
    /// The effective auth type for the call site, if any.
    pub auth_type: Option<String>,
    resolver: Arc<dyn VariableResolver>,
    /// Free-form metadata (iteration index, path, ...) plugins may read but
    /// the engine does not interpret.
    pub metadata: IndexMap<String, Value>,
}

impl PluginContext {
    /// Build a context around a resolver implementation.
    pub fn new(protocol: impl Into<String>, resolver: Arc<dyn VariableResolver>) -> Self {
        Self { protocol: protocol.into(), auth_type: None, resolver, metadata: IndexMap::new() }
    }

    /// Resolve a variable by name through the caller-supplied resolver.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.resolver.resolve(name)
    }

    /// Attach the effective auth type (builder-style).
    pub fn with_auth_type(mut self, auth_type: impl Into<String>) -> Self {
        self.auth_type = Some(auth_type.into());
        self
    }

    /// Attach a metadata entry (builder-style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("protocol", &self.protocol)
            .field("auth_type", &self.auth_type)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
