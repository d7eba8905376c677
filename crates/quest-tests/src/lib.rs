//! Shared test fixtures for `quest-core`'s integration suite: a mock
//! protocol/auth plugin pair and terse collection-tree builders.
//!
//! Grounded on `quest-core`'s own `dag.rs`/`scheduler.rs` `#[cfg(test)]`
//! helper functions (`request`/`folder`/`collection`), lifted here so every
//! `tests/*.rs` file shares one definition instead of redeclaring them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex as AsyncMutex;

use quest_core::{Collection, CollectionInfo, Folder, Item, ItemCommon, Request, TestDataRow};
use quest_plugin_core::{
    AuthConfig, AuthPlugin, AuthValidation, CancellationToken, ExecutionOutcome, HeaderBag, PluginContext,
    PluginError, ProtocolCapabilities, ProtocolPlugin, RequestData, RequestOptions, ResponseData, ValidationError,
};

/// A canned response plus an artificial latency, keyed by `(method, url)`.
#[derive(Clone)]
struct MockRoute {
    response: ResponseData,
    delay: Duration,
}

/// An in-memory, deterministic [`ProtocolPlugin`] for tests: canned
/// responses keyed by method/URL, optional artificial latency (for the
/// parallel-speedup scenario), and a `/delay/<ms>` route that sleeps while
/// honoring cancellation (for the abort-mid-script scenario). Every request
/// it sees is recorded for later assertions.
pub struct MockProtocolPlugin {
    capabilities: ProtocolCapabilities,
    routes: IndexMap<(String, String), MockRoute>,
    received: AsyncMutex<Vec<RequestData>>,
}

impl MockProtocolPlugin {
    pub fn builder(protocol: impl Into<String>) -> MockProtocolPluginBuilder {
        MockProtocolPluginBuilder {
            protocol: protocol.into(),
            routes: IndexMap::new(),
        }
    }

    /// Requests this plugin has seen, in arrival order.
    pub async fn received(&self) -> Vec<RequestData> {
        self.received.lock().await.clone()
    }
}

pub struct MockProtocolPluginBuilder {
    protocol: String,
    routes: IndexMap<(String, String), MockRoute>,
}

impl MockProtocolPluginBuilder {
    /// Register a canned response for `method`/`url`, with no artificial delay.
    pub fn route(mut self, method: &str, url: &str, response: ResponseData) -> Self {
        self.routes.insert((method.to_ascii_uppercase(), url.to_string()), MockRoute { response, delay: Duration::ZERO });
        self
    }

    /// Register a canned response that only resolves after `delay`.
    pub fn slow_route(mut self, method: &str, url: &str, response: ResponseData, delay: Duration) -> Self {
        self.routes.insert((method.to_ascii_uppercase(), url.to_string()), MockRoute { response, delay });
        self
    }

    pub fn build(self) -> MockProtocolPlugin {
        MockProtocolPlugin {
            capabilities: ProtocolCapabilities {
                name: "mock".to_string(),
                version: "0.1.0".to_string(),
                protocol: self.protocol,
                auth_types: Vec::new(),
                strict_auth_list: false,
                events: Vec::new(),
            },
            routes: self.routes,
            received: AsyncMutex::new(Vec::new()),
        }
    }
}

/// Parses a `/delay/<ms>` path suffix, for the abort-mid-script scenario.
fn parse_delay_path(url: &str) -> Option<u64> {
    url.rsplit_once("/delay/").and_then(|(_, ms)| ms.parse().ok())
}

#[async_trait]
impl ProtocolPlugin for MockProtocolPlugin {
    fn capabilities(&self) -> &ProtocolCapabilities {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: RequestData,
        _options: RequestOptions,
        signal: CancellationToken,
    ) -> Result<ExecutionOutcome, PluginError> {
        self.received.lock().await.push(request.clone());

        if let Some(ms) = parse_delay_path(&request.url) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = signal.aborted() => return Err(PluginError::Aborted),
            }
            return Ok(ExecutionOutcome::from_response(ResponseData {
                status: 200,
                status_text: "OK".to_string(),
                headers: HeaderBag::new(),
                body: None,
                raw_body: None,
                time_ms: ms,
            }));
        }

        let key = (request.method.to_ascii_uppercase(), request.url.clone());
        let route = self
            .routes
            .get(&key)
            .ok_or_else(|| PluginError::Other(format!("no mock route for {} {}", request.method, request.url)))?
            .clone();

        if !route.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(route.delay) => {}
                _ = signal.aborted() => return Err(PluginError::Aborted),
            }
        }

        Ok(ExecutionOutcome::from_response(route.response))
    }
}

/// A deterministic [`AuthPlugin`] that stamps a bearer token (from
/// `auth.params.token`, defaulting to `"mock-token"`) onto the request.
pub struct MockAuthPlugin {
    auth_types: Vec<String>,
    protocols: Vec<String>,
}

impl MockAuthPlugin {
    pub fn new(auth_type: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self { auth_types: vec![auth_type.into()], protocols: vec![protocol.into()] }
    }
}

#[async_trait]
impl AuthPlugin for MockAuthPlugin {
    fn name(&self) -> &str {
        "mock-auth"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn auth_types(&self) -> &[String] {
        &self.auth_types
    }

    fn protocols(&self) -> &[String] {
        &self.protocols
    }

    fn validate(&self, _auth: &AuthConfig, _ctx: &PluginContext) -> AuthValidation {
        AuthValidation::Valid
    }

    async fn apply(&self, mut request: RequestData, auth: &AuthConfig, _ctx: &PluginContext) -> Result<RequestData, PluginError> {
        let token = auth.params.get("token").and_then(|v| v.as_str()).unwrap_or("mock-token");
        request.headers.set_if_absent("Authorization", format!("Bearer {token}"));
        Ok(request)
    }
}

/// A rejecting [`AuthPlugin::validate`] implementation, for exercising the
/// pre-run validation path.
pub struct RejectingAuthPlugin {
    auth_types: Vec<String>,
    protocols: Vec<String>,
}

impl RejectingAuthPlugin {
    pub fn new(auth_type: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self { auth_types: vec![auth_type.into()], protocols: vec![protocol.into()] }
    }
}

#[async_trait]
impl AuthPlugin for RejectingAuthPlugin {
    fn name(&self) -> &str {
        "rejecting-auth"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn auth_types(&self) -> &[String] {
        &self.auth_types
    }

    fn protocols(&self) -> &[String] {
        &self.protocols
    }

    fn validate(&self, _auth: &AuthConfig, _ctx: &PluginContext) -> AuthValidation {
        AuthValidation::Invalid(vec![ValidationError::new("mock auth config always rejected")])
    }

    async fn apply(&self, request: RequestData, _auth: &AuthConfig, _ctx: &PluginContext) -> Result<RequestData, PluginError> {
        Ok(request)
    }
}

pub fn ok_response(body: JsonValue) -> ResponseData {
    ResponseData {
        status: 200,
        status_text: "OK".to_string(),
        headers: HeaderBag::new(),
        raw_body: Some(body.to_string()),
        body: Some(body),
        time_ms: 1,
    }
}

pub fn response_with_headers(body: JsonValue, headers: Vec<(&str, &str)>) -> ResponseData {
    let mut bag = HeaderBag::new();
    for (k, v) in headers {
        bag.append(k, v);
    }
    ResponseData { status: 200, status_text: "OK".to_string(), headers: bag, raw_body: Some(body.to_string()), body: Some(body), time_ms: 1 }
}

/// Bare item metadata with no scripts, auth, or dependencies.
pub fn common(id: &str) -> ItemCommon {
    ItemCommon {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: Vec::new(),
        condition: None,
        auth: None,
        pre_request_script: None,
        post_request_script: None,
    }
}

/// A request leaf with no scripts, hitting `method url`.
pub fn request(id: &str, method: &str, url: &str) -> Request {
    Request { common: common(id), data: RequestData::new(method, url), options: RequestOptions::default(), test_data: None }
}

pub fn request_item(id: &str, method: &str, url: &str) -> Item {
    Item::Request(request(id, method, url))
}

/// An empty folder with no scripts.
pub fn folder(id: &str, items: Vec<Item>) -> Folder {
    Folder { common: common(id), folder_pre_script: None, folder_post_script: None, items, test_data: None }
}

pub fn folder_item(id: &str, items: Vec<Item>) -> Item {
    Item::Folder(folder(id, items))
}

/// A minimal collection over `items`, declaring protocol `"mock"`.
pub fn collection(items: Vec<Item>) -> Collection {
    Collection {
        info: CollectionInfo { id: "c".to_string(), name: "collection".to_string(), version: None, description: None },
        protocol: "mock".to_string(),
        items,
        variables: TestDataRow::new(),
        test_data: None,
        pre_request_script: None,
        post_request_script: None,
        auth: None,
    }
}

/// A registry over a single mock protocol plugin, no auth plugins.
pub fn registry_with_protocol(protocol: MockProtocolPlugin) -> Arc<quest_plugin_core::PluginRegistry> {
    Arc::new(quest_plugin_core::PluginRegistry::builder().with_protocol(Arc::new(protocol)).build())
}
