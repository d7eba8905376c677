//! Run options and the result types a collection run produces
//! (spec §3: `TestResult`, `RequestResult`, `RunResult`), plus the shared
//! state every concurrent node reads and writes during a run.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::collection::{CollectionInfo, TestDataRow};
use crate::cookie_jar::CookieJar;
use crate::history::ExecutionHistory;
use crate::scope::{ScopeChain, ScopeFrame, ScopeLevel};
use crate::value::VarMap;
use quest_plugin_core::{CancellationToken, PluginRegistry, ResponseData, ValidationError};

/// Run-wide options (spec §4.5/§4.7/§5, expanded per §10.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Bounded concurrency. `0` normalizes to `1` (spec §4.5/§8).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// `false` forces sequential (concurrency 1) regardless of
    /// `max_concurrency`.
    #[serde(default)]
    pub allow_parallel: bool,
    /// Stop the run (without starting new nodes) on the first failed
    /// assertion.
    #[serde(default)]
    pub bail: bool,
    /// Inter-request delay applied only in sequential mode.
    #[serde(default)]
    pub delay_ms: u64,
    /// Repetition count used when no iteration data source is present.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Optional full-path filter regex (`kind:/segments`).
    #[serde(default)]
    pub filter: Option<String>,
    /// Default per-request timeout, overridable per-request.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether the cookie jar persists across requests within a run.
    #[serde(default = "default_jar_persist")]
    pub jar_persist: bool,
    /// CLI-supplied iteration data, highest priority (spec §4.5).
    #[serde(default)]
    pub iteration_data: Option<Vec<TestDataRow>>,
    /// Active environment, if any.
    #[serde(default)]
    pub environment: Option<Environment>,
    /// Global variables for the whole run.
    #[serde(default)]
    pub global_variables: VarMap,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_iterations() -> u32 {
    1
}

fn default_jar_persist() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            allow_parallel: false,
            bail: false,
            delay_ms: 0,
            iterations: default_iterations(),
            filter: None,
            timeout_ms: None,
            jar_persist: default_jar_persist(),
            iteration_data: None,
            environment: None,
            global_variables: VarMap::new(),
        }
    }
}

impl RunOptions {
    /// Effective concurrency after normalizing `0` and `allow_parallel`
    /// (spec §4.5/§8).
    pub fn effective_concurrency(&self) -> usize {
        if !self.allow_parallel {
            return 1;
        }
        self.max_concurrency.max(1)
    }
}

/// A named environment (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub vars: VarMap,
}

impl Environment {
    /// Lazily-created default environment name (spec §4.1
    /// `environment.set` lazily creates the environment with a default
    /// name if absent).
    pub fn default_lazy() -> Self {
        Self { name: "default".to_string(), vars: VarMap::new() }
    }
}

/// The result of a single assertion (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub error: Option<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self { name: name.into(), passed: true, skipped: false, error: None }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self { name: name.into(), passed: false, skipped: false, error: Some(error.into()) }
    }

    pub fn skipped(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self { name: name.into(), passed: false, skipped: true, error: Some(error.into()) }
    }
}

/// Per-request outcome aggregated into [`RunResult`] (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_id: String,
    pub path: String,
    pub response: Option<ResponseData>,
    pub tests: Vec<TestResult>,
    pub console_output: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// The final, aggregated result of a run (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub collection_info: CollectionInfo,
    pub request_results: Vec<RequestResult>,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub validation_errors: Vec<ValidationError>,
}

impl RunResult {
    /// An empty result for a collection, before any request runs.
    pub fn new(collection_info: CollectionInfo) -> Self {
        Self {
            collection_info,
            request_results: Vec::new(),
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            aborted: false,
            abort_reason: None,
            validation_errors: Vec::new(),
        }
    }

    /// Fold one request's result into the running totals (spec §3 invariant:
    /// `totalTests == passed + failed + skipped`).
    pub fn record(&mut self, result: RequestResult) {
        for test in &result.tests {
            self.total_tests += 1;
            if test.skipped {
                self.skipped_tests += 1;
            } else if test.passed {
                self.passed_tests += 1;
            } else {
                self.failed_tests += 1;
            }
        }
        self.request_results.push(result);
    }
}

/// The canonical collection and folder scope frames, shared by every
/// concurrent node so that a mutation made by one sibling's script is
/// visible to the next (spec §5 "concurrent requests ... share lower
/// frames; mutation ... is serialized by the script mutex").
///
/// Frames are plain (not individually locked) because every read/write
/// happens while the run's single script mutex is held, so there is
/// never more than one script touching this map at a time; the `Mutex`
/// here only satisfies `Send`/`Sync`, it is never contended.
#[derive(Clone)]
pub struct SharedScopeFrames {
    collection: Arc<Mutex<ScopeFrame>>,
    folders: Arc<Mutex<IndexMap<String, ScopeFrame>>>,
}

impl SharedScopeFrames {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection: Arc::new(Mutex::new(ScopeFrame::new(ScopeLevel::Collection, collection_id))),
            folders: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// Build a request-ready [`ScopeChain`]: the collection frame, then
    /// one frame per id in `folder_path` (created empty on first sight),
    /// then a fresh request frame. Call under the run's script mutex.
    pub async fn snapshot_chain(&self, folder_path: &[String], request_id: &str) -> ScopeChain {
        let collection_frame = self.collection.lock().await.clone();
        let mut frames = vec![collection_frame];
        let mut folders = self.folders.lock().await;
        for id in folder_path {
            let frame = folders
                .entry(id.clone())
                .or_insert_with(|| ScopeFrame::new(ScopeLevel::Folder, id.clone()))
                .clone();
            frames.push(frame);
        }
        drop(folders);
        frames.push(ScopeFrame::new(ScopeLevel::Request, request_id));
        ScopeChain::from_frames(frames)
    }

    /// Build a scope chain for a folder's own `folderPreScript`/
    /// `folderPostScript` (spec §4.3 "push folder frame on folder entry"):
    /// the collection frame, then one frame per id in `full_folder_path`
    /// (which includes the folder itself, unlike the ancestor-only paths
    /// used for its descendants), with no request frame appended.
    pub async fn snapshot_folder_chain(&self, full_folder_path: &[String]) -> ScopeChain {
        let collection_frame = self.collection.lock().await.clone();
        let mut frames = vec![collection_frame];
        let mut folders = self.folders.lock().await;
        for id in full_folder_path {
            let frame = folders
                .entry(id.clone())
                .or_insert_with(|| ScopeFrame::new(ScopeLevel::Folder, id.clone()))
                .clone();
            frames.push(frame);
        }
        ScopeChain::from_frames(frames)
    }

    /// Write back a chain built by [`Self::snapshot_folder_chain`]; unlike
    /// [`Self::commit_chain`] there is no request frame to discard.
    pub async fn commit_folder_chain(&self, chain: ScopeChain) {
        let frames = chain.into_frames();
        let mut iter = frames.into_iter();
        if let Some(collection_frame) = iter.next() {
            *self.collection.lock().await = collection_frame;
        }
        let mut folders = self.folders.lock().await;
        for frame in iter {
            folders.insert(frame.id.clone(), frame);
        }
    }

    /// Write the (possibly mutated) ancestor frames of `chain` back,
    /// discarding its request frame, which is never shared.
    pub async fn commit_chain(&self, chain: ScopeChain) {
        let mut frames = chain.into_frames();
        frames.pop(); // the request frame never persists
        let mut iter = frames.into_iter();
        if let Some(collection_frame) = iter.next() {
            *self.collection.lock().await = collection_frame;
        }
        let mut folders = self.folders.lock().await;
        for frame in iter {
            folders.insert(frame.id.clone(), frame);
        }
    }
}

/// A snapshot of cross-request shared data, cheaply cloned per node so
/// concurrent executions can each run against the same run-wide resources
/// while still sharing the underlying `Arc<Mutex<_>>` cells.
#[derive(Clone)]
pub struct SharedRunState {
    pub collection_variables: Arc<Mutex<VarMap>>,
    pub global_variables: Arc<Mutex<VarMap>>,
    pub environment: Arc<Mutex<Option<Environment>>>,
    pub history: Arc<Mutex<ExecutionHistory>>,
    pub cookie_jar: Arc<Mutex<CookieJar>>,
    pub plugins: Arc<PluginRegistry>,
    pub abort: CancellationToken,
    pub scope_frames: SharedScopeFrames,
    /// Serializes every script invocation run-wide (spec §4.5/§5
    /// "scripts run one-at-a-time even when protocol execution is
    /// parallel").
    pub script_mutex: Arc<Mutex<()>>,
}

impl SharedRunState {
    /// Build fresh shared state for a run.
    pub fn new(
        plugins: Arc<PluginRegistry>,
        global_variables: VarMap,
        environment: Option<Environment>,
        collection_id: impl Into<String>,
    ) -> Self {
        Self {
            collection_variables: Arc::new(Mutex::new(VarMap::new())),
            global_variables: Arc::new(Mutex::new(global_variables)),
            environment: Arc::new(Mutex::new(environment)),
            history: Arc::new(Mutex::new(ExecutionHistory::new())),
            cookie_jar: Arc::new(Mutex::new(CookieJar::new())),
            plugins,
            abort: CancellationToken::new(),
            scope_frames: SharedScopeFrames::new(collection_id),
            script_mutex: Arc::new(Mutex::new(())),
        }
    }
}
