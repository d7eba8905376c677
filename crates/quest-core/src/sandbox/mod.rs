//! The per-script QuickJS sandbox: the `quest` API surface, console
//! capture, and the BDD assertion vocabulary (spec §4.2/§4.4).
//!
//! Grounded on the teacher's `request_scripting::ScriptEngine`: a fresh
//! `rquickjs::Runtime`/`Context` is built per invocation inside
//! `spawn_blocking`, wrapped in `tokio::time::timeout`, with context data
//! exposed on a single global object (`mockforge` there, `quest` here).
//! Unlike the teacher, failures are propagated as `Result`s end to end
//! instead of `.expect()`-panicking, and a thrown JS exception inside a
//! `quest.test` callback is turned into a failed/skipped [`TestResult`]
//! rather than aborting the whole script.

mod console;
mod quest_api;

use std::sync::Arc;
use std::time::Duration;

use rquickjs::{Context, Runtime};
use serde::{Deserialize, Serialize};

use crate::collection::TestDataRow;
use crate::context::{Environment, TestResult};
use crate::cookie_jar::CookieJar;
use crate::event_bus::ConsoleLevel;
use crate::history::HistoryEntry;
use crate::value::VarMap;
use crate::{Error, Result};
use quest_plugin_core::{CancellationToken, PluginRegistry, RequestData, ResponseData};

pub(crate) use quest_api::build_quest_object;

/// Which slot in the inheritance chain a script was written for (spec
/// §4.3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptType {
    CollectionPre,
    CollectionPost,
    FolderPre,
    FolderPost,
    RequestPre,
    RequestPost,
    /// Invoked once per plugin event payload for multi-event protocols
    /// (spec §4.6 "protocols that emit more than one event").
    PluginEvent,
}

impl ScriptType {
    /// Whether `quest.response`/`quest.request` (and thus the
    /// post-request API surface) should be exposed for this script.
    pub fn has_response(self) -> bool {
        matches!(self, Self::RequestPost | Self::FolderPost | Self::CollectionPost | Self::PluginEvent)
    }
}

/// The result of running one script (spec §3 "a script's own outcome").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub tests: Vec<TestResult>,
    /// Captured `console.*` lines paired with the level they were logged
    /// at, in call order (spec §6 `console` event `level` field).
    pub console_output: Vec<(ConsoleLevel, String)>,
}

impl ScriptOutcome {
    fn ok(tests: Vec<TestResult>, console_output: Vec<(ConsoleLevel, String)>) -> Self {
        Self { success: true, error: None, tests, console_output }
    }

    fn failed(error: impl Into<String>, tests: Vec<TestResult>, console_output: Vec<(ConsoleLevel, String)>) -> Self {
        Self { success: false, error: Some(error.into()), tests, console_output }
    }
}

/// Everything a script needs to see and everything it's allowed to
/// mutate, bundled so the sandbox can move it wholesale into
/// `spawn_blocking` and hand a (possibly mutated) copy back.
pub struct ScriptInput {
    pub script: String,
    pub script_type: ScriptType,
    pub scope: crate::scope::ScopeChain,
    pub collection_variables: VarMap,
    pub global_variables: VarMap,
    pub environment: Option<Environment>,
    pub cookie_jar: CookieJar,
    pub request: Option<RequestData>,
    pub request_options: Option<quest_plugin_core::RequestOptions>,
    pub response: Option<ResponseData>,
    pub iteration_current: u32,
    pub iteration_count: u32,
    pub iteration_data: Option<TestDataRow>,
    pub history: Vec<HistoryEntry>,
    pub plugins: Arc<PluginRegistry>,
    pub protocol: String,
    pub timeout_ms: Option<u64>,
    pub abort: CancellationToken,
    pub expected_messages: Option<u32>,
    pub current_event: Option<String>,
    pub current_path: String,
}

/// State written back into the run after a script completes.
pub struct ScriptOutput {
    pub outcome: ScriptOutcome,
    pub scope: crate::scope::ScopeChain,
    pub collection_variables: VarMap,
    pub global_variables: VarMap,
    pub environment: Option<Environment>,
    pub cookie_jar: CookieJar,
    pub request: Option<RequestData>,
    pub request_options: Option<quest_plugin_core::RequestOptions>,
    pub expected_messages: Option<u32>,
}

/// The embedded `expect(...).to.*` BDD matcher shim, evaluated into every
/// script's context alongside the user's own code (no native binding can
/// build a chainable proxy object, so the vocabulary itself lives in JS;
/// this mirrors how Postman/Newman bundle `chai.js`).
const PRELUDE: &str = include_str!("prelude.js");

/// Runs one script in an isolated QuickJS context with a wall-clock
/// timeout, mirroring the teacher's `spawn_blocking` + `tokio::time::timeout`
/// pattern.
pub struct ScriptSandbox {
    sink: Option<Arc<dyn SandboxSink>>,
}

/// Real-time callbacks fired as a script runs, so the event bus can emit
/// `assertion`/`console` events before the script itself finishes (spec
/// §4.8 "per-test, not buffered to the end").
pub trait SandboxSink: Send + Sync {
    fn on_test(&self, test: &TestResult);
    fn on_console(&self, level: ConsoleLevel, line: &str);
}

impl ScriptSandbox {
    pub fn new() -> Self {
        Self { sink: None }
    }

    pub fn with_sink(sink: Arc<dyn SandboxSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Execute `input.script`, honoring `input.timeout_ms` (falls back to
    /// 30s, matching the teacher's default script budget).
    pub async fn execute(&self, input: ScriptInput) -> Result<ScriptOutput> {
        if input.abort.is_aborted() {
            return Ok(ScriptOutput {
                outcome: ScriptOutcome::failed("Aborted", vec![], vec![]),
                scope: input.scope,
                collection_variables: input.collection_variables,
                global_variables: input.global_variables,
                environment: input.environment,
                cookie_jar: input.cookie_jar,
                request: input.request,
                request_options: input.request_options,
                expected_messages: input.expected_messages,
            });
        }

        let timeout = Duration::from_millis(input.timeout_ms.unwrap_or(30_000));
        let sink = self.sink.clone();
        let handle = tokio::runtime::Handle::current();

        let join = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || run_blocking(input, sink, handle)),
        )
        .await;

        match join {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::script(format!("script task panicked: {join_err}"))),
            Err(_) => Err(Error::script("script execution timed out")),
        }
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn run_blocking(
    input: ScriptInput,
    sink: Option<Arc<dyn SandboxSink>>,
    handle: tokio::runtime::Handle,
) -> Result<ScriptOutput> {
    let runtime = Runtime::new().map_err(Error::from)?;
    let context = Context::full(&runtime).map_err(Error::from)?;

    let state = quest_api::SandboxState::new(input, sink, handle);
    let state = std::rc::Rc::new(std::cell::RefCell::new(state));

    context.with(|ctx| -> Result<()> {
        let global = ctx.globals();
        let quest_obj = build_quest_object(ctx.clone(), state.clone())?;
        global.set("quest", quest_obj)?;
        console::install(ctx.clone(), state.clone())?;

        ctx.eval::<(), _>(PRELUDE).map_err(|e| Error::script(format!("prelude error: {e}")))?;

        let script = state.borrow().script.clone();
        match ctx.eval::<rquickjs::Value, _>(script.as_str()) {
            Ok(_) => Ok(()),
            Err(rquickjs::Error::Exception) => {
                let message = quest_api::js_exception_message(&ctx);
                let mut s = state.borrow_mut();
                s.top_level_error = Some(message);
                Ok(())
            }
            Err(other) => Err(Error::script(other.to_string())),
        }
    })?;

    let state = unwrap_state(state);
    let parts = state.into_parts();

    let outcome = if let Some(error) = parts.top_level_error {
        ScriptOutcome::failed(error, parts.tests, parts.console_output)
    } else {
        ScriptOutcome::ok(parts.tests, parts.console_output)
    };

    Ok(ScriptOutput {
        outcome,
        scope: parts.input.scope,
        collection_variables: parts.input.collection_variables,
        global_variables: parts.input.global_variables,
        environment: parts.input.environment,
        cookie_jar: parts.input.cookie_jar,
        request: parts.input.request,
        request_options: parts.input.request_options,
        expected_messages: parts.input.expected_messages,
    })
}

/// `Rc::try_unwrap` is infallible here: the context (and every closure
/// capturing a clone of `state`) has already been dropped by the time
/// `context.with` returns.
fn unwrap_state(state: std::rc::Rc<std::cell::RefCell<quest_api::SandboxState>>) -> quest_api::SandboxState {
    std::rc::Rc::try_unwrap(state)
        .unwrap_or_else(|_| panic!("sandbox state still shared after script completion"))
        .into_inner()
}
