//! Builds the `quest` global object: request/response/variable facades,
//! the cookie jar, history, iteration info, `sendRequest`, `wait`, and
//! `test`/`skip`/`fail` (spec §4.2).
//!
//! Grounded on the teacher's `expose_script_context_static` (one
//! `Object::new` per facade, values copied in eagerly) and
//! `add_global_functions_static` (native `Function::new` bindings per
//! verb). Facades that mutate shared state borrow a `Rc<RefCell<SandboxState>>`
//! captured by every closure, since a QuickJS context is single-threaded
//! and confined to the `spawn_blocking` thread that owns it.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Array, Ctx, Function, Object, Value as JsValue};
use serde_json::Value as JsonValue;

use crate::context::{Environment, TestResult};
use crate::event_bus::ConsoleLevel;
use crate::history::HistoryEntry;
use crate::value::{Resolved, VarMap};
use crate::Result;
use quest_plugin_core::{HeaderBag, RequestData, RequestOptions, ResponseData};

use super::{ScriptInput, ScriptType, SandboxSink};

pub(super) enum ControlSignal {
    Skip(String),
    Fail(String),
}

/// Everything native closures need, owned on the blocking thread for the
/// lifetime of one script execution.
pub(super) struct SandboxState {
    pub script: String,
    input: ScriptInput,
    sink: Option<std::sync::Arc<dyn SandboxSink>>,
    handle: tokio::runtime::Handle,
    tests: Vec<TestResult>,
    console_output: Vec<(ConsoleLevel, String)>,
    inside_test: bool,
    pending_control: Option<ControlSignal>,
    pub top_level_error: Option<String>,
}

pub(super) struct SandboxStateParts {
    pub input: ScriptInput,
    pub tests: Vec<TestResult>,
    pub console_output: Vec<(ConsoleLevel, String)>,
    pub top_level_error: Option<String>,
}

impl SandboxState {
    pub fn new(input: ScriptInput, sink: Option<std::sync::Arc<dyn SandboxSink>>, handle: tokio::runtime::Handle) -> Self {
        let script = input.script.clone();
        Self {
            script,
            input,
            sink,
            handle,
            tests: Vec::new(),
            console_output: Vec::new(),
            inside_test: false,
            pending_control: None,
            top_level_error: None,
        }
    }

    pub fn into_parts(self) -> SandboxStateParts {
        SandboxStateParts {
            input: self.input,
            tests: self.tests,
            console_output: self.console_output,
            top_level_error: self.top_level_error,
        }
    }

    pub(super) fn record_console(&mut self, level: ConsoleLevel, line: String) {
        if let Some(sink) = &self.sink {
            sink.on_console(level, &line);
        }
        self.console_output.push((level, line));
    }

    fn record_test(&mut self, test: TestResult) {
        if let Some(sink) = &self.sink {
            sink.on_test(&test);
        }
        self.tests.push(test);
    }

    /// Resolve `key` through the full precedence chain (spec §4.1):
    /// iteration row → scope chain → collection variables → environment
    /// → global variables.
    fn resolve(&self, key: &str) -> Resolved {
        if let Some(row) = &self.input.iteration_data {
            if let Some(v) = row.get(key) {
                return Resolved::Found(v.clone());
            }
        }
        let scoped = self.input.scope.get(key);
        if !scoped.is_null() {
            return scoped;
        }
        if let Some(v) = self.input.collection_variables.get(key) {
            return Resolved::Found(v.clone());
        }
        if let Some(env) = &self.input.environment {
            if let Some(v) = env.vars.get(key) {
                return Resolved::Found(v.clone());
            }
        }
        if let Some(v) = self.input.global_variables.get(key) {
            return Resolved::Found(v.clone());
        }
        Resolved::Null
    }
}

/// JSON round-trips through the context's own `JSON.parse`/`JSON.stringify`
/// since no `serde` bridge is linked for this `rquickjs` build.
pub(super) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &JsonValue) -> Result<JsValue<'js>> {
    let text = serde_json::to_string(value)?;
    let json_obj: Object = ctx.globals().get("JSON")?;
    let parse: Function = json_obj.get("parse")?;
    Ok(parse.call((text,))?)
}

pub(super) fn js_to_json<'js>(ctx: &Ctx<'js>, value: &JsValue<'js>) -> JsonValue {
    if value.is_undefined() || value.is_null() {
        return JsonValue::Null;
    }
    if let Some(b) = value.as_bool() {
        return JsonValue::Bool(b);
    }
    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n).map(JsonValue::Number).unwrap_or(JsonValue::Null);
    }
    if let Some(s) = value.as_string() {
        return JsonValue::String(s.to_string().unwrap_or_default());
    }
    if let Ok(json_obj) = ctx.globals().get::<_, Object>("JSON") {
        if let Ok(stringify) = json_obj.get::<_, Function>("stringify") {
            if let Ok(s) = stringify.call::<_, rquickjs::String>((value.clone(),)) {
                if let Ok(text) = s.to_string() {
                    return serde_json::from_str(&text).unwrap_or(JsonValue::Null);
                }
            }
        }
    }
    JsonValue::Null
}

/// Convert a Rust-side [`crate::Error`] into a thrown JS exception, for
/// native closures whose return type rquickjs requires to be
/// `rquickjs::Result<T>` rather than our own `crate::Result<T>`.
fn js_err(ctx: &Ctx<'_>, err: crate::Error) -> rquickjs::Error {
    rquickjs::Exception::throw_message(ctx, &err.to_string())
}

/// Retrieve the pending JS exception as a display string (spec §4.2
/// "thrown strings/objects are coerced to a message").
pub(super) fn js_exception_message(ctx: &Ctx<'_>) -> String {
    let value = ctx.catch();
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_else(|_| "unknown error".to_string());
    }
    if let Some(obj) = value.as_object() {
        if let Ok(message) = obj.get::<_, rquickjs::String>("message") {
            if let Ok(s) = message.to_string() {
                return s;
            }
        }
    }
    js_to_json(ctx, &value).to_string()
}

fn headers_to_js<'js>(ctx: &Ctx<'js>, headers: &HeaderBag) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    for (key, values) in headers.to_map() {
        if values.len() == 1 {
            obj.set(key.as_str(), values[0].as_str())?;
        } else {
            let arr = Array::new(ctx.clone())?;
            for (i, v) in values.iter().enumerate() {
                arr.set(i, v.as_str())?;
            }
            obj.set(key.as_str(), arr)?;
        }
    }
    let headers = headers.clone();
    let get_fn = Function::new(ctx.clone(), move |name: String| -> Option<String> {
        headers.get(&name).map(|s| s.to_string())
    })?;
    obj.set("get", get_fn)?;
    Ok(obj)
}

fn js_to_header_bag<'js>(obj: &Object<'js>) -> Result<HeaderBag> {
    let mut bag = HeaderBag::new();
    for key in obj.keys::<String>() {
        let key = key?;
        let value: JsValue = obj.get(&key)?;
        if let Some(arr) = value.as_array() {
            for item in arr.iter::<String>() {
                bag.append(key.clone(), item?);
            }
        } else if let Some(s) = value.as_string() {
            bag.append(key.clone(), s.to_string()?);
        }
    }
    Ok(bag)
}

fn request_to_js<'js>(
    ctx: &Ctx<'js>,
    request: &RequestData,
    options: Option<&RequestOptions>,
    editable: Option<&Rc<RefCell<SandboxState>>>,
) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("method", request.method.as_str())?;
    obj.set("url", request.url.as_str())?;
    obj.set("headers", headers_to_js(ctx, &request.headers)?)?;
    if let Some(body) = &request.body {
        obj.set("body", json_to_js(ctx, body)?)?;
    }
    let timeout_obj = Object::new(ctx.clone())?;
    timeout_obj.set("request", options.and_then(|o| o.timeout_ms))?;
    if let Some(state) = editable {
        // `quest.request.timeout.set(ms)` is valid only in request-pre
        // (spec §4.2); the mutation round-trips via `ScriptOutput.request_options`.
        let s = state.clone();
        let set_fn = Function::new(ctx.clone(), move |ms: u64| {
            let mut state = s.borrow_mut();
            let opts = state.input.request_options.get_or_insert_with(RequestOptions::default);
            opts.timeout_ms = Some(ms);
        })?;
        timeout_obj.set("set", set_fn)?;
    }
    obj.set("timeout", timeout_obj)?;
    Ok(obj)
}

fn response_to_js<'js>(ctx: &Ctx<'js>, response: &ResponseData) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("status", response.status)?;
    obj.set("statusText", response.status_text.as_str())?;
    obj.set("headers", headers_to_js(ctx, &response.headers)?)?;
    obj.set("time", response.time_ms)?;
    let body = response.body.clone();
    let body_for_json = body.clone();
    let json_fn = Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<JsValue<'js>> {
        match &body_for_json {
            Some(v) => json_to_js(&ctx, v).map_err(|e| js_err(&ctx, e)),
            None => Ok(JsValue::new_null(ctx)),
        }
    })?;
    obj.set("json", json_fn)?;
    let raw = response.raw_body.clone();
    let text_fn = Function::new(ctx.clone(), move || -> String { raw.clone() })?;
    obj.set("text", text_fn)?;
    if let Some(body) = body {
        obj.set("body", json_to_js(ctx, &body)?)?;
    }
    Ok(obj)
}

/// Build a facade object exposing `get`/`set`/`has`/`remove`/`clear`/
/// `toObject` over a plain key/value map (`quest.collection`,
/// `quest.global`, `quest.environment`).
macro_rules! varmap_facade {
    ($ctx:expr, $state:expr, $getter:expr, $getter_mut:expr, $mutator:expr) => {{
        let ctx = $ctx.clone();
        let obj = Object::new(ctx.clone())?;

        let state = $state.clone();
        let ctx_get = ctx.clone();
        let get_fn = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<JsValue> {
            let s = state.borrow();
            let map = $getter(&s);
            match map.get(&key) {
                Some(v) => json_to_js(&ctx_get, v).map_err(|e| js_err(&ctx_get, e)),
                None => Ok(JsValue::new_null(ctx_get.clone())),
            }
        })?;
        obj.set("get", get_fn)?;

        let state = $state.clone();
        let ctx_set = ctx.clone();
        let set_fn = Function::new(ctx.clone(), move |key: String, value: JsValue| {
            let json = js_to_json(&ctx_set, &value);
            let mut s = state.borrow_mut();
            $mutator(&mut s, key, json);
        })?;
        obj.set("set", set_fn)?;

        let state = $state.clone();
        let has_fn = Function::new(ctx.clone(), move |key: String| -> bool {
            $getter(&state.borrow()).contains_key(&key)
        })?;
        obj.set("has", has_fn)?;

        let state = $state.clone();
        let remove_fn = Function::new(ctx.clone(), move |key: String| {
            if let Some(map) = $getter_mut(&mut state.borrow_mut()) {
                map.shift_remove(&key);
            }
        })?;
        obj.set("remove", remove_fn)?;

        let state = $state.clone();
        let clear_fn = Function::new(ctx.clone(), move || {
            if let Some(map) = $getter_mut(&mut state.borrow_mut()) {
                map.clear();
            }
        })?;
        obj.set("clear", clear_fn)?;

        let state = $state.clone();
        let ctx_to_object = ctx.clone();
        let to_object_fn = Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue> {
            let s = state.borrow();
            let map = $getter(&s);
            let obj = Object::new(ctx_to_object.clone())?;
            for (k, v) in map.iter() {
                let js_v = json_to_js(&ctx_to_object, v).map_err(|e| js_err(&ctx_to_object, e))?;
                obj.set(k.as_str(), js_v)?;
            }
            Ok(obj.into_value())
        })?;
        obj.set("toObject", to_object_fn)?;

        Ok::<_, crate::Error>(obj)
    }};
}

fn collection_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    varmap_facade!(
        ctx,
        state,
        |s: &SandboxState| -> &VarMap { &s.input.collection_variables },
        |s: &mut SandboxState| -> Option<&mut VarMap> { Some(&mut s.input.collection_variables) },
        |s: &mut SandboxState, key: String, value: JsonValue| {
            s.input.collection_variables.insert(key, value);
        }
    )
}

fn global_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    varmap_facade!(
        ctx,
        state,
        |s: &SandboxState| -> &VarMap { &s.input.global_variables },
        |s: &mut SandboxState| -> Option<&mut VarMap> { Some(&mut s.input.global_variables) },
        |s: &mut SandboxState, key: String, value: JsonValue| {
            s.input.global_variables.insert(key, value);
        }
    )
}

fn environment_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    varmap_facade!(
        ctx,
        state,
        |s: &SandboxState| -> &VarMap {
            static EMPTY: once_cell::sync::Lazy<VarMap> = once_cell::sync::Lazy::new(VarMap::new);
            s.input.environment.as_ref().map(|e| &e.vars).unwrap_or(&EMPTY)
        },
        |s: &mut SandboxState| -> Option<&mut VarMap> { s.input.environment.as_mut().map(|e| &mut e.vars) },
        |s: &mut SandboxState, key: String, value: JsonValue| {
            let env = s.input.environment.get_or_insert_with(Environment::default_lazy);
            env.vars.insert(key, value);
        }
    )
}

fn scope_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let s = state.clone();
    let ctx_get = ctx.clone();
    let get_fn = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<JsValue> {
        match s.borrow().input.scope.get(&key) {
            Resolved::Found(v) => json_to_js(&ctx_get, &v).map_err(|e| js_err(&ctx_get, e)),
            Resolved::Null => Ok(JsValue::new_null(ctx_get.clone())),
        }
    })?;
    obj.set("get", get_fn)?;

    let s = state.clone();
    let ctx_set = ctx.clone();
    let set_fn = Function::new(ctx.clone(), move |key: String, value: JsValue| {
        let json = js_to_json(&ctx_set, &value);
        s.borrow_mut().input.scope.set(key, json);
    })?;
    obj.set("set", set_fn)?;

    let s = state.clone();
    let clear_fn = Function::new(ctx.clone(), move || {
        s.borrow_mut().input.scope.clear_top();
    })?;
    obj.set("clear", clear_fn)?;

    let s = state.clone();
    let remove_fn = Function::new(ctx.clone(), move |key: String| {
        s.borrow_mut().input.scope.remove(&key);
    })?;
    obj.set("remove", remove_fn)?;

    let s = state.clone();
    let ctx_to_object = ctx.clone();
    let to_object_fn = Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue> {
        let merged = s.borrow().input.scope.to_object();
        let obj = Object::new(ctx_to_object.clone())?;
        for (k, v) in &merged {
            let js_v = json_to_js(&ctx_to_object, v).map_err(|e| js_err(&ctx_to_object, e))?;
            obj.set(k.as_str(), js_v)?;
        }
        Ok(obj.into_value())
    })?;
    obj.set("toObject", to_object_fn)?;

    Ok(obj)
}

/// `quest.variables`: reads resolve through the full precedence chain
/// (spec §4.1); writes route to `scope.set` (identical rules).
fn variables_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let s = state.clone();
    let ctx_get = ctx.clone();
    let get_fn = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<JsValue> {
        match s.borrow().resolve(&key) {
            Resolved::Found(v) => json_to_js(&ctx_get, &v).map_err(|e| js_err(&ctx_get, e)),
            Resolved::Null => Ok(JsValue::new_null(ctx_get.clone())),
        }
    })?;
    obj.set("get", get_fn)?;

    let s = state.clone();
    let ctx_set = ctx.clone();
    let set_fn = Function::new(ctx.clone(), move |key: String, value: JsValue| {
        let json = js_to_json(&ctx_set, &value);
        s.borrow_mut().input.scope.set(key, json);
    })?;
    obj.set("set", set_fn)?;

    let s = state.clone();
    let ctx_to_object = ctx.clone();
    let to_object_fn = Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue> {
        let merged = s.borrow().input.scope.to_object();
        let obj = Object::new(ctx_to_object.clone())?;
        for (k, v) in &merged {
            let js_v = json_to_js(&ctx_to_object, v).map_err(|e| js_err(&ctx_to_object, e))?;
            obj.set(k.as_str(), js_v)?;
        }
        Ok(obj.into_value())
    })?;
    obj.set("toObject", to_object_fn)?;

    Ok(obj)
}

fn cookies_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let s = state.clone();
    let get_fn = Function::new(ctx.clone(), move |name: String| -> Option<String> {
        s.borrow_mut().input.cookie_jar.get(&name)
    })?;
    obj.set("get", get_fn)?;

    let s = state.clone();
    let has_fn = Function::new(ctx.clone(), move |name: String| -> bool { s.borrow_mut().input.cookie_jar.has(&name) })?;
    obj.set("has", has_fn)?;

    let s = state.clone();
    let set_fn = Function::new(ctx.clone(), move |name: String, value: String| {
        s.borrow_mut().input.cookie_jar.set(name, value, crate::cookie_jar::CookieSetOptions::default());
    })?;
    obj.set("set", set_fn)?;

    let s = state.clone();
    let remove_fn = Function::new(ctx.clone(), move |name: String| {
        s.borrow_mut().input.cookie_jar.remove(&name);
    })?;
    obj.set("remove", remove_fn)?;

    let s = state.clone();
    let clear_fn = Function::new(ctx.clone(), move || {
        s.borrow_mut().input.cookie_jar.clear();
    })?;
    obj.set("clear", clear_fn)?;

    let s = state.clone();
    let ctx_to_object = ctx.clone();
    let to_object_fn = Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue> {
        let map = s.borrow_mut().input.cookie_jar.to_object();
        let obj = Object::new(ctx_to_object.clone())?;
        for (k, v) in &map {
            obj.set(k.as_str(), v.as_str())?;
        }
        Ok(obj.into_value())
    })?;
    obj.set("toObject", to_object_fn)?;

    Ok(obj)
}

fn history_to_js<'js>(ctx: &Ctx<'js>, history: &[HistoryEntry]) -> Result<Array<'js>> {
    let arr = Array::new(ctx.clone())?;
    for (i, entry) in history.iter().enumerate() {
        let obj = Object::new(ctx.clone())?;
        obj.set("id", entry.id.as_str())?;
        obj.set("name", entry.name.as_str())?;
        obj.set("path", entry.path.as_str())?;
        obj.set("iteration", entry.iteration)?;
        if let Some(response) = &entry.response {
            obj.set("response", response_to_js(ctx, response)?)?;
        }
        arr.set(i, obj)?;
    }
    Ok(arr)
}

fn history_facade<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("all", history_to_js(ctx, &state.borrow().input.history)?)?;

    let s = state.clone();
    let ctx_latest = ctx.clone();
    let latest_fn = Function::new(ctx.clone(), move |id: String| -> rquickjs::Result<JsValue> {
        let state = s.borrow();
        match state.input.history.iter().rev().find(|e| e.id == id) {
            Some(entry) => {
                let obj = Object::new(ctx_latest.clone())?;
                obj.set("id", entry.id.as_str())?;
                obj.set("path", entry.path.as_str())?;
                if let Some(response) = &entry.response {
                    let response_obj = response_to_js(&ctx_latest, response).map_err(|e| js_err(&ctx_latest, e))?;
                    obj.set("response", response_obj)?;
                }
                Ok(obj.into_value())
            }
            None => Ok(JsValue::new_null(ctx_latest.clone())),
        }
    })?;
    obj.set("latest", latest_fn)?;

    let s = state.clone();
    let ctx_filter = ctx.clone();
    let filter_fn = Function::new(ctx.clone(), move |glob: String| -> rquickjs::Result<JsValue> {
        let state = s.borrow();
        let mut history = crate::history::ExecutionHistory::new();
        for entry in &state.input.history {
            history.push(entry.clone());
        }
        let matched = history.filter(&glob);
        let arr = Array::new(ctx_filter.clone())?;
        for (i, entry) in matched.iter().enumerate() {
            let obj = Object::new(ctx_filter.clone())?;
            obj.set("id", entry.id.as_str())?;
            obj.set("path", entry.path.as_str())?;
            arr.set(i, obj)?;
        }
        Ok(arr.into_value())
    })?;
    obj.set("filter", filter_fn)?;

    Ok(obj)
}

fn iteration_to_js<'js>(ctx: &Ctx<'js>, state: &Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let s = state.borrow();
    let obj = Object::new(ctx.clone())?;
    obj.set("current", s.input.iteration_current)?;
    obj.set("count", s.input.iteration_count)?;
    match &s.input.iteration_data {
        Some(row) => {
            let data_obj = Object::new(ctx.clone())?;
            for (k, v) in row {
                data_obj.set(k.as_str(), json_to_js(ctx, v)?)?;
            }
            obj.set("data", data_obj)?;
        }
        None => obj.set("data", JsValue::new_null(ctx.clone()))?,
    }
    Ok(obj)
}

fn install_test_api<'js>(ctx: &Ctx<'js>, quest_obj: &Object<'js>, state: Rc<RefCell<SandboxState>>) -> Result<()> {
    let s = state.clone();
    let is_inside_test_fn = Function::new(ctx.clone(), move || -> bool { s.borrow().inside_test })?;
    quest_obj.set("__isInsideTest", is_inside_test_fn)?;

    let s = state.clone();
    let record_control_fn = Function::new(ctx.clone(), move |kind: String, message: String| {
        let mut s = s.borrow_mut();
        s.pending_control = Some(if kind == "skip" { ControlSignal::Skip(message) } else { ControlSignal::Fail(message) });
    })?;
    quest_obj.set("__recordControl", record_control_fn)?;

    let s = state.clone();
    let test_fn = Function::new(ctx.clone(), move |ctx: Ctx<'js>, name: String, func: Function<'js>| {
        let aborted = s.borrow().input.abort.is_aborted();
        if aborted {
            s.borrow_mut().record_test(TestResult::skipped(name, "Test skipped - execution aborted"));
            return;
        }

        {
            let mut state = s.borrow_mut();
            state.inside_test = true;
            state.pending_control = None;
        }

        let call_result: std::result::Result<JsValue, rquickjs::Error> = func.call(());
        let outcome = settle_test_result(&ctx, &s, call_result);

        {
            let mut state = s.borrow_mut();
            state.inside_test = false;
            state.pending_control = None;
        }

        s.borrow_mut().record_test(match outcome {
            Ok(()) => TestResult::passed(name),
            Err(TestFailure::Failed(msg)) => TestResult::failed(name, msg),
            Err(TestFailure::Skipped(msg)) => TestResult::skipped(name, msg),
        });
    })?;
    quest_obj.set("test", test_fn)?;
    Ok(())
}

enum TestFailure {
    Failed(String),
    Skipped(String),
}

/// Inspect the result of calling a test body: a thenable is resolved
/// synchronously by draining the job queue while watching its settlement
/// (spec §4.2 "if `fn` returns a thenable, awaits it").
fn settle_test_result<'js>(
    ctx: &Ctx<'js>,
    state: &Rc<RefCell<SandboxState>>,
    call_result: std::result::Result<JsValue<'js>, rquickjs::Error>,
) -> std::result::Result<(), TestFailure> {
    let value = match call_result {
        Ok(v) => v,
        Err(rquickjs::Error::Exception) => return Err(classify_exception(ctx, state)),
        Err(other) => return Err(TestFailure::Failed(other.to_string())),
    };

    let is_thenable = value
        .as_object()
        .map(|obj| obj.get::<_, Function>("then").is_ok())
        .unwrap_or(false);
    if !is_thenable {
        return Ok(());
    }

    let settled = Rc::new(RefCell::new(None::<std::result::Result<(), String>>));
    let on_ok = settled.clone();
    let resolve_fn = match Function::new(ctx.clone(), move |_: JsValue| {
        *on_ok.borrow_mut() = Some(Ok(()));
    }) {
        Ok(f) => f,
        Err(e) => return Err(TestFailure::Failed(e.to_string())),
    };
    let on_err = settled.clone();
    let ctx_reject = ctx.clone();
    let reject_fn = match Function::new(ctx.clone(), move |value: JsValue| {
        *on_err.borrow_mut() = Some(Err(describe_value(&ctx_reject, &value)));
    }) {
        Ok(f) => f,
        Err(e) => return Err(TestFailure::Failed(e.to_string())),
    };

    let then_obj = match value.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };
    let then: Function = match then_obj.get("then") {
        Ok(f) => f,
        Err(e) => return Err(TestFailure::Failed(e.to_string())),
    };
    if let Err(e) = then.call::<_, JsValue>((resolve_fn, reject_fn)) {
        return Err(TestFailure::Failed(e.to_string()));
    }

    let runtime = ctx.runtime();
    let mut guard = 0u32;
    while settled.borrow().is_none() && guard < 1_000_000 {
        runtime.execute_pending_job();
        guard += 1;
    }

    match settled.borrow_mut().take() {
        Some(Ok(())) => {
            let has_control = state.borrow().pending_control.is_some();
            if has_control {
                classify_control(state)
            } else {
                Ok(())
            }
        }
        Some(Err(message)) => {
            let has_control = state.borrow().pending_control.is_some();
            if has_control {
                classify_control(state)
            } else {
                Err(TestFailure::Failed(message))
            }
        }
        None => Err(TestFailure::Failed("test timed out waiting on a promise".to_string())),
    }
}

fn classify_control(state: &Rc<RefCell<SandboxState>>) -> std::result::Result<(), TestFailure> {
    match state.borrow_mut().pending_control.take() {
        Some(ControlSignal::Skip(reason)) => Err(TestFailure::Skipped(reason)),
        Some(ControlSignal::Fail(message)) => Err(TestFailure::Failed(message)),
        None => Ok(()),
    }
}

fn classify_exception(ctx: &Ctx<'_>, state: &Rc<RefCell<SandboxState>>) -> TestFailure {
    let pending = state.borrow_mut().pending_control.take();
    match pending {
        Some(ControlSignal::Skip(reason)) => {
            let _ = ctx.catch();
            TestFailure::Skipped(reason)
        }
        Some(ControlSignal::Fail(message)) => {
            let _ = ctx.catch();
            TestFailure::Failed(message)
        }
        None => TestFailure::Failed(js_exception_message(ctx)),
    }
}

fn describe_value(ctx: &Ctx<'_>, value: &JsValue) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if let Some(obj) = value.as_object() {
        if let Ok(message) = obj.get::<_, rquickjs::String>("message") {
            if let Ok(s) = message.to_string() {
                return s;
            }
        }
    }
    js_to_json(ctx, value).to_string()
}

fn install_send_request<'js>(ctx: &Ctx<'js>, quest_obj: &Object<'js>, state: Rc<RefCell<SandboxState>>) -> Result<()> {
    let send_fn = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              config: Object<'js>,
              callback: rquickjs::function::Opt<Function<'js>>|
              -> rquickjs::Result<JsValue<'js>> {
            let method: String = config.get("method").unwrap_or_else(|_| "GET".to_string());
            let url: String = config.get("url")?;
            let mut headers = match config.get::<_, Object>("headers").or_else(|_| config.get::<_, Object>("header")) {
                Ok(obj) => js_to_header_bag(&obj).map_err(|e| js_err(&ctx, e))?,
                Err(_) => HeaderBag::new(),
            };
            let body: Option<JsonValue> = match config.get::<_, JsValue>("body") {
                Ok(v) if !v.is_undefined() => Some(js_to_json(&ctx, &v)),
                _ => None,
            };
            if matches!(body, Some(JsonValue::Object(_))) {
                headers.set_if_absent("Content-Type", "application/json");
            }

            let request = RequestData { method, url, headers, body };

            let (plugins, protocol, abort, handle) = {
                let s = state.borrow();
                (s.input.plugins.clone(), s.input.protocol.clone(), s.input.abort.clone(), s.handle.clone())
            };

            let result: std::result::Result<ResponseData, crate::Error> = if abort.is_aborted() {
                Err(crate::Error::Abort("Request aborted".to_string()))
            } else {
                match plugins.protocol(&protocol) {
                    None => Err(crate::Error::Generic(format!("no protocol plugin registered for '{protocol}'"))),
                    Some(plugin) => handle
                        .block_on(plugin.execute(request, quest_plugin_core::RequestOptions::default(), abort.child()))
                        .map(|outcome| outcome.response)
                        .map_err(|e| crate::Error::Generic(format!("Request failed: {e}"))),
                }
            };

            match callback.0 {
                // spec's sendRequest(config, callback?) form: invoke
                // callback(err, response) and return the null sentinel,
                // never throwing even on a failed request.
                Some(callback) => {
                    match &result {
                        Ok(response) => {
                            let response_js = response_to_js(&ctx, response).map(|o| o.into_value()).map_err(|e| js_err(&ctx, e))?;
                            callback.call::<_, ()>((JsValue::new_null(ctx.clone()), response_js))?;
                        }
                        Err(e) => {
                            callback.call::<_, ()>((e.to_string(), JsValue::new_null(ctx.clone())))?;
                        }
                    }
                    Ok(JsValue::new_null(ctx.clone()))
                }
                None => match result {
                    Ok(response) => response_to_js(&ctx, &response).map(|o| o.into_value()).map_err(|e| js_err(&ctx, e)),
                    Err(e) => Err(js_err(&ctx, e)),
                },
            }
        },
    )?;
    quest_obj.set("sendRequest", send_fn)?;
    Ok(())
}

fn install_wait<'js>(ctx: &Ctx<'js>, quest_obj: &Object<'js>, state: Rc<RefCell<SandboxState>>) -> Result<()> {
    let wait_fn = Function::new(ctx.clone(), move |ctx: Ctx<'js>, ms: f64| -> rquickjs::Result<()> {
        if !ms.is_finite() || ms < 0.0 {
            return Err(js_err(&ctx, crate::Error::script("quest.wait(ms) requires a finite, non-negative number")));
        }
        let abort = state.borrow().input.abort.clone();
        if abort.is_aborted() {
            return Err(js_err(&ctx, crate::Error::Abort("wait aborted".to_string())));
        }
        let handle = state.borrow().handle.clone();
        handle
            .block_on(async {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(ms as u64)) => Ok(()),
                    _ = abort.aborted() => Err(crate::Error::Abort("wait aborted".to_string())),
                }
            })
            .map_err(|e| js_err(&ctx, e))
    })?;
    quest_obj.set("wait", wait_fn)?;
    Ok(())
}

/// Assemble the full `quest` global object (spec §4.2).
pub(super) fn build_quest_object<'js>(ctx: Ctx<'js>, state: Rc<RefCell<SandboxState>>) -> Result<Object<'js>> {
    let quest_obj = Object::new(ctx.clone())?;

    {
        let s = state.borrow();
        if let Some(request) = &s.input.request {
            let editable = if s.input.script_type == ScriptType::RequestPre { Some(&state) } else { None };
            quest_obj.set("request", request_to_js(&ctx, request, s.input.request_options.as_ref(), editable)?)?;
        }
        if s.input.script_type.has_response() {
            if let Some(response) = &s.input.response {
                quest_obj.set("response", response_to_js(&ctx, response)?)?;
            }
        }
        if let Some(event) = &s.input.current_event {
            quest_obj.set("event", event.as_str())?;
        } else {
            quest_obj.set("event", JsValue::new_null(ctx.clone()))?;
        }
    }

    quest_obj.set("variables", variables_facade(&ctx, &state)?)?;
    quest_obj.set("scope", scope_facade(&ctx, &state)?)?;
    quest_obj.set("collection", collection_facade(&ctx, &state)?)?;
    quest_obj.set("global", global_facade(&ctx, &state)?)?;
    quest_obj.set("environment", environment_facade(&ctx, &state)?)?;
    quest_obj.set("cookies", cookies_facade(&ctx, &state)?)?;
    quest_obj.set("history", history_facade(&ctx, &state)?)?;
    quest_obj.set("iteration", iteration_to_js(&ctx, &state)?)?;

    let allow_expect = state.borrow().input.script_type == ScriptType::RequestPre;
    let s = state.clone();
    let expect_messages_fn = Function::new(ctx.clone(), move |ctx: Ctx<'js>, n: u32| -> rquickjs::Result<()> {
        if !allow_expect {
            return Err(js_err(
                &ctx,
                crate::Error::script("quest.expectMessages is valid only in request-pre scripts"),
            ));
        }
        s.borrow_mut().input.expected_messages = Some(n);
        Ok(())
    })?;
    quest_obj.set("expectMessages", expect_messages_fn)?;

    install_test_api(&ctx, &quest_obj, state.clone())?;
    install_send_request(&ctx, &quest_obj, state.clone())?;
    install_wait(&ctx, &quest_obj, state.clone())?;

    // Protocol-provided extension, merged last so it cannot clobber the
    // reserved keys above except the deliberate `request`/`response`
    // overrides (spec §4.2).
    let reserved = [
        "collection", "environment", "iteration", "global", "scope", "cookies", "test", "expect", "event",
        "sendRequest", "wait", "variables", "history", "expectMessages",
    ];
    let protocol_extension = {
        let s = state.borrow();
        s.input.plugins.protocol(&s.input.protocol).and_then(|p| {
            let resolver = std::sync::Arc::new(NullResolver);
            let pctx = quest_plugin_core::PluginContext::new(s.input.protocol.clone(), resolver);
            p.protocol_api_provider(&pctx)
        })
    };
    if let Some(extension) = protocol_extension {
        if let JsonValue::Object(map) = extension {
            for (key, value) in map {
                if reserved.contains(&key.as_str()) {
                    continue;
                }
                if key == "request" {
                    if let Ok(existing) = quest_obj.get::<_, Object>("request") {
                        if let JsonValue::Object(extra) = &value {
                            for (k, v) in extra {
                                existing.set(k.as_str(), json_to_js(&ctx, v)?)?;
                            }
                        }
                        continue;
                    }
                }
                quest_obj.set(key.as_str(), json_to_js(&ctx, &value)?)?;
            }
        }
    }

    Ok(quest_obj)
}

/// A no-op resolver used only to satisfy `protocolAPIProvider`'s context
/// parameter; protocol extensions that need live variable lookups should
/// read through the already-installed `quest.variables` facade instead.
struct NullResolver;
impl quest_plugin_core::VariableResolver for NullResolver {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}
