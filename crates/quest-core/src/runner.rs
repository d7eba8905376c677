//! Orchestrates a full collection run: validation, pre/post-run hooks,
//! iteration, DAG scheduling, and result aggregation (spec §4.5/§4.7 glue,
//! §2 item 11 "Collection Runner").
//!
//! Grounded on the teacher's `ChainExecutionEngine::execute_chain`: a
//! validate-then-dispatch shape, with `tracing` spans around every phase
//! transition the way `request_chaining.rs` wraps each hop.

use std::sync::Arc;

use indexmap::IndexSet;
use quest_plugin_core::{AuthConfig, AuthValidation, CancellationToken, PluginContext, RequestOptions, ValidationError, VariableResolver};
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;

use crate::collection::{Collection, Folder, Item, Request, TestDataRow};
use crate::context::{Environment, RequestResult, RunOptions, RunResult, SharedRunState, SharedScopeFrames, TestResult};
use crate::dag::{Dag, NodeId};
use crate::event_bus::{ConsoleLevel, Envelope, Event, EventBus, EventSubscriber, PathType, ValidationSummary};
use crate::history::HistoryEntry;
use crate::sandbox::{ScriptInput, ScriptOutcome, ScriptSandbox, ScriptType};
use crate::scheduler::{NodeFuture, Scheduler};
use crate::value::VarMap;
use quest_plugin_core::{PluginRegistry, RequestData, ResponseData};

/// Orchestrates one collection's execution against a registered plugin set.
pub struct CollectionRunner {
    collection: Arc<Collection>,
    plugins: Arc<PluginRegistry>,
    options: RunOptions,
    events: EventBus,
    cancel: CancellationToken,
}

impl CollectionRunner {
    /// Build a runner over an already-validated in-memory collection (spec
    /// §10.3: "does not parse collection files itself").
    pub fn new(collection: Collection, plugins: Arc<PluginRegistry>, options: RunOptions) -> Self {
        Self { collection: Arc::new(collection), plugins, options, events: EventBus::new(), cancel: CancellationToken::new() }
    }

    /// Register an event subscriber before calling [`Self::run`].
    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.events.subscribe(subscriber);
    }

    /// Trip this run's cancellation token from outside (spec §4.7 "external
    /// abort signal"). Idempotent: only the first reason is kept, matching
    /// [`CancellationToken::trip`]. Safe to call before, during, or after
    /// [`Self::run`].
    pub fn abort(&self, reason: impl Into<String>) {
        self.cancel.trip(reason);
    }

    /// The cancellation token backing this run, for wiring up external
    /// cancellation sources (a CLI's Ctrl-C handler, a GUI's stop button).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the collection to completion, returning the aggregated result.
    pub async fn run(&self) -> RunResult {
        let collection_info = self.collection.info.clone();
        let mut run_result = RunResult::new(collection_info.clone());

        let validation = self.validate();
        let options_summary = format!(
            "concurrency={} parallel={} bail={} iterations={}",
            self.options.effective_concurrency(),
            self.options.allow_parallel,
            self.options.bail,
            self.options.iterations
        );
        self.events.emit(Event::BeforeRun {
            collection_info: collection_info.clone(),
            options_summary,
            validation: validation.clone(),
            expected_test_count: 0,
        });

        if !validation.is_valid() {
            run_result.validation_errors = validation.errors;
            tracing::warn!(errors = run_result.validation_errors.len(), "run rejected by validation");
            self.events.emit(Event::AfterRun { collection_info, result: run_result.clone() });
            return run_result;
        }

        let dag = match Dag::build(&self.collection, !self.options.allow_parallel) {
            Ok(dag) => Arc::new(dag),
            Err(e) => {
                run_result.validation_errors.push(ValidationError::new(e.to_string()));
                self.events.emit(Event::AfterRun { collection_info, result: run_result.clone() });
                return run_result;
            }
        };

        let filter_active: Option<Arc<IndexSet<NodeId>>> = self
            .options
            .filter
            .as_deref()
            .and_then(|pattern| Regex::new(pattern).ok())
            .map(|filter| Arc::new(compute_filter_active(&dag, &self.collection, &filter)));

        let mut shared = SharedRunState::new(
            self.plugins.clone(),
            self.options.global_variables.clone(),
            self.options.environment.clone(),
            collection_info.id.clone(),
        );
        shared.abort = self.cancel.clone();
        *shared.collection_variables.lock().await = self.collection.variables.clone();

        let plan = self.resolve_iteration_plan();
        let run_result = Arc::new(AsyncMutex::new(run_result));

        for iteration in 1..=plan.count {
            shared.scope_frames = SharedScopeFrames::new(collection_info.id.clone());
            let data_row = plan.rows.as_ref().and_then(|rows| rows.get((iteration - 1) as usize)).cloned();
            let iter_ctx = IterCtx { current: iteration, count: plan.count, data: data_row };

            tracing::info!(iteration, total = plan.count, "iteration start");
            let envelope = Envelope {
                path: "collection:/".to_string(),
                path_type: PathType::Collection,
                collection_info: collection_info.clone(),
                iteration: Some(iteration),
            };
            self.events.emit(Event::BeforeIteration { envelope: envelope.clone() });
            let iteration_start = std::time::Instant::now();

            if let Some(script) = self.collection.pre_request_script.clone() {
                self.events.emit(Event::BeforeCollectionPreScript { envelope: envelope.clone() });
                let outcome =
                    self.run_unscoped_script(&shared, &script, ScriptType::CollectionPre, &[], None, &iter_ctx, "collection:/").await;
                self.emit_script_side_effects(&envelope, &outcome);
                self.events.emit(Event::AfterCollectionPreScript { envelope: envelope.clone(), result: outcome.clone() });
                {
                    let mut rr = run_result.lock().await;
                    fold_tests(&mut rr, &outcome.tests);
                }
                if should_bail(&self.options, &outcome.tests) {
                    shared.abort.trip("Test failure (--bail)");
                }
            }

            if !shared.abort.is_aborted() {
                let executor = Arc::new(NodeExecutor {
                    collection: self.collection.clone(),
                    plugins: self.plugins.clone(),
                    options: self.options.clone(),
                    events: self.events.clone(),
                    shared: shared.clone(),
                    run_result: run_result.clone(),
                    filter_active: filter_active.clone(),
                });
                let scheduler = Scheduler::new(&dag);
                let dag_for_run = dag.clone();
                scheduler
                    .run(self.options.effective_concurrency(), self.options.delay_ms, shared.abort.clone(), {
                        let executor = executor.clone();
                        let dag_for_run = dag_for_run.clone();
                        let iter_ctx = iter_ctx.clone();
                        move |node: NodeId| -> NodeFuture {
                            let executor = executor.clone();
                            let dag = dag_for_run.clone();
                            let iter_ctx = iter_ctx.clone();
                            Box::pin(async move { executor.dispatch(dag, node, iter_ctx).await })
                        }
                    })
                    .await;
            }

            if let Some(script) = self.collection.post_request_script.clone() {
                self.events.emit(Event::BeforeCollectionPostScript { envelope: envelope.clone() });
                let outcome =
                    self.run_unscoped_script(&shared, &script, ScriptType::CollectionPost, &[], None, &iter_ctx, "collection:/").await;
                self.emit_script_side_effects(&envelope, &outcome);
                self.events.emit(Event::AfterCollectionPostScript { envelope: envelope.clone(), result: outcome.clone() });
                {
                    let mut rr = run_result.lock().await;
                    fold_tests(&mut rr, &outcome.tests);
                }
                if should_bail(&self.options, &outcome.tests) {
                    shared.abort.trip("Test failure (--bail)");
                }
            }

            self.events.emit(Event::AfterIteration { envelope, duration_ms: iteration_start.elapsed().as_millis() as u64 });

            if shared.abort.is_aborted() {
                break;
            }
        }

        let mut run_result = Arc::try_unwrap(run_result).unwrap_or_else(|arc| AsyncMutex::new(arc.try_lock().map(|g| g.clone()).unwrap_or_else(|_| RunResult::new(collection_info.clone())))).into_inner();
        run_result.aborted = shared.abort.is_aborted();
        run_result.abort_reason = shared.abort.reason();

        tracing::info!(
            total = run_result.total_tests,
            passed = run_result.passed_tests,
            failed = run_result.failed_tests,
            aborted = run_result.aborted,
            "run complete"
        );
        self.events.emit(Event::AfterRun { collection_info, result: run_result.clone() });
        run_result
    }

    /// Pre-run validation (spec §4.5/§4.6/§7): unknown protocol, missing
    /// auth plugin / failed auth validation, conflicting parallel+persist
    /// options, and an unbuildable (cyclic or unresolved-`dependsOn`) DAG.
    fn validate(&self) -> ValidationSummary {
        let mut errors = Vec::new();

        if self.options.allow_parallel && self.options.jar_persist {
            errors.push(ValidationError::new("parallel execution is incompatible with cookie-jar persistence"));
        }

        if self.plugins.protocol(&self.collection.protocol).is_none() {
            errors.push(ValidationError::new(format!("no protocol plugin registered for '{}'", self.collection.protocol)));
        }

        let mut auth_targets: Vec<&AuthConfig> = Vec::new();
        if let Some(auth) = &self.collection.auth {
            auth_targets.push(auth);
        }
        for item in self.collection.walk() {
            if let Some(auth) = &item.common().auth {
                auth_targets.push(auth);
            }
        }
        let resolver: Arc<dyn VariableResolver> = Arc::new(EmptyResolver);
        for auth in auth_targets {
            match self.plugins.auth_for(&auth.auth_type, &self.collection.protocol) {
                None => errors.push(ValidationError::new(format!("no auth plugin registered for type '{}'", auth.auth_type))),
                Some(plugin) => {
                    let ctx = PluginContext::new(self.collection.protocol.clone(), resolver.clone())
                        .with_auth_type(auth.auth_type.clone());
                    if let AuthValidation::Invalid(plugin_errors) = plugin.validate(auth, &ctx) {
                        errors.extend(plugin_errors);
                    }
                }
            }
        }

        if let Err(e) = Dag::build(&self.collection, !self.options.allow_parallel) {
            errors.push(ValidationError::new(e.to_string()));
        }

        if let Some(pattern) = &self.options.filter {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::new(format!("invalid filter regex: {e}")));
            }
        }

        ValidationSummary { errors }
    }

    /// Iteration source priority per spec §4.5: CLI-supplied data, then
    /// collection `testData`, then the first folder/request `testData`
    /// found in declaration order, else none (pure repetition).
    fn resolve_iteration_plan(&self) -> IterationPlan {
        let rows = self
            .options
            .iteration_data
            .clone()
            .or_else(|| self.collection.test_data.clone())
            .or_else(|| self.collection.walk().into_iter().find_map(|item| match item {
                Item::Folder(f) => f.test_data.clone(),
                Item::Request(_) => None,
            }))
            .or_else(|| self.collection.walk().into_iter().find_map(|item| match item {
                Item::Request(r) => r.test_data.clone(),
                Item::Folder(_) => None,
            }));

        let count = match &rows {
            Some(rows) if !rows.is_empty() => (rows.len() as u32).min(self.options.iterations.max(1)),
            _ => self.options.iterations.max(1),
        };
        IterationPlan { rows, count }
    }

    /// Run a script with no request frame pushed (collection- or
    /// folder-level scripts).
    async fn run_unscoped_script(
        &self,
        shared: &SharedRunState,
        script: &str,
        script_type: ScriptType,
        full_folder_path: &[String],
        response: Option<ResponseData>,
        iter_ctx: &IterCtx,
        path: &str,
    ) -> ScriptOutcome {
        let _guard = shared.script_mutex.lock().await;
        let scope = shared.scope_frames.snapshot_folder_chain(full_folder_path).await;
        let (outcome, scope, _req, _opts) =
            run_one_script(shared, self.collection.protocol.clone(), script, script_type, scope, None, None, response, iter_ctx, path)
                .await;
        shared.scope_frames.commit_folder_chain(scope).await;
        outcome
    }

    fn emit_script_side_effects(&self, envelope: &Envelope, outcome: &ScriptOutcome) {
        for test in &outcome.tests {
            self.events.emit(Event::Assertion { test: test.clone(), request: None, response: None });
        }
        for (level, line) in &outcome.console_output {
            self.events.emit(Event::Console { envelope: envelope.clone(), line: line.clone(), level: *level });
        }
        if let Some(error) = &outcome.error {
            self.events.emit(Event::Exception { envelope: envelope.clone(), error: error.clone() });
        }
    }
}

#[derive(Clone)]
struct IterCtx {
    current: u32,
    count: u32,
    data: Option<TestDataRow>,
}

struct IterationPlan {
    rows: Option<Vec<TestDataRow>>,
    count: u32,
}

fn fold_tests(run_result: &mut RunResult, tests: &[TestResult]) {
    for test in tests {
        run_result.total_tests += 1;
        if test.skipped {
            run_result.skipped_tests += 1;
        } else if test.passed {
            run_result.passed_tests += 1;
        } else {
            run_result.failed_tests += 1;
        }
    }
}

fn should_bail(options: &RunOptions, tests: &[TestResult]) -> bool {
    options.bail && tests.iter().any(|t| !t.passed && !t.skipped)
}

/// Always resolves to nothing; used only to satisfy auth plugins'
/// `validate` signature during the pre-run validation pass, before any
/// live execution context exists.
struct EmptyResolver;

impl VariableResolver for EmptyResolver {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// A live resolver snapshotting the precedence chain at one request's
/// dispatch time (spec §4.1), used by auth/protocol plugin contexts.
struct SnapshotResolver {
    row: Option<TestDataRow>,
    scope: VarMap,
    collection: VarMap,
    environment: VarMap,
    global: VarMap,
}

impl VariableResolver for SnapshotResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.row
            .as_ref()
            .and_then(|r| r.get(name))
            .or_else(|| self.scope.get(name))
            .or_else(|| self.collection.get(name))
            .or_else(|| self.environment.get(name))
            .or_else(|| self.global.get(name))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

/// Owns everything one node's execution needs, cloned fresh per iteration
/// so it can be moved into a `'static` spawned future (spec §5 "parallelism
/// is bounded by `maxConcurrency`").
struct NodeExecutor {
    collection: Arc<Collection>,
    plugins: Arc<PluginRegistry>,
    options: RunOptions,
    events: EventBus,
    shared: SharedRunState,
    run_result: Arc<AsyncMutex<RunResult>>,
    /// Request/folder node ids that survive `RunOptions.filter` (spec §8
    /// "Filter regex matches full path `kind:/...`; non-matching items are
    /// skipped (and their unique post hooks too)"). `None` means no filter
    /// was configured, so every node runs.
    filter_active: Option<Arc<IndexSet<NodeId>>>,
}

impl NodeExecutor {
    async fn dispatch(self: Arc<Self>, dag: Arc<Dag>, node: NodeId, iter_ctx: IterCtx) -> bool {
        match &node {
            NodeId::FolderPre(id) => self.run_folder_pre(&dag, id, &iter_ctx).await,
            NodeId::FolderPost(id) => self.run_folder_post(&dag, id, &iter_ctx).await,
            NodeId::Request(id) => self.run_request(&dag, id, &iter_ctx).await,
        }
    }

    /// Whether `node` should be skipped entirely because `RunOptions.filter`
    /// is set and `node`'s full path (or, for a folder pseudo-node, every
    /// descendant's path) didn't match.
    fn filtered_out(&self, node: &NodeId) -> bool {
        match &self.filter_active {
            Some(active) => !active.contains(node),
            None => false,
        }
    }

    fn names_for(&self, ids: &[String]) -> Vec<String> {
        names_for(&self.collection, ids)
    }

    fn path_string(&self, kind: PathType, segments: Vec<String>) -> String {
        path_string(kind, segments)
    }

    fn envelope(&self, path: String, path_type: PathType, iteration: u32) -> Envelope {
        Envelope { path, path_type, collection_info: self.collection.info.clone(), iteration: Some(iteration) }
    }

    async fn run_folder_pre(&self, dag: &Dag, folder_id: &str, iter_ctx: &IterCtx) -> bool {
        if self.filtered_out(&NodeId::FolderPre(folder_id.to_string())) {
            tracing::debug!(folder_id, "folder skipped by filter");
            return false;
        }
        let Some(Item::Folder(folder)) = self.collection.find(folder_id) else { return false };
        let info = dag.info(&NodeId::FolderPre(folder_id.to_string()));
        let mut full_path = info.folder_path.clone();
        full_path.push(folder_id.to_string());
        let path = self.path_string(PathType::Folder, self.names_for(&full_path));
        let envelope = self.envelope(path.clone(), PathType::Folder, iter_ctx.current);

        self.events.emit(Event::BeforeFolder { envelope: envelope.clone() });

        let Some(script) = &folder.folder_pre_script else { return false };
        self.events.emit(Event::BeforeFolderPreScript { envelope: envelope.clone() });

        let _guard = self.shared.script_mutex.lock().await;
        let scope = self.shared.scope_frames.snapshot_folder_chain(&full_path).await;
        let (outcome, scope, _req, _opts) = run_one_script(
            &self.shared,
            self.collection.protocol.clone(),
            script,
            ScriptType::FolderPre,
            scope,
            None,
            None,
            None,
            iter_ctx,
            &path,
        )
        .await;
        self.shared.scope_frames.commit_folder_chain(scope).await;
        drop(_guard);

        self.emit_script_side_effects(&envelope, &outcome);
        self.events.emit(Event::AfterFolderPreScript { envelope, result: outcome.clone() });
        {
            let mut rr = self.run_result.lock().await;
            fold_tests(&mut rr, &outcome.tests);
        }
        should_bail(&self.options, &outcome.tests)
    }

    async fn run_folder_post(&self, dag: &Dag, folder_id: &str, iter_ctx: &IterCtx) -> bool {
        if self.filtered_out(&NodeId::FolderPost(folder_id.to_string())) {
            tracing::debug!(folder_id, "folder post skipped by filter");
            return false;
        }
        let Some(Item::Folder(folder)) = self.collection.find(folder_id) else { return false };
        let info = dag.info(&NodeId::FolderPost(folder_id.to_string()));
        let mut full_path = info.folder_path.clone();
        full_path.push(folder_id.to_string());
        let path = self.path_string(PathType::Folder, self.names_for(&full_path));
        let envelope = self.envelope(path.clone(), PathType::Folder, iter_ctx.current);

        let mut bail = false;
        if let Some(script) = &folder.folder_post_script {
            self.events.emit(Event::BeforeFolderPostScript { envelope: envelope.clone() });
            let _guard = self.shared.script_mutex.lock().await;
            let scope = self.shared.scope_frames.snapshot_folder_chain(&full_path).await;
            let (outcome, scope, _req, _opts) = run_one_script(
                &self.shared,
                self.collection.protocol.clone(),
                script,
                ScriptType::FolderPost,
                scope,
                None,
                None,
                None,
                iter_ctx,
                &path,
            )
            .await;
            self.shared.scope_frames.commit_folder_chain(scope).await;
            drop(_guard);

            self.emit_script_side_effects(&envelope, &outcome);
            self.events.emit(Event::AfterFolderPostScript { envelope: envelope.clone(), result: outcome.clone() });
            {
                let mut rr = self.run_result.lock().await;
                fold_tests(&mut rr, &outcome.tests);
            }
            bail = should_bail(&self.options, &outcome.tests);
        }

        self.events.emit(Event::AfterFolder { envelope, duration_ms: 0 });
        bail
    }

    async fn run_request(&self, dag: &Dag, request_id: &str, iter_ctx: &IterCtx) -> bool {
        if self.filtered_out(&NodeId::Request(request_id.to_string())) {
            tracing::debug!(request_id, "request skipped by filter");
            return false;
        }
        let Some(Item::Request(request)) = self.collection.find(request_id) else { return false };
        let info = dag.info(&NodeId::Request(request_id.to_string()));
        let folder_path = info.folder_path.clone();

        let ancestor_folders: Vec<&Folder> = folder_path
            .iter()
            .filter_map(|id| match self.collection.find(id) {
                Some(Item::Folder(f)) => Some(f),
                _ => None,
            })
            .collect();

        if let Some(condition) = &request.common.condition {
            let snapshot = {
                let mut merged = self.shared.global_variables.lock().await.clone();
                for (k, v) in self.shared.collection_variables.lock().await.iter() {
                    merged.insert(k.clone(), v.clone());
                }
                merged
            };
            if !evaluate_condition(condition.clone(), snapshot).await {
                tracing::debug!(request_id, "item skipped by condition");
                return false;
            }
        }

        let path = self.path_string(PathType::Request, {
            let mut segs = self.names_for(&folder_path);
            segs.push(request.common.name.clone());
            segs
        });
        let envelope = self.envelope(path.clone(), PathType::Request, iter_ctx.current);
        let start = std::time::Instant::now();

        self.events.emit(Event::BeforeItem { envelope: envelope.clone(), request: request.data.clone() });

        let mut tests: Vec<TestResult> = Vec::new();
        let mut console_output: Vec<String> = Vec::new();
        let mut req_data = request.data.clone();
        let mut req_options = RequestOptions { timeout_ms: request.options.timeout_ms };
        let mut bail = false;
        let mut error: Option<String> = None;
        let mut response: Option<ResponseData> = None;

        // Phase 1: inherited pre-scripts (root -> parent), then the
        // request's own pre-script (spec §4.3 steps 1-2).
        let request_frame_snapshot = {
            let _guard = self.shared.script_mutex.lock().await;
            let mut chain = self.shared.scope_frames.snapshot_chain(&folder_path, &request.common.id).await;

            for ancestor in &ancestor_folders {
                if let Some(script) = &ancestor.common.pre_request_script {
                    self.events.emit(Event::BeforePreScript { envelope: envelope.clone(), request: req_data.clone() });
                    let (outcome, new_chain, new_req, new_opts) = run_one_script(
                        &self.shared,
                        self.collection.protocol.clone(),
                        script,
                        ScriptType::RequestPre,
                        chain,
                        Some(req_data.clone()),
                        Some(req_options.clone()),
                        None,
                        iter_ctx,
                        &path,
                    )
                    .await;
                    chain = new_chain;
                    if let Some(r) = new_req {
                        req_data = r;
                    }
                    if let Some(o) = new_opts {
                        req_options = o;
                    }
                    self.emit_script_side_effects(&envelope, &outcome);
                    self.events.emit(Event::AfterPreScript { envelope: envelope.clone(), request: req_data.clone(), result: outcome.clone() });
                    bail |= should_bail(&self.options, &outcome.tests);
                    tests.extend(outcome.tests);
                    console_output.extend(outcome.console_output.into_iter().map(|(_, line)| line));
                    if let Some(e) = outcome.error {
                        error.get_or_insert(e);
                    }
                }
            }

            if let Some(script) = &request.common.pre_request_script {
                self.events.emit(Event::BeforePreScript { envelope: envelope.clone(), request: req_data.clone() });
                let (outcome, new_chain, new_req, new_opts) = run_one_script(
                    &self.shared,
                    self.collection.protocol.clone(),
                    script,
                    ScriptType::RequestPre,
                    chain,
                    Some(req_data.clone()),
                    Some(req_options.clone()),
                    None,
                    iter_ctx,
                    &path,
                )
                .await;
                chain = new_chain;
                if let Some(r) = new_req {
                    req_data = r;
                }
                if let Some(o) = new_opts {
                    req_options = o;
                }
                self.emit_script_side_effects(&envelope, &outcome);
                self.events.emit(Event::AfterPreScript { envelope: envelope.clone(), request: req_data.clone(), result: outcome.clone() });
                bail |= should_bail(&self.options, &outcome.tests);
                tests.extend(outcome.tests);
                console_output.extend(outcome.console_output.into_iter().map(|(_, line)| line));
                if let Some(e) = outcome.error {
                    error.get_or_insert(e);
                }
            }

            let request_frame = chain.top().clone();
            self.shared.scope_frames.commit_chain(chain).await;
            request_frame
        };

        if !bail && !self.shared.abort.is_aborted() {
            let effective_auth = request
                .common
                .auth
                .as_ref()
                .or_else(|| ancestor_folders.iter().rev().find_map(|f| f.common.auth.as_ref()))
                .or(self.collection.auth.as_ref());

            let resolver: Arc<dyn VariableResolver> = Arc::new(SnapshotResolver {
                row: iter_ctx.data.clone(),
                scope: request_frame_snapshot.vars.clone(),
                collection: self.shared.collection_variables.lock().await.clone(),
                environment: self.shared.environment.lock().await.clone().map(|e| e.vars).unwrap_or_default(),
                global: self.shared.global_variables.lock().await.clone(),
            });

            if let Some(auth) = effective_auth {
                if let Some(plugin) = self.plugins.auth_for(&auth.auth_type, &self.collection.protocol) {
                    let ctx = PluginContext::new(self.collection.protocol.clone(), resolver.clone())
                        .with_auth_type(auth.auth_type.clone());
                    match plugin.apply(req_data.clone(), auth, &ctx).await {
                        Ok(updated) => req_data = updated,
                        Err(e) => {
                            error.get_or_insert(format!("Plugin error: {e}"));
                        }
                    };
                }
            }

            if error.is_none() {
                let (host, url_path) = url_host_path(&req_data.url);
                let secure = req_data.url.starts_with("https");
                if let Some(cookie_header) = self.shared.cookie_jar.lock().await.get_cookie_header(&host, &url_path, secure) {
                    req_data.headers.set_if_absent("Cookie", cookie_header);
                }

                self.events.emit(Event::BeforeRequest { envelope: envelope.clone(), request: req_data.clone() });
                match self.plugins.protocol(&self.collection.protocol) {
                    Some(protocol) => match protocol.execute(req_data.clone(), req_options.clone(), self.shared.abort.child()).await {
                        Ok(outcome) => {
                            let set_cookie: Vec<String> =
                                outcome.response.headers.get_all("set-cookie").into_iter().map(str::to_string).collect();
                            if !set_cookie.is_empty() {
                                self.shared.cookie_jar.lock().await.store_set_cookie_headers(&set_cookie, &host, &url_path);
                            }
                            response = Some(outcome.response.clone());
                            self.events.emit(Event::AfterRequest {
                                envelope: envelope.clone(),
                                request: req_data.clone(),
                                response: Some(outcome.response),
                                duration_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                        Err(e) => {
                            error.get_or_insert(format!("Request failed: {e}"));
                            self.events.emit(Event::AfterRequest {
                                envelope: envelope.clone(),
                                request: req_data.clone(),
                                response: None,
                                duration_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                    },
                    None => {
                        error.get_or_insert(format!("no protocol plugin registered for '{}'", self.collection.protocol));
                    }
                }
            }
        }

        // Phase 2: the request's own post-script, then inherited
        // post-scripts (parent -> root) (spec §4.3 steps 5-6).
        if !self.shared.abort.is_aborted() {
            let _guard = self.shared.script_mutex.lock().await;
            let mut chain = self.shared.scope_frames.snapshot_chain(&folder_path, &request.common.id).await;
            *chain.top_mut() = request_frame_snapshot;

            if let Some(script) = &request.common.post_request_script {
                let (outcome, new_chain, _req, _opts) = run_one_script(
                    &self.shared,
                    self.collection.protocol.clone(),
                    script,
                    ScriptType::RequestPost,
                    chain,
                    Some(req_data.clone()),
                    Some(req_options.clone()),
                    response.clone(),
                    iter_ctx,
                    &path,
                )
                .await;
                chain = new_chain;
                self.events.emit(Event::BeforePostScript { envelope: envelope.clone(), request: req_data.clone() });
                self.emit_script_side_effects(&envelope, &outcome);
                self.events.emit(Event::AfterPostScript {
                    envelope: envelope.clone(),
                    request: req_data.clone(),
                    response: response.clone(),
                    result: outcome.clone(),
                });
                bail |= should_bail(&self.options, &outcome.tests);
                tests.extend(outcome.tests);
                console_output.extend(outcome.console_output.into_iter().map(|(_, line)| line));
                if let Some(e) = outcome.error {
                    error.get_or_insert(e);
                }
            }

            for ancestor in ancestor_folders.iter().rev() {
                if let Some(script) = &ancestor.common.post_request_script {
                    let (outcome, new_chain, _req, _opts) = run_one_script(
                        &self.shared,
                        self.collection.protocol.clone(),
                        script,
                        ScriptType::RequestPost,
                        chain,
                        Some(req_data.clone()),
                        Some(req_options.clone()),
                        response.clone(),
                        iter_ctx,
                        &path,
                    )
                    .await;
                    chain = new_chain;
                    self.events.emit(Event::BeforePostScript { envelope: envelope.clone(), request: req_data.clone() });
                    self.emit_script_side_effects(&envelope, &outcome);
                    self.events.emit(Event::AfterPostScript {
                        envelope: envelope.clone(),
                        request: req_data.clone(),
                        response: response.clone(),
                        result: outcome.clone(),
                    });
                    bail |= should_bail(&self.options, &outcome.tests);
                    tests.extend(outcome.tests);
                    console_output.extend(outcome.console_output.into_iter().map(|(_, line)| line));
                    if let Some(e) = outcome.error {
                        error.get_or_insert(e);
                    }
                }
            }

            self.shared.scope_frames.commit_chain(chain).await;
        }

        if !self.options.jar_persist {
            self.shared.cookie_jar.lock().await.clear();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        self.shared.history.lock().await.push(HistoryEntry {
            id: request.common.id.clone(),
            name: request.common.name.clone(),
            path: path.clone(),
            iteration: iter_ctx.current,
            response: response.clone(),
            tests: tests.clone(),
            timestamp: chrono::Utc::now(),
        });

        let result = RequestResult {
            request_id: request.common.id.clone(),
            path,
            response: response.clone(),
            tests,
            console_output,
            duration_ms,
            error,
        };
        {
            let mut rr = self.run_result.lock().await;
            rr.record(result.clone());
        }
        self.events.emit(Event::AfterItem { envelope, request: req_data, response, result });

        if bail {
            self.shared.abort.trip("Test failure (--bail)");
        }
        bail
    }

    fn emit_script_side_effects(&self, envelope: &Envelope, outcome: &ScriptOutcome) {
        for test in &outcome.tests {
            self.events.emit(Event::Assertion { test: test.clone(), request: None, response: None });
        }
        for (level, line) in &outcome.console_output {
            self.events.emit(Event::Console { envelope: envelope.clone(), line: line.clone(), level: *level });
        }
        if let Some(error) = &outcome.error {
            self.events.emit(Event::Exception { envelope: envelope.clone(), error: error.clone() });
        }
    }
}

/// Run a single sandbox invocation, threading shared mutable state through
/// a clone-execute-writeback cycle (spec §5: safe because the caller holds
/// the run's script mutex for the duration).
#[allow(clippy::too_many_arguments)]
async fn run_one_script(
    shared: &SharedRunState,
    protocol: String,
    script: &str,
    script_type: ScriptType,
    scope: crate::scope::ScopeChain,
    request: Option<RequestData>,
    request_options: Option<RequestOptions>,
    response: Option<ResponseData>,
    iter_ctx: &IterCtx,
    current_path: &str,
) -> (ScriptOutcome, crate::scope::ScopeChain, Option<RequestData>, Option<RequestOptions>) {
    let fallback_scope = scope.clone();
    let collection_variables = shared.collection_variables.lock().await.clone();
    let global_variables = shared.global_variables.lock().await.clone();
    let environment = shared.environment.lock().await.clone();
    let cookie_jar = shared.cookie_jar.lock().await.clone();
    let history = shared.history.lock().await.snapshot().to_vec();

    let input = ScriptInput {
        script: script.to_string(),
        script_type,
        scope,
        collection_variables,
        global_variables,
        environment,
        cookie_jar,
        request,
        request_options,
        response,
        iteration_current: iter_ctx.current,
        iteration_count: iter_ctx.count,
        iteration_data: iter_ctx.data.clone(),
        history,
        plugins: shared.plugins.clone(),
        protocol,
        timeout_ms: None,
        abort: shared.abort.clone(),
        expected_messages: None,
        current_event: None,
        current_path: current_path.to_string(),
    };

    let sandbox = ScriptSandbox::new();
    match sandbox.execute(input).await {
        Ok(output) => {
            *shared.collection_variables.lock().await = output.collection_variables;
            *shared.global_variables.lock().await = output.global_variables;
            *shared.environment.lock().await = output.environment;
            *shared.cookie_jar.lock().await = output.cookie_jar;
            (output.outcome, output.scope, output.request, output.request_options)
        }
        Err(e) => {
            tracing::error!(error = %e, "script engine failure");
            let outcome = ScriptOutcome { success: false, error: Some(e.to_string()), tests: Vec::new(), console_output: Vec::new() };
            (outcome, fallback_scope, None, None)
        }
    }
}

async fn evaluate_condition(expr: String, vars: VarMap) -> bool {
    tokio::task::spawn_blocking(move || evaluate_condition_sync(&expr, &vars)).await.unwrap_or(true)
}

/// A minimal, self-contained evaluator for `condition` expressions: binds
/// every known variable as a plain global and evaluates the expression as
/// JS. Unlike the full script sandbox, this has no `quest` surface, since
/// conditions only ever reference variables, never perform scripting
/// side effects.
fn evaluate_condition_sync(expr: &str, vars: &VarMap) -> bool {
    let runtime = match rquickjs::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return true,
    };
    let context = match rquickjs::Context::full(&runtime) {
        Ok(ctx) => ctx,
        Err(_) => return true,
    };
    context.with(|ctx| {
        let globals = ctx.globals();
        for (key, value) in vars {
            if let Ok(json) = serde_json::to_string(value) {
                if let Ok(js_value) = ctx.eval::<rquickjs::Value, _>(json.as_str()) {
                    let _ = globals.set(key.as_str(), js_value);
                }
            }
        }
        ctx.eval::<bool, _>(expr).unwrap_or(true)
    })
}

fn url_host_path(url: &str) -> (String, String) {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let (host_port, raw_path) =
        without_scheme.split_once('/').map(|(h, p)| (h, format!("/{p}"))).unwrap_or_else(|| (without_scheme, "/".to_string()));
    let host = host_port.split(['?', '#']).next().unwrap_or(host_port);
    let host = host.rsplit('@').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    let path = raw_path.split(['?', '#']).next().unwrap_or(&raw_path).to_string();
    (host.to_string(), path)
}

/// Resolve item ids to their display names, falling back to the id itself
/// for a `dependsOn`/folder-path reference that doesn't resolve (should
/// never happen post-validation, but keeps path rendering infallible).
fn names_for(collection: &Collection, ids: &[String]) -> Vec<String> {
    ids.iter().map(|id| collection.find(id).map(|i| i.name().to_string()).unwrap_or_else(|| id.clone())).collect()
}

fn path_string(kind: PathType, mut segments: Vec<String>) -> String {
    let kind_str = match kind {
        PathType::Collection => "collection",
        PathType::Folder => "folder",
        PathType::Request => "request",
    };
    if segments.is_empty() {
        return format!("{kind_str}:/");
    }
    format!("{kind_str}:/{}", segments.drain(..).collect::<Vec<_>>().join("/"))
}

/// Compile `RunOptions.filter` against every request's full path and
/// return the set of node ids that survive it: matching requests, plus
/// every ancestor folder's pre/post pseudo-nodes (spec §8 "non-matching
/// items are skipped (and their unique post hooks too)" — a folder whose
/// entire subtree was filtered out never runs its own hooks either).
fn compute_filter_active(dag: &Dag, collection: &Collection, filter: &Regex) -> IndexSet<NodeId> {
    let mut active = IndexSet::new();
    for id in dag.node_ids() {
        let NodeId::Request(request_id) = id else { continue };
        let Some(Item::Request(request)) = collection.find(request_id) else { continue };
        let info = dag.info(id);
        let mut segments = names_for(collection, &info.folder_path);
        segments.push(request.common.name.clone());
        let path = path_string(PathType::Request, segments);
        if filter.is_match(&path) {
            active.insert(id.clone());
            for ancestor in &info.folder_path {
                active.insert(NodeId::FolderPre(ancestor.clone()));
                active.insert(NodeId::FolderPost(ancestor.clone()));
            }
        }
    }
    active
}
