//! # quest-core
//!
//! The collection execution engine for the quest scripted API test runner:
//! a scoped variable/scripting runtime, a DAG-based scheduler honoring
//! pre/post script inheritance across collection -> folder -> request, and
//! a typed event stream describing a run as it happens. Collection file
//! loading/validation, concrete protocol/auth plugins, and reporters are
//! external collaborators (spec §1/§6); this crate only drives them.

pub mod collection;
pub mod context;
pub mod cookie_jar;
pub mod dag;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod scope;
pub mod value;

pub use collection::{Collection, CollectionInfo, Folder, Item, ItemCommon, Request, TestDataRow};
pub use context::{Environment, RequestResult, RunOptions, RunResult, SharedRunState, SharedScopeFrames, TestResult};
pub use cookie_jar::{Cookie, CookieJar, CookieSetOptions, SameSite};
pub use dag::{Dag, NodeId, NodeInfo};
pub use error::{Error, Result};
pub use event_bus::{ConsoleLevel, Envelope, Event, EventBus, EventSubscriber, PathType, ValidationSummary};
pub use history::{ExecutionHistory, HistoryEntry};
pub use runner::CollectionRunner;
pub use sandbox::{ScriptInput, ScriptOutcome, ScriptOutput, ScriptSandbox, ScriptType};
pub use scheduler::{NodeFuture, Scheduler};
pub use scope::{ScopeChain, ScopeFrame, ScopeLevel};
pub use value::{Resolved, VarMap};
