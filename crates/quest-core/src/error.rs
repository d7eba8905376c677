//! Crate-level error type.
//!
//! Grounded directly on `mockforge-core`'s `error.rs`: a flat
//! `thiserror::Error` enum with `#[from]` passthroughs for the handful of
//! foreign error types the engine actually touches, plus a `Generic` escape
//! hatch and a `From<String>` impl for convenience call sites.

pub use quest_plugin_core::ValidationError;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level error taxonomy (spec §7).
///
/// Note that [`ValidationError`] (pre-run, aggregated into
/// `RunResult.validationErrors`) is deliberately *not* a variant here: per
/// §7, validation failures are data returned alongside a result, not an
/// error thrown out of the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A user script failed to parse or threw outside a `quest.test` guard.
    #[error("Script error: {0}")]
    ScriptRuntime(String),

    /// A protocol or auth plugin reported a failure.
    #[error("Plugin error: {0}")]
    Plugin(#[from] quest_plugin_core::PluginError),

    /// The run (or the node in question) was cancelled.
    #[error("Aborted: {0}")]
    Abort(String),

    /// The collection graph was malformed in a way validation should have
    /// caught (defensive; should not occur for a validated collection).
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JavaScript engine failure unrelated to a specific user script error
    /// (e.g. runtime construction).
    #[error("JavaScript engine error: {0}")]
    JavaScript(#[from] rquickjs::Error),

    /// Catch-all for everything else.
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Self::Generic(message.to_string())
    }
}

impl Error {
    /// Construct a [`Error::ScriptRuntime`] error.
    pub fn script(message: impl Into<String>) -> Self {
        Self::ScriptRuntime(message.into())
    }

    /// Construct a [`Error::Abort`] error.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }

    /// Construct a [`Error::Scheduling`] error.
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling(message.into())
    }
}
