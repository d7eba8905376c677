//! Error type surfaced by plugin implementations.

use thiserror::Error;

/// Errors a protocol, auth, or value-provider plugin can raise.
///
/// This maps onto spec §7's `RequestError`/`PluginError` taxonomy: a
/// `PluginError` returned from `execute`/`apply` is wrapped by the engine
/// into a `RequestResult.error` for that node and does not halt the run
/// unless `execution.bail` is set.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The operation was cancelled via the run's [`crate::CancellationToken`].
    #[error("Request aborted")]
    Aborted,

    /// The per-request timeout elapsed before the plugin completed.
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// A network-level failure reported by the plugin.
    #[error("Request failed: {0}")]
    Network(String),

    /// The plugin's own configuration was malformed.
    #[error("Plugin configuration error: {0}")]
    Config(String),

    /// Any other plugin-reported failure.
    #[error("{0}")]
    Other(String),
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        Self::Other(message.to_string())
    }
}

/// A single validation failure, aggregated by the engine into
/// `RunResult.validationErrors` (spec §4.5/§4.6/§7) rather than thrown.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    /// Human-readable description of what failed validation.
    pub message: String,
    /// Path of the item the error applies to, if any (`kind:/segments`).
    pub path: Option<String>,
}

impl ValidationError {
    /// Construct a validation error with no associated path.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), path: None }
    }

    /// Construct a validation error scoped to a specific item path.
    pub fn at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { message: message.into(), path: Some(path.into()) }
    }
}
