//! The value-provider plugin port, used by variable definitions that opt
//! into a non-default source (spec §4.6, e.g. `vault:file`).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PluginError;
use crate::types::PluginContext;

/// Resolves values for variables whose definition names a provider other
/// than the default literal/templated value, e.g. `provider: "vault:file"`.
#[async_trait]
pub trait ValueProviderPlugin: Send + Sync {
    /// The `provider:kind` identifier this plugin registers under
    /// (e.g. `"vault:file"`).
    fn id(&self) -> &str;

    /// Resolve a value for `key` given provider-specific `params`.
    ///
    /// Returns `Ok(None)` for the null sentinel when the provider has
    /// nothing for this key (not an error).
    async fn resolve(&self, key: &str, params: &Value, ctx: &PluginContext) -> Result<Option<Value>, PluginError>;
}
