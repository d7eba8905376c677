//! The auth plugin port: validates and applies credentials to a request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PluginError, ValidationError};
use crate::types::{PluginContext, RequestData};

/// Declarative auth configuration attached to a collection/folder/request.
///
/// Effective auth is resolved by the engine via nearest-ancestor lookup
/// (request > folder > collection, spec §4.6) before being handed to the
/// matching [`AuthPlugin`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Discriminator matched against a plugin's [`AuthPlugin::auth_types`].
    #[serde(rename = "type")]
    pub auth_type: String,
    /// Plugin-specific parameters (API key, token template, ...).
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Outcome of [`AuthPlugin::validate`].
#[derive(Debug, Clone)]
pub enum AuthValidation {
    /// Configuration is acceptable.
    Valid,
    /// Configuration is rejected; errors are aggregated into
    /// `RunResult.validationErrors` (spec §4.5/§7) rather than thrown.
    Invalid(Vec<ValidationError>),
}

impl AuthValidation {
    /// Whether this outcome is [`AuthValidation::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A pluggable credential scheme: basic auth, API key, bearer token, OAuth,
/// or anything else that can mutate a [`RequestData`] before it executes.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// Plugin name, for diagnostics.
    fn name(&self) -> &str;

    /// Plugin semantic version.
    fn version(&self) -> &str;

    /// `auth.type` discriminators this plugin handles.
    fn auth_types(&self) -> &[String];

    /// Collection protocol tags this plugin is usable with.
    fn protocols(&self) -> &[String];

    /// Optional JSON Schema describing `AuthConfig.params` for this type.
    fn data_schema(&self) -> Option<Value> {
        None
    }

    /// Validate `auth` ahead of any request executing.
    fn validate(&self, auth: &AuthConfig, ctx: &PluginContext) -> AuthValidation;

    /// Apply credentials to `request`, returning a (possibly new) request.
    ///
    /// Implementations must not overwrite an existing `Authorization` header
    /// (spec §4.6) — use [`crate::headers::HeaderBag::set_if_absent`]
    /// rather than `set`.
    async fn apply(
        &self,
        request: RequestData,
        auth: &AuthConfig,
        ctx: &PluginContext,
    ) -> Result<RequestData, PluginError>;
}
