//! Registry of plugins injected at runner construction (spec §6: "injected
//! at runner construction; never loaded at run time by the core").

use std::sync::Arc;

use indexmap::IndexMap;

use crate::auth::AuthPlugin;
use crate::protocol::ProtocolPlugin;
use crate::value_provider::ValueProviderPlugin;

/// Immutable, read-only-after-construction set of registered plugins.
///
/// Read-only after run start per spec §5's shared-resource model; there is
/// deliberately no mutation API once built.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    protocols: IndexMap<String, Arc<dyn ProtocolPlugin>>,
    auth: Vec<Arc<dyn AuthPlugin>>,
    value_providers: IndexMap<String, Arc<dyn ValueProviderPlugin>>,
}

impl PluginRegistry {
    /// Start building a registry.
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Look up the protocol plugin registered for `protocol`.
    pub fn protocol(&self, protocol: &str) -> Option<Arc<dyn ProtocolPlugin>> {
        self.protocols.get(protocol).cloned()
    }

    /// Pick the first auth plugin whose `auth_types` contains `auth_type`
    /// and whose `protocols` contains `protocol`, per spec §4.6/§9's
    /// "iterate registered auth plugins, pick the first" resolution rule.
    pub fn auth_for(&self, auth_type: &str, protocol: &str) -> Option<Arc<dyn AuthPlugin>> {
        self.auth
            .iter()
            .find(|plugin| {
                plugin.auth_types().iter().any(|t| t == auth_type)
                    && plugin.protocols().iter().any(|p| p == protocol)
            })
            .cloned()
    }

    /// Look up a value-provider plugin by its `provider:kind` identifier.
    pub fn value_provider(&self, id: &str) -> Option<Arc<dyn ValueProviderPlugin>> {
        self.value_providers.get(id).cloned()
    }

    /// All registered protocol tags, for validation error messages.
    pub fn known_protocols(&self) -> Vec<&str> {
        self.protocols.keys().map(String::as_str).collect()
    }
}

/// Builder for [`PluginRegistry`].
#[derive(Default)]
pub struct PluginRegistryBuilder {
    protocols: IndexMap<String, Arc<dyn ProtocolPlugin>>,
    auth: Vec<Arc<dyn AuthPlugin>>,
    value_providers: IndexMap<String, Arc<dyn ValueProviderPlugin>>,
}

impl PluginRegistryBuilder {
    /// Register a protocol plugin under its advertised protocol tag.
    pub fn with_protocol(mut self, plugin: Arc<dyn ProtocolPlugin>) -> Self {
        let tag = plugin.capabilities().protocol.clone();
        self.protocols.insert(tag, plugin);
        self
    }

    /// Register an auth plugin. Order matters: earlier registrations win
    /// ties in [`PluginRegistry::auth_for`].
    pub fn with_auth(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.auth.push(plugin);
        self
    }

    /// Register a value-provider plugin under its `provider:kind` id.
    pub fn with_value_provider(mut self, plugin: Arc<dyn ValueProviderPlugin>) -> Self {
        self.value_providers.insert(plugin.id().to_string(), plugin);
        self
    }

    /// Finalize the registry.
    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            protocols: self.protocols,
            auth: self.auth,
            value_providers: self.value_providers,
        }
    }
}
