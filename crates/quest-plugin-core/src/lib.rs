//! # quest-plugin-core
//!
//! Plugin interfaces that the quest collection execution engine drives:
//! protocol transports, auth schemes, and value providers. Concrete
//! implementations (a real HTTP client, a real OAuth flow, ...) are
//! external collaborators and live outside this workspace; this crate only
//! specifies the ports.

pub mod auth;
pub mod cancellation;
pub mod error;
pub mod headers;
pub mod protocol;
pub mod registry;
pub mod types;
pub mod value_provider;

pub use auth::{AuthConfig, AuthPlugin, AuthValidation};
pub use cancellation::CancellationToken;
pub use error::{PluginError, ValidationError};
pub use headers::HeaderBag;
pub use protocol::ProtocolPlugin;
pub use registry::{PluginRegistry, PluginRegistryBuilder};
pub use types::{
    EventCapability, ExecutionOutcome, PluginContext, PluginEvent, ProtocolCapabilities, RequestData,
    RequestOptions, ResponseData, VariableResolver,
};
pub use value_provider::ValueProviderPlugin;
