//! The protocol plugin port the engine drives to actually execute requests.

use async_trait::async_trait;

use crate::cancellation::CancellationToken;
use crate::error::{PluginError, ValidationError};
use crate::types::{ExecutionOutcome, PluginContext, ProtocolCapabilities, RequestData, RequestOptions};

/// A pluggable transport: HTTP, gRPC, GraphQL, or anything else that can
/// turn a [`RequestData`] into an [`ExecutionOutcome`].
///
/// Concrete implementations are out of scope for this crate (spec §1) —
/// this trait is the port the engine calls through, not a home for any
/// particular wire protocol.
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Static capability/identity descriptor.
    fn capabilities(&self) -> &ProtocolCapabilities;

    /// Optional pre-flight validation of a request, called during run
    /// validation (spec §4.5) before any request executes.
    fn validate(&self, _request: &RequestData, _options: &RequestOptions) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Execute the request, honoring `signal` for cooperative cancellation.
    ///
    /// Implementations must observe `signal` during any suspension point and
    /// return `Err(PluginError::Aborted)` promptly once tripped, per §4.7.
    async fn execute(
        &self,
        request: RequestData,
        options: RequestOptions,
        signal: CancellationToken,
    ) -> Result<ExecutionOutcome, PluginError>;

    /// Optional protocol-provided extension merged into the `quest` object
    /// (spec §4.2's `protocolAPIProvider`). Returned as an opaque JSON value;
    /// the sandbox is responsible for enforcing the reserved-key rules when
    /// merging it in.
    fn protocol_api_provider(&self, _ctx: &PluginContext) -> Option<serde_json::Value> {
        None
    }
}
