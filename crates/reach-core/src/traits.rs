use futures::future::BoxFuture;

use crate::error::Result;
use crate::policy::Policy;
use crate::types::{AdapterKind, Event, RunId, TelemetryEvent, ToolCall, ToolResult};

/// Tool/model adapter. Performs the external I/O behind a tool call.
///
/// Results may be slow or non-deterministic. The engine records them into
/// the event log, so replay never invokes an adapter.
pub trait ToolAdapter: Send + Sync + 'static {
    /// Adapter name (e.g., "hosted-search", "local-python").
    fn name(&self) -> &str;

    /// Which adapter family this is.
    fn kind(&self) -> AdapterKind;

    /// Perform the call.
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolResult>>;

    /// Default timeout in milliseconds when the step does not set one.
    fn timeout_ms(&self) -> u64 {
        30_000
    }
}

/// Storage driver: durable home for run events.
pub trait StorageDriver: Send + Sync + 'static {
    /// Persist one event for a run. Re-putting the same `seq` is a no-op.
    fn put(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>>;

    /// All stored events for a run, ordered by `seq`.
    fn get_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>>;
}

/// Policy bundle loader.
pub trait PolicyLoader: Send + Sync + 'static {
    fn load_policy(&self, reference: &str) -> BoxFuture<'_, Result<Policy>>;
}

/// Telemetry sink. Write-only and fire-and-forget: nothing emitted here may
/// feed back into execution.
pub trait TelemetrySink: Send + Sync + 'static {
    fn emit(&self, event: TelemetryEvent);
}
