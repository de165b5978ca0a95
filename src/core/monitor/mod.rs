//! Monitoring orchestration: the real-time path, its events, and the
//! background workers it hands off to.

pub mod events;
pub mod operator;
pub mod orchestrator;
pub mod persistence;
pub mod runtime;
pub mod telemetry;

pub use events::{Connectivity, DegradedIndicator, EventBus, MonitorEvent};
pub use operator::{OperatorCommand, OperatorHandle};
pub use orchestrator::{
    spawn_realtime, IterationSummary, Orchestrator, OrchestratorConfig, OrchestratorLinks, OrchestratorStats,
    SharedState,
};
pub use persistence::{persist_once, storage_worker, JsonLinesArchive, PersistRequest, StorageSink};
pub use runtime::{Collaborators, MonitorRuntime, REALTIME_COMPONENT, STORAGE_COMPONENT, TELEMETRY_COMPONENT};
pub use telemetry::{
    deliver, telemetry_worker, BatchAccumulator, BatchSigner, LogTelemetrySink, Sha256Signer, TelemetryBatch,
    TelemetrySink, TelemetryWindow,
};
