pub mod backend;
pub mod config;
pub mod error;
pub mod logger;
pub mod model;
pub mod notice;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod poller;
pub mod store;

// Stage coordinators, each an `impl Orchestrator` block.
pub mod cloning;
pub mod cutover;
pub mod discovery;
pub mod live_sync;
pub mod post_migration;
pub mod precheck;
pub mod preparation;
pub mod replication;

pub use error::WaveError;
pub use orchestrator::Orchestrator;

pub type Result<T> = std::result::Result<T, WaveError>;

pub use backend::{BackendError, HttpBackend, MigrationBackend};
pub use config::{AgentStagePolicy, PilotConfig};
pub use live_sync::LiveSyncMonitor;
pub use model::{
    Host, HostSpec, MigrationWave, OperationKind, OperationRecord, OperationStatus, PowerState,
    Stage, StageName, StageStatus, VirtualMachine,
};
pub use pipeline::{PipelineReport, StepOutcome};
pub use poller::PollingScheduler;
pub use store::{EntityStore, Snapshot};
