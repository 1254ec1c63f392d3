//! Sync - live update batching, bulk queries, subscription lifecycle and bootstrap.

mod batch;
mod hooks;
mod loading;
mod orchestrator;
pub mod queries;
mod request_queue;
mod simulator;
mod stream_manager;

pub use batch::{FlushReport, UpdateQueue};
pub use hooks::{
    player_descriptor, ActiveStructureSync, FeatureSync, FeatureSyncOutcome, PlayerStructureSync,
    PollReport,
};
pub use loading::{LoadingState, LoadingStateKey};
pub use orchestrator::{InitialSyncReport, SyncContext};
pub use request_queue::{OnComplete, RequestQueue};
pub use simulator::{SimulatedModel, SimulatorConfig, SimulatorStats, SyncSimulator};
pub use stream_manager::{
    BoundedClauseBuilder, BoundsDescriptor, ClauseBuilder, ModelBounds, RequestTicket,
    StreamManager, SwitchOutcome,
};
