//! Trading Engine
//!
//! Position lifecycle coordination, at-most-once action execution, two-channel
//! conflict resolution, and cross-account hedge orchestration.

pub mod action_sync;
pub mod conflict_resolver;
pub mod consistency;
pub mod hedge_orchestrator;
pub mod position_coordinator;

pub use action_sync::{ActionSyncEngine, ExecutionResult, SyncStats};
pub use conflict_resolver::{
    ConflictContext, ConflictResolution, ConflictResolver, ConflictType, ResolutionStrategy,
    ResolverMetrics, SourceChannel,
};
pub use consistency::{ActionConsistencyManager, LockStats};
pub use hedge_orchestrator::{
    CrossAccountHedgeOrchestrator, CrossAccountHedgeRequest, CrossAccountHedgeResult,
    HedgeExecutionStatus, HedgeLeg, LegResult, OrchestratorHealth, SynchronizationReport,
};
pub use position_coordinator::{
    EntryRequest, PositionCoordinator, RealtimeSnapshot, TransitionOutcome,
};
