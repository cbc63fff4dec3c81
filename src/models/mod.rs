pub mod capacity;
pub mod execution;
pub mod plan;

pub use capacity::{
    ActiveJob, AdmissionDenial, CapacityReport, CapacitySnapshot, DenialReason, ServerClaim,
    ServerConflict,
};
pub use execution::{
    Execution, ExecutionMode, ExecutionStatus, HistoryEntry, HistoryKind, HistoryRecord, LaunchStatus,
    ServerExecution, WaveExecution, WaveStatus,
};
pub use plan::{PlanWave, ProtectionGroup, RecoveryPlan};
