//! The cycle-based pipeline orchestrator.

pub mod batch;
pub mod engine;
pub mod persist;
pub mod probe;
pub mod recovery;
pub mod runner;
pub mod state;
pub mod steps;

pub use batch::{AdaptiveBatchController, BatchPolicy};
pub use engine::{CycleOrchestrator, RunSummary};
pub use persist::{FinalReport, SessionLock, StatePersister, StateSnapshot};
pub use probe::{CommandProbe, CompletionProbe, ProbeContext, ScanOutputProbe};
pub use recovery::{RecoveryHook, RecoveryManager, RecoveryPolicy, ServiceReconnect};
pub use runner::{CommandRunner, CommandSpec, ProcessOutput, SubprocessRunner};
pub use state::{Cycle, OrchestratorState, PerformanceMetrics, StateTransition, StopReason};
pub use steps::{StepKind, StepOutcome, StepSpec, default_pipeline};
