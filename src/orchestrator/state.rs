//! Orchestrator state machine types, cycle records and performance metrics.

use crate::orchestrator::steps::StepOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// States of the cycle orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    #[default]
    Initializing,
    ProtocolSetup,
    EnvironmentAnalysis,
    PipelineExecution,
    QualityAssurance,
    SecurityValidation,
    PerformanceOptimization,
    DeploymentPreparation,
    MonitoringActive,
    ErrorRecovery,
    Completed,
    Failed,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::ProtocolSetup => "PROTOCOL_SETUP",
            Self::EnvironmentAnalysis => "ENVIRONMENT_ANALYSIS",
            Self::PipelineExecution => "PIPELINE_EXECUTION",
            Self::QualityAssurance => "QUALITY_ASSURANCE",
            Self::SecurityValidation => "SECURITY_VALIDATION",
            Self::PerformanceOptimization => "PERFORMANCE_OPTIMIZATION",
            Self::DeploymentPreparation => "DEPLOYMENT_PREPARATION",
            Self::MonitoringActive => "MONITORING_ACTIVE",
            Self::ErrorRecovery => "ERROR_RECOVERY",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Every non-terminal state may fail or complete (interrupts end in
    /// `COMPLETED` from wherever the loop happens to be).
    pub fn can_transition_to(&self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Completed | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Initializing, ProtocolSetup)
                | (ProtocolSetup, EnvironmentAnalysis)
                | (EnvironmentAnalysis, PipelineExecution)
                | (PipelineExecution, ErrorRecovery)
                | (PipelineExecution, MonitoringActive)
                | (PipelineExecution, QualityAssurance)
                | (MonitoringActive, PipelineExecution)
                | (ErrorRecovery, PipelineExecution)
                | (QualityAssurance, SecurityValidation)
                | (SecurityValidation, PerformanceOptimization)
                | (PerformanceOptimization, DeploymentPreparation)
        )
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The completion probe reported issues at or below target
    TargetReached,
    MaxCycles,
    SingleCycle,
    /// A shutdown signal cleared the running flag
    Interrupted,
    RecoveryExhausted,
    /// A cycle failed with recovery disabled
    CycleFailed,
    FinalizationFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetReached => "target_reached",
            Self::MaxCycles => "max_cycles",
            Self::SingleCycle => "single_cycle",
            Self::Interrupted => "interrupted",
            Self::RecoveryExhausted => "recovery_exhausted",
            Self::CycleFailed => "cycle_failed",
            Self::FinalizationFailed => "finalization_failed",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the append-only state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: OrchestratorState,
    pub timestamp: DateTime<Utc>,
}

/// A single pass through the step pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    /// 1-based ordinal
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub batch_size: u32,
    pub steps: Vec<StepOutcome>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub success: bool,
    /// Set when an interrupt cut the remaining steps short.
    #[serde(default)]
    pub interrupted: bool,
}

impl Cycle {
    /// The first hard failure, if any.
    pub fn failure(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| !s.ok)
    }
}

/// Aggregate counters across all cycles of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_cycles: u32,
    pub successful_cycles: u32,
    pub failed_cycles: u32,
    /// Cut short by an interrupt; neither successful nor failed
    #[serde(default)]
    pub interrupted_cycles: u32,
    pub total_duration_secs: f64,
    pub average_cycle_duration_secs: f64,
    /// successful / total, 0.0 when no cycle has run
    pub success_rate: f64,
    pub adaptive_batch_size: u32,
    #[serde(default)]
    pub issues_remaining: Option<u64>,
}

impl PerformanceMetrics {
    pub fn new(batch_size: u32) -> Self {
        Self {
            total_cycles: 0,
            successful_cycles: 0,
            failed_cycles: 0,
            interrupted_cycles: 0,
            total_duration_secs: 0.0,
            average_cycle_duration_secs: 0.0,
            success_rate: 0.0,
            adaptive_batch_size: batch_size,
            issues_remaining: None,
        }
    }

    /// Fold one finished cycle into the counters.
    pub fn record_cycle(&mut self, success: bool, duration: Duration) {
        if success {
            self.successful_cycles += 1;
        } else {
            self.failed_cycles += 1;
        }
        self.fold(duration);
    }

    /// Fold a cycle an interrupt cut short.
    pub fn record_interrupted(&mut self, duration: Duration) {
        self.interrupted_cycles += 1;
        self.fold(duration);
    }

    fn fold(&mut self, duration: Duration) {
        self.total_cycles += 1;
        self.total_duration_secs += duration.as_secs_f64();
        self.average_cycle_duration_secs = self.total_duration_secs / self.total_cycles as f64;
        self.success_rate = self.successful_cycles as f64 / self.total_cycles as f64;
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
