//! Typed error hierarchy for conductor.
//!
//! Top-level enums cover the subsystems:
//! - `OrchestratorError`: configuration, state machine and persistence failures
//! - `StepFailure`: why a single pipeline step failed (cycle-level, recoverable)
//! - `RecoveryError`: the recovery budget is spent
//! - `RegistryError`: registry store I/O
//! - `HealthProbeError`: a single service health probe

use crate::orchestrator::state::OrchestratorState;
use crate::orchestrator::steps::StepKind;
use thiserror::Error;

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: OrchestratorState,
        to: OrchestratorState,
    },

    #[error("Session directory {path} is locked by another orchestrator")]
    SessionLocked { path: std::path::PathBuf },

    #[error("Failed to write state file at {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state file at {path}: {source}")]
    LoadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Build a configuration error from a list of validation problems.
    pub fn configuration(problems: &[String]) -> Self {
        Self::Configuration(problems.join("; "))
    }
}

/// Why a pipeline step failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepFailure {
    #[error("{kind} timed out after {timeout_secs}s")]
    Timeout { kind: StepKind, timeout_secs: u64 },

    #[error("{kind} exited with code {exit_code}")]
    Failure { kind: StepKind, exit_code: i32 },

    #[error("{kind} raised an unexpected fault: {message}")]
    Component { kind: StepKind, message: String },
}

impl StepFailure {
    /// All step failures can be retried through recovery.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Errors from the recovery manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Recovery exhausted after {attempts} of {max} attempts")]
    Exhausted { attempts: u32, max: u32 },
}

/// Errors from the service registry store.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry document at {path} is corrupt: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

/// Errors from a single health probe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthProbeError {
    #[error("Health probe to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Health probe to {url} timed out")]
    Timeout { url: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_joins_problems() {
        let err = OrchestratorError::configuration(&[
            "max_cycles must be at least 1".to_string(),
            "pipeline has no steps".to_string(),
        ]);
        match &err {
            OrchestratorError::Configuration(msg) => {
                assert!(msg.contains("max_cycles"));
                assert!(msg.contains("no steps"));
            }
            _ => panic!("Expected Configuration"),
        }
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = OrchestratorError::InvalidTransition {
            from: OrchestratorState::Completed,
            to: OrchestratorState::PipelineExecution,
        };
        let msg = err.to_string();
        assert!(msg.contains("COMPLETED"));
        assert!(msg.contains("PIPELINE_EXECUTION"));
    }

    #[test]
    fn step_failure_timeout_carries_seconds() {
        let err = StepFailure::Timeout {
            kind: StepKind::ApplyFixes,
            timeout_secs: 30,
        };
        assert!(err.to_string().contains("30s"));
        assert!(err.to_string().contains("apply-fixes"));
        assert!(err.is_retryable());
    }

    #[test]
    fn recovery_exhausted_is_matchable() {
        let err = RecoveryError::Exhausted { attempts: 3, max: 3 };
        assert!(matches!(err, RecoveryError::Exhausted { attempts: 3, .. }));
    }

    #[test]
    fn registry_io_error_carries_path() {
        let path = std::path::PathBuf::from("/registry/services.json");
        let err = RegistryError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            RegistryError::Io { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::Configuration("x".into()));
        assert_std_error(&StepFailure::Failure {
            kind: StepKind::Scan,
            exit_code: 2,
        });
        assert_std_error(&RecoveryError::Exhausted { attempts: 1, max: 1 });
        assert_std_error(&HealthProbeError::Timeout {
            url: "http://127.0.0.1:1/health".into(),
        });
    }
}
