//! Session persistence: the state snapshot, final reports and the
//! single-writer session lock.

use crate::config::OrchestratorConfig;
use crate::errors::OrchestratorError;
use crate::orchestrator::state::{
    Cycle, OrchestratorState, PerformanceMetrics, StateTransition, StopReason,
};
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "orchestrator_state.json";
pub const REPORTS_DIR: &str = "reports";
const LOCK_FILE: &str = ".conductor.lock";

/// Everything needed to inspect or resume a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub current_state: OrchestratorState,
    pub state_history: Vec<StateTransition>,
    pub config: OrchestratorConfig,
    pub performance_metrics: PerformanceMetrics,
    pub recovery_attempts: u32,
    pub is_running: bool,
    #[serde(default)]
    pub cycles: Vec<Cycle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl StateSnapshot {
    /// A session in these states can be picked up again with `--resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.current_state,
            OrchestratorState::Initializing
                | OrchestratorState::ProtocolSetup
                | OrchestratorState::EnvironmentAnalysis
                | OrchestratorState::PipelineExecution
                | OrchestratorState::ErrorRecovery
                | OrchestratorState::MonitoringActive
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub final_state: OrchestratorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

/// Written once when a run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub session_id: String,
    pub execution_summary: ExecutionSummary,
    pub performance_metrics: PerformanceMetrics,
    pub configuration: OrchestratorConfig,
    pub state_transitions_count: usize,
    pub recovery_attempts: u32,
}

impl FinalReport {
    pub fn from_snapshot(snapshot: &StateSnapshot, end_time: DateTime<Utc>) -> Self {
        let duration_secs = (end_time - snapshot.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            session_id: snapshot.session_id.clone(),
            execution_summary: ExecutionSummary {
                start_time: snapshot.started_at,
                end_time,
                duration_secs,
                final_state: snapshot.current_state,
                stop_reason: snapshot.stop_reason,
            },
            performance_metrics: snapshot.performance_metrics.clone(),
            configuration: snapshot.config.clone(),
            state_transitions_count: snapshot.state_history.len(),
            recovery_attempts: snapshot.recovery_attempts,
        }
    }
}

/// Reads and writes the files under a session directory.
#[derive(Debug, Clone)]
pub struct StatePersister {
    session_dir: PathBuf,
    state_file: PathBuf,
}

impl StatePersister {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            session_dir: session_dir.to_path_buf(),
            state_file: session_dir.join(STATE_FILE),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.session_dir.join(REPORTS_DIR)
    }

    /// Replace the snapshot atomically.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<(), OrchestratorError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.state_file, &json).map_err(|source| OrchestratorError::PersistFailed {
            path: self.state_file.clone(),
            source,
        })
    }

    /// The last snapshot, or `None` for a fresh session directory.
    pub fn load(&self) -> Result<Option<StateSnapshot>, OrchestratorError> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.state_file).map_err(|source| OrchestratorError::LoadFailed {
                path: self.state_file.clone(),
                source,
            })?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write `reports/{start}_{id8}.json` and return its path.
    pub fn write_report(&self, report: &FinalReport) -> Result<PathBuf, OrchestratorError> {
        let short_id: String = report.session_id.chars().take(8).collect();
        let filename = format!(
            "{}_{}.json",
            report
                .execution_summary
                .start_time
                .format("%Y-%m-%dT%H-%M-%S"),
            short_id
        );
        let path = self.reports_dir().join(filename);
        let json = serde_json::to_vec_pretty(report)?;
        write_atomic(&path, &json).map_err(|source| OrchestratorError::PersistFailed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Report files, oldest first.
    pub fn list_reports(&self) -> Result<Vec<PathBuf>, OrchestratorError> {
        let dir = self.reports_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| OrchestratorError::LoadFailed {
            path: dir.clone(),
            source,
        })?;
        let mut reports: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        reports.sort();
        Ok(reports)
    }

    pub fn load_report(&self, path: &Path) -> Result<FinalReport, OrchestratorError> {
        let content = fs::read_to_string(path).map_err(|source| OrchestratorError::LoadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Exclusive advisory lock on a session directory, released on drop.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    pub fn acquire(session_dir: &Path) -> Result<Self, OrchestratorError> {
        fs::create_dir_all(session_dir).map_err(|source| OrchestratorError::PersistFailed {
            path: session_dir.to_path_buf(),
            source,
        })?;
        let path = session_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| OrchestratorError::PersistFailed {
                path: path.clone(),
                source,
            })?;
        if file.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::SessionLocked {
                path: session_dir.to_path_buf(),
            });
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
