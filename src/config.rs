//! Configuration for conductor.
//!
//! Settings come from `conductor.toml`, then environment variables, then CLI
//! flags, each layer overriding the one before.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_cycles = 10
//! target_issues = 0
//! execution_mode = "continuous"   # continuous | single_cycle | development | production
//! enable_recovery = true
//! session_dir = ".conductor/session"
//! timeout_per_cycle = 300
//! initial_batch_size = 10
//! adaptive_batch_sizing = true
//! max_cycle_history = 20         # cycles kept in the session snapshot
//!
//! [batch]
//! min_batch = 1
//! max_batch = 20
//! fast_threshold_secs = 60
//! slow_threshold_secs = 180
//!
//! [recovery]
//! max_recovery_attempts = 3
//! baseline_batch_size = 5
//!
//! [[pipeline.steps]]
//! kind = "scan"
//! command = "issue-scanner"
//! args = ["--session-dir", "{session_dir}", "--format", "json"]
//!
//! [[pipeline.steps]]
//! kind = "security-scan"
//! command = "security-scanner"
//! allow_failure = true
//!
//! [probe]
//! command = "issue-scanner"
//! args = ["--count"]
//!
//! [registry]
//! dir = ".conductor/registry"
//! port = 8700
//! ```

use crate::errors::OrchestratorError;
use crate::orchestrator::batch::BatchPolicy;
use crate::orchestrator::recovery::RecoveryPolicy;
use crate::orchestrator::steps::{StepSpec, default_pipeline};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "conductor.toml";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// How the cycle loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Loop until target, max cycles or failure
    #[default]
    Continuous,
    /// Stop after exactly one cycle
    SingleCycle,
    /// Continuous, debug logging, full step output kept
    Development,
    /// Continuous, then the QA/security/performance/deployment finalization pass
    Production,
}

impl ExecutionMode {
    pub fn keeps_full_output(&self) -> bool {
        matches!(self, ExecutionMode::Development)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Continuous => write!(f, "continuous"),
            ExecutionMode::SingleCycle => write!(f, "single_cycle"),
            ExecutionMode::Development => write!(f, "development"),
            ExecutionMode::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "continuous" => Ok(ExecutionMode::Continuous),
            "single_cycle" | "single" => Ok(ExecutionMode::SingleCycle),
            "development" | "dev" => Ok(ExecutionMode::Development),
            "production" | "prod" => Ok(ExecutionMode::Production),
            _ => anyhow::bail!(
                "Invalid execution mode '{}'. Valid values: continuous, single_cycle, development, production",
                s
            ),
        }
    }
}

pub const DEFAULT_MAX_CYCLE_HISTORY: usize = 20;

fn default_max_cycle_history() -> usize {
    DEFAULT_MAX_CYCLE_HISTORY
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_cycles: u32,
    pub target_issues: u64,
    pub execution_mode: ExecutionMode,
    pub enable_recovery: bool,
    pub session_dir: PathBuf,
    /// Directory steps run in (defaults to the config file's directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Seconds; default and ceiling for each step's timeout
    pub timeout_per_cycle: u64,
    pub initial_batch_size: u32,
    pub adaptive_batch_sizing: bool,
    /// Pause between cycles spent in MONITORING_ACTIVE
    pub cycle_interval_secs: u64,
    /// SIGTERM → SIGKILL grace for timed-out steps
    pub grace_period_secs: u64,
    /// Most recent cycle records kept in the session snapshot
    pub max_cycle_history: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_cycles: 10,
            target_issues: 0,
            execution_mode: ExecutionMode::default(),
            enable_recovery: true,
            session_dir: PathBuf::from(".conductor/session"),
            working_dir: None,
            log_level: None,
            timeout_per_cycle: 300,
            initial_batch_size: 10,
            adaptive_batch_sizing: true,
            cycle_interval_secs: 0,
            grace_period_secs: 5,
            max_cycle_history: DEFAULT_MAX_CYCLE_HISTORY,
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_pipeline")]
    pub steps: Vec<StepSpec>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            steps: default_pipeline(),
        }
    }
}

/// `[probe]` section: the completion probe command.
///
/// When no command is configured the issue count printed by the cycle's scan
/// step is used instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 60,
        }
    }
}

/// `[finalization]` section: steps for each production finalization stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationSection {
    pub quality_assurance: Vec<StepSpec>,
    pub security_validation: Vec<StepSpec>,
    pub performance_optimization: Vec<StepSpec>,
    pub deployment_preparation: Vec<StepSpec>,
}

/// `[registry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Heartbeat age after which a service is UNHEALTHY
    pub service_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".conductor/registry"),
            host: "127.0.0.1".to_string(),
            port: 8700,
            service_timeout_secs: 90,
            probe_timeout_secs: 10,
            sweep_interval_secs: 30,
        }
    }
}

impl RegistryConfig {
    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub batch: BatchPolicy,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub finalization: FinalizationSection,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize conductor.toml")
    }

    /// Apply `CONDUCTOR_*` environment overrides.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; returns unparseable values.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut problems = Vec::new();
        if let Some(dir) = lookup("CONDUCTOR_SESSION_DIR") {
            self.orchestrator.session_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("CONDUCTOR_LOG_LEVEL") {
            self.orchestrator.log_level = Some(level);
        }
        if let Some(raw) = lookup("CONDUCTOR_MAX_CYCLES") {
            match raw.parse() {
                Ok(n) => self.orchestrator.max_cycles = n,
                Err(_) => problems.push(format!("CONDUCTOR_MAX_CYCLES is not a number: '{}'", raw)),
            }
        }
        if let Some(dir) = lookup("CONDUCTOR_REGISTRY_DIR") {
            self.registry.dir = PathBuf::from(dir);
        }
        problems
    }

    /// Resolve relative paths against `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if self.orchestrator.session_dir.is_relative() {
            self.orchestrator.session_dir = base_dir.join(&self.orchestrator.session_dir);
        }
        let working_dir = match &self.orchestrator.working_dir {
            Some(dir) if dir.is_relative() => base_dir.join(dir),
            Some(dir) => dir.clone(),
            None => base_dir.to_path_buf(),
        };
        self.orchestrator.working_dir = Some(working_dir);
        if self.registry.dir.is_relative() {
            self.registry.dir = base_dir.join(&self.registry.dir);
        }
    }

    /// Every problem with the configuration; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let o = &self.orchestrator;

        if o.max_cycles == 0 {
            problems.push("orchestrator.max_cycles must be at least 1".to_string());
        }
        if o.timeout_per_cycle == 0 {
            problems.push("orchestrator.timeout_per_cycle must be at least 1 second".to_string());
        }
        if o.max_cycle_history == 0 {
            problems.push("orchestrator.max_cycle_history must be at least 1".to_string());
        }
        if let Some(level) = &o.log_level
            && !LOG_LEVELS.contains(&level.to_lowercase().as_str())
        {
            problems.push(format!(
                "orchestrator.log_level '{}' is not one of {}",
                level,
                LOG_LEVELS.join(", ")
            ));
        }

        problems.extend(self.batch.validate());
        if o.initial_batch_size < self.batch.min_batch || o.initial_batch_size > self.batch.max_batch
        {
            problems.push(format!(
                "orchestrator.initial_batch_size {} is outside [{}, {}]",
                o.initial_batch_size, self.batch.min_batch, self.batch.max_batch
            ));
        }

        if self.pipeline.steps.is_empty() {
            problems.push("pipeline.steps must contain at least one step".to_string());
        }
        let finalization = [
            &self.finalization.quality_assurance,
            &self.finalization.security_validation,
            &self.finalization.performance_optimization,
            &self.finalization.deployment_preparation,
        ];
        for step in self
            .pipeline
            .steps
            .iter()
            .chain(finalization.into_iter().flatten())
        {
            if step.command.trim().is_empty() {
                problems.push(format!("step '{}' has an empty command", step.kind));
            }
            if step.timeout_secs == Some(0) {
                problems.push(format!("step '{}' has a zero timeout", step.kind));
            }
        }

        if let Some(cmd) = &self.probe.command
            && cmd.trim().is_empty()
        {
            problems.push("probe.command is empty".to_string());
        }
        if self.probe.timeout_secs == 0 {
            problems.push("probe.timeout_secs must be at least 1".to_string());
        }

        if self.registry.service_timeout_secs == 0 {
            problems.push("registry.service_timeout_secs must be at least 1".to_string());
        }
        if self.registry.probe_timeout_secs == 0 {
            problems.push("registry.probe_timeout_secs must be at least 1".to_string());
        }

        problems
    }

    /// Validate and produce the resolved orchestrator configuration.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, OrchestratorError> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(OrchestratorError::configuration(&problems));
        }
        Ok(self.build())
    }

    fn build(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            max_cycles: o.max_cycles,
            target_issues: o.target_issues,
            execution_mode: o.execution_mode,
            enable_recovery: o.enable_recovery,
            session_dir: o.session_dir.clone(),
            working_dir: o
                .working_dir
                .clone()
                .unwrap_or_else(|| o.session_dir.clone()),
            log_level: self.effective_log_level(),
            timeout_per_cycle: o.timeout_per_cycle,
            initial_batch_size: o.initial_batch_size,
            adaptive_batch_sizing: o.adaptive_batch_sizing,
            cycle_interval_secs: o.cycle_interval_secs,
            grace_period_secs: o.grace_period_secs,
            max_cycle_history: o.max_cycle_history,
            batch: self.batch.clone(),
            recovery: self.recovery.clone(),
            steps: self.pipeline.steps.clone(),
            probe: self.probe.clone(),
            finalization: self.finalization.clone(),
        }
    }

    /// Explicit level, else `debug` in development mode, else `info`.
    pub fn effective_log_level(&self) -> String {
        match &self.orchestrator.log_level {
            Some(level) => level.to_lowercase(),
            None if self.orchestrator.execution_mode == ExecutionMode::Development => {
                "debug".to_string()
            }
            None => "info".to_string(),
        }
    }
}

/// CLI flags that override the file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_cycles: Option<u32>,
    pub target_issues: Option<u64>,
    pub execution_mode: Option<ExecutionMode>,
    pub enable_recovery: Option<bool>,
    pub session_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub timeout_per_cycle: Option<u64>,
    pub initial_batch_size: Option<u32>,
    pub adaptive_batch_sizing: Option<bool>,
    pub registry_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(&self, toml: &mut ConductorToml) {
        let o = &mut toml.orchestrator;
        if let Some(v) = self.max_cycles {
            o.max_cycles = v;
        }
        if let Some(v) = self.target_issues {
            o.target_issues = v;
        }
        if let Some(v) = self.execution_mode {
            o.execution_mode = v;
        }
        if let Some(v) = self.enable_recovery {
            o.enable_recovery = v;
        }
        if let Some(v) = &self.session_dir {
            o.session_dir = v.clone();
        }
        if let Some(v) = &self.log_level {
            o.log_level = Some(v.clone());
        }
        if let Some(v) = self.timeout_per_cycle {
            o.timeout_per_cycle = v;
        }
        if let Some(v) = self.initial_batch_size {
            o.initial_batch_size = v;
        }
        if let Some(v) = self.adaptive_batch_sizing {
            o.adaptive_batch_sizing = v;
        }
        if let Some(v) = &self.registry_dir {
            toml.registry.dir = v.clone();
        }
    }
}

/// Fully resolved orchestrator settings; persisted with every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_cycles: u32,
    pub target_issues: u64,
    pub execution_mode: ExecutionMode,
    pub enable_recovery: bool,
    pub session_dir: PathBuf,
    pub working_dir: PathBuf,
    pub log_level: String,
    pub timeout_per_cycle: u64,
    pub initial_batch_size: u32,
    pub adaptive_batch_sizing: bool,
    pub cycle_interval_secs: u64,
    pub grace_period_secs: u64,
    #[serde(default = "default_max_cycle_history")]
    pub max_cycle_history: usize,
    pub batch: BatchPolicy,
    pub recovery: RecoveryPolicy,
    pub steps: Vec<StepSpec>,
    pub probe: ProbeSection,
    pub finalization: FinalizationSection,
}

impl OrchestratorConfig {
    /// Defaults rooted at `session_dir`, steps run there too.
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        let session_dir = session_dir.into();
        let mut toml = ConductorToml::default();
        toml.orchestrator.session_dir = session_dir.clone();
        toml.orchestrator.working_dir = Some(session_dir);
        toml.build()
    }

    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = steps;
        self
    }

    pub fn validate(&self) -> Vec<String> {
        let toml = ConductorToml {
            orchestrator: OrchestratorSection {
                max_cycles: self.max_cycles,
                target_issues: self.target_issues,
                execution_mode: self.execution_mode,
                enable_recovery: self.enable_recovery,
                session_dir: self.session_dir.clone(),
                working_dir: Some(self.working_dir.clone()),
                log_level: Some(self.log_level.clone()),
                timeout_per_cycle: self.timeout_per_cycle,
                initial_batch_size: self.initial_batch_size,
                adaptive_batch_sizing: self.adaptive_batch_sizing,
                cycle_interval_secs: self.cycle_interval_secs,
                grace_period_secs: self.grace_period_secs,
                max_cycle_history: self.max_cycle_history,
            },
            batch: self.batch.clone(),
            recovery: self.recovery.clone(),
            pipeline: PipelineSection {
                steps: self.steps.clone(),
            },
            probe: self.probe.clone(),
            finalization: self.finalization.clone(),
            registry: RegistryConfig::default(),
        };
        toml.validate()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Whether any step or the recovery coordinator is resolved through the
    /// service registry.
    pub fn uses_registry(&self) -> bool {
        let f = &self.finalization;
        self.recovery.coordinator_capability.is_some()
            || self
                .steps
                .iter()
                .chain(&f.quality_assurance)
                .chain(&f.security_validation)
                .chain(&f.performance_optimization)
                .chain(&f.deployment_preparation)
                .any(|s| s.service_capability.is_some())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}
