//! The cycle orchestrator state machine.
//!
//! ```text
//! INITIALIZING → PROTOCOL_SETUP → ENVIRONMENT_ANALYSIS → PIPELINE_EXECUTION
//!
//! PIPELINE_EXECUTION ──cycle fails──▶ ERROR_RECOVERY ──ok──▶ PIPELINE_EXECUTION
//!                                          └──exhausted──▶ FAILED
//! PIPELINE_EXECUTION ──interval──▶ MONITORING_ACTIVE ──▶ PIPELINE_EXECUTION
//! PIPELINE_EXECUTION ──target / max cycles / single cycle / interrupt──▶ COMPLETED
//!
//! production: PIPELINE_EXECUTION → QUALITY_ASSURANCE → SECURITY_VALIDATION
//!             → PERFORMANCE_OPTIMIZATION → DEPLOYMENT_PREPARATION → COMPLETED
//! ```
//!
//! Steps run strictly one after another. The running flag is read at the top
//! of every iteration and before every step launch, never while a step is in
//! flight. State is persisted after every transition and every cycle, and a
//! final report is written whenever the run reaches a terminal state.

use crate::config::{ExecutionMode, OrchestratorConfig};
use crate::errors::OrchestratorError;
use crate::orchestrator::batch::AdaptiveBatchController;
use crate::orchestrator::persist::{FinalReport, SessionLock, StatePersister, StateSnapshot};
use crate::orchestrator::probe::{CompletionProbe, ProbeContext};
use crate::orchestrator::recovery::{RecoveryHook, RecoveryManager, ServiceReconnect};
use crate::orchestrator::runner::CommandRunner;
use crate::orchestrator::state::{
    Cycle, OrchestratorState, PerformanceMetrics, StateTransition, StopReason,
};
use crate::orchestrator::steps::{StepContext, StepKind, StepOutcome, StepSpec};
use crate::registry::DiscoveryClient;
use crate::util::parse_issue_count;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of the cancellation check while monitoring.
const MONITOR_TICK: Duration = Duration::from_millis(250);

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub final_state: OrchestratorState,
    pub stop_reason: Option<StopReason>,
    pub cycles_run: u32,
    pub report_path: PathBuf,
}

pub struct CycleOrchestrator {
    config: OrchestratorConfig,
    session_id: String,
    started_at: DateTime<Utc>,
    state: OrchestratorState,
    history: Vec<StateTransition>,
    metrics: PerformanceMetrics,
    cycles: Vec<Cycle>,
    batch: AdaptiveBatchController,
    recovery: RecoveryManager,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn CompletionProbe>,
    discovery: Option<DiscoveryClient>,
    persister: StatePersister,
    running: Arc<AtomicBool>,
    is_running: bool,
    stop_reason: Option<StopReason>,
    last_scan: Option<u64>,
}

impl CycleOrchestrator {
    /// A fresh session. Invalid configuration is rejected here, before any
    /// state is written.
    pub fn new(
        config: OrchestratorConfig,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn CompletionProbe>,
    ) -> Result<Self, OrchestratorError> {
        let mut problems = config.validate();
        if !config.working_dir.is_dir() {
            problems.push(format!(
                "working directory {} does not exist",
                config.working_dir.display()
            ));
        }
        if !problems.is_empty() {
            return Err(OrchestratorError::configuration(&problems));
        }

        let started_at = Utc::now();
        let batch = AdaptiveBatchController::new(
            config.batch.clone(),
            config.initial_batch_size,
            config.adaptive_batch_sizing,
        );
        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            state: OrchestratorState::Initializing,
            history: vec![StateTransition {
                state: OrchestratorState::Initializing,
                timestamp: started_at,
            }],
            metrics: PerformanceMetrics::new(batch.current()),
            cycles: Vec::new(),
            recovery: RecoveryManager::new(config.recovery.clone()),
            batch,
            runner,
            probe,
            discovery: None,
            persister: StatePersister::new(&config.session_dir),
            running: Arc::new(AtomicBool::new(true)),
            is_running: false,
            stop_reason: None,
            last_scan: None,
            config,
        })
    }

    /// Rebuild an orchestrator from a snapshot without checking whether the
    /// session can continue.
    pub fn restore(
        snapshot: StateSnapshot,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn CompletionProbe>,
    ) -> Result<Self, OrchestratorError> {
        let mut orch = Self::new(snapshot.config, runner, probe)?;
        orch.session_id = snapshot.session_id;
        orch.started_at = snapshot.started_at;
        orch.state = snapshot.current_state;
        orch.history = snapshot.state_history;
        orch.batch
            .reset_to(snapshot.performance_metrics.adaptive_batch_size);
        orch.metrics = snapshot.performance_metrics;
        orch.recovery.restore(snapshot.recovery_attempts);
        orch.cycles = snapshot.cycles;
        orch.stop_reason = snapshot.stop_reason;
        orch.last_scan = orch.metrics.issues_remaining;
        Ok(orch)
    }

    /// Continue a persisted session. Terminated sessions cannot be resumed.
    pub fn resume(
        snapshot: StateSnapshot,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn CompletionProbe>,
    ) -> Result<Self, OrchestratorError> {
        if !snapshot.is_resumable() {
            return Err(OrchestratorError::Configuration(format!(
                "session {} stopped in {} and cannot be resumed",
                snapshot.session_id, snapshot.current_state
            )));
        }
        let orch = Self::restore(snapshot, runner, probe)?;
        tracing::info!(
            component = "orchestrator",
            session_id = %orch.session_id,
            state = %orch.state,
            cycles = orch.metrics.total_cycles,
            "Resuming session"
        );
        Ok(orch)
    }

    /// Resolve `service_capability` steps and coordinator recovery through
    /// this discovery client.
    pub fn with_discovery(mut self, discovery: DiscoveryClient) -> Self {
        if let Some(capability) = self.config.recovery.coordinator_capability.clone() {
            let hook = Arc::new(ServiceReconnect::new(discovery.clone(), capability));
            self.recovery = self.recovery.with_hook(hook);
        }
        self.discovery = Some(discovery);
        self
    }

    pub fn with_recovery_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = self.recovery.with_hook(hook);
        self
    }

    /// Share a running flag with a signal handler; clearing it requests a
    /// graceful stop.
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn cycles(&self) -> &[Cycle] {
        &self.cycles
    }

    pub fn batch_size(&self) -> u32 {
        self.batch.current()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery.attempts()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            current_state: self.state,
            state_history: self.history.clone(),
            config: self.config.clone(),
            performance_metrics: self.metrics.clone(),
            recovery_attempts: self.recovery.attempts(),
            is_running: self.is_running,
            cycles: self.cycles.clone(),
            stop_reason: self.stop_reason,
        }
    }

    /// Keep only the most recent `max_cycle_history` cycle records.
    fn push_cycle(&mut self, cycle: Cycle) {
        self.cycles.push(cycle);
        let keep = self.config.max_cycle_history.max(1);
        if self.cycles.len() > keep {
            self.cycles.drain(..self.cycles.len() - keep);
        }
    }

    fn persist(&self) -> Result<(), OrchestratorError> {
        self.persister.save(&self.snapshot())
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn transition(&mut self, next: OrchestratorState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.record_transition(next);
        self.persist()
    }

    fn record_transition(&mut self, next: OrchestratorState) {
        let now = Utc::now();
        let timestamp = self
            .history
            .last()
            .map_or(now, |last| now.max(last.timestamp));
        tracing::info!(
            component = "orchestrator",
            from = %self.state,
            to = %next,
            timestamp = %timestamp.to_rfc3339(),
            "State transition"
        );
        self.state = next;
        self.history.push(StateTransition {
            state: next,
            timestamp,
        });
    }

    fn finish(
        &mut self,
        state: OrchestratorState,
        reason: StopReason,
    ) -> Result<(), OrchestratorError> {
        self.stop_reason = Some(reason);
        self.transition(state)
    }

    /// Drive the session to a terminal state and write the final report.
    ///
    /// The report is written even when the loop itself errors; that error is
    /// returned after the report.
    pub async fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        let _lock = SessionLock::acquire(&self.config.session_dir)?;
        if self.state.is_terminal() {
            return Err(OrchestratorError::Configuration(format!(
                "session {} already ended in {}",
                self.session_id, self.state
            )));
        }

        self.is_running = true;
        tracing::info!(
            component = "orchestrator",
            session_id = %self.session_id,
            mode = %self.config.execution_mode,
            max_cycles = self.config.max_cycles,
            target_issues = self.config.target_issues,
            "Orchestrator starting"
        );

        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            tracing::error!(component = "orchestrator", error = %e, "Orchestrator aborted");
            if !self.state.is_terminal() {
                self.record_transition(OrchestratorState::Failed);
            }
        }

        self.is_running = false;
        let saved = self.persist();
        let report = FinalReport::from_snapshot(&self.snapshot(), Utc::now());
        let written = self.persister.write_report(&report);

        outcome?;
        saved?;
        let report_path = written?;
        tracing::info!(
            component = "orchestrator",
            final_state = %self.state,
            stop_reason = ?self.stop_reason,
            cycles = self.metrics.total_cycles,
            success_rate = self.metrics.success_rate,
            report = %report_path.display(),
            "Orchestrator finished"
        );
        Ok(RunSummary {
            session_id: self.session_id.clone(),
            final_state: self.state,
            stop_reason: self.stop_reason,
            cycles_run: self.metrics.total_cycles,
            report_path,
        })
    }

    async fn drive(&mut self) -> Result<(), OrchestratorError> {
        if self.state == OrchestratorState::Initializing {
            self.transition(OrchestratorState::ProtocolSetup)?;
            self.protocol_setup().await?;
        }
        if self.state == OrchestratorState::ProtocolSetup {
            self.transition(OrchestratorState::EnvironmentAnalysis)?;
            self.analyze_environment().await;
        }
        if matches!(
            self.state,
            OrchestratorState::EnvironmentAnalysis
                | OrchestratorState::ErrorRecovery
                | OrchestratorState::MonitoringActive
        ) {
            self.transition(OrchestratorState::PipelineExecution)?;
        }

        loop {
            if !self.should_continue() {
                return self.finish(OrchestratorState::Completed, StopReason::Interrupted);
            }
            if self.metrics.total_cycles >= self.config.max_cycles {
                return self.conclude(StopReason::MaxCycles).await;
            }

            let cycle = self.run_cycle().await;
            let (success, interrupted, duration) = (cycle.success, cycle.interrupted, cycle.duration);
            if interrupted {
                self.metrics.record_interrupted(duration);
            } else {
                self.metrics.record_cycle(success, duration);
                self.batch.observe(success, duration);
            }
            self.metrics.adaptive_batch_size = self.batch.current();
            self.push_cycle(cycle);
            self.persist()?;

            if interrupted {
                return self.finish(OrchestratorState::Completed, StopReason::Interrupted);
            }

            if success {
                self.recovery.record_success();
                if self.target_reached().await {
                    return self.conclude(StopReason::TargetReached).await;
                }
            } else if !self.config.enable_recovery {
                return self.finish(OrchestratorState::Failed, StopReason::CycleFailed);
            } else {
                self.transition(OrchestratorState::ErrorRecovery)?;
                match self.recovery.attempt(&mut self.batch).await {
                    Ok(_) => {
                        self.metrics.adaptive_batch_size = self.batch.current();
                        self.transition(OrchestratorState::PipelineExecution)?;
                    }
                    Err(e) => {
                        tracing::error!(component = "recovery", error = %e, "Giving up");
                        return self.finish(OrchestratorState::Failed, StopReason::RecoveryExhausted);
                    }
                }
            }

            if self.config.execution_mode == ExecutionMode::SingleCycle {
                return self.finish(OrchestratorState::Completed, StopReason::SingleCycle);
            }
            if self.metrics.total_cycles < self.config.max_cycles
                && self.config.cycle_interval_secs > 0
            {
                self.monitor().await?;
            }
        }
    }

    /// Loop ended normally: finalize in production mode, otherwise complete.
    async fn conclude(&mut self, reason: StopReason) -> Result<(), OrchestratorError> {
        if self.config.execution_mode == ExecutionMode::Production {
            return self.finalize(reason).await;
        }
        self.finish(OrchestratorState::Completed, reason)
    }

    async fn protocol_setup(&mut self) -> Result<(), OrchestratorError> {
        std::fs::create_dir_all(self.persister.reports_dir()).map_err(|source| {
            OrchestratorError::PersistFailed {
                path: self.persister.reports_dir(),
                source,
            }
        })?;
        let needed: Vec<&str> = self
            .config
            .steps
            .iter()
            .filter_map(|s| s.service_capability.as_deref())
            .collect();
        match &self.discovery {
            Some(discovery) => {
                for capability in needed {
                    if discovery.find_service(capability, true).await.is_none() {
                        tracing::warn!(
                            component = "orchestrator",
                            capability,
                            "No provider registered yet for step capability"
                        );
                    }
                }
            }
            None if !needed.is_empty() => tracing::warn!(
                component = "orchestrator",
                capabilities = ?needed,
                "Steps name service capabilities but no registry is configured"
            ),
            None => {}
        }
        Ok(())
    }

    async fn analyze_environment(&mut self) {
        let ctx = ProbeContext {
            session_id: &self.session_id,
            session_dir: &self.config.session_dir,
            working_dir: &self.config.working_dir,
            last_scan: self.last_scan,
        };
        let reading = self.probe.issues_remaining(&ctx).await;
        match reading {
            Ok(Some(n)) => {
                tracing::info!(component = "orchestrator", issues_remaining = n, "Baseline issue count");
                self.metrics.issues_remaining = Some(n);
            }
            Ok(None) => {
                tracing::debug!(component = "orchestrator", "No baseline issue count available");
            }
            Err(e) => {
                tracing::warn!(component = "orchestrator", error = %e, "Baseline probe failed");
            }
        }
    }

    async fn target_reached(&mut self) -> bool {
        let ctx = ProbeContext {
            session_id: &self.session_id,
            session_dir: &self.config.session_dir,
            working_dir: &self.config.working_dir,
            last_scan: self.last_scan,
        };
        let reading = self.probe.issues_remaining(&ctx).await;
        match reading {
            Ok(Some(n)) => {
                self.metrics.issues_remaining = Some(n);
                tracing::info!(
                    component = "orchestrator",
                    issues_remaining = n,
                    target = self.config.target_issues,
                    "Completion probe"
                );
                n <= self.config.target_issues
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(component = "orchestrator", error = %e, "Completion probe failed");
                false
            }
        }
    }

    async fn monitor(&mut self) -> Result<(), OrchestratorError> {
        self.transition(OrchestratorState::MonitoringActive)?;
        let deadline = Instant::now() + self.config.cycle_interval();
        while self.should_continue() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(MONITOR_TICK.min(deadline - now)).await;
        }
        self.transition(OrchestratorState::PipelineExecution)
    }

    async fn run_cycle(&mut self) -> Cycle {
        let index = self.metrics.total_cycles + 1;
        let batch_size = self.batch.current();
        let started_at = Utc::now();
        let start = Instant::now();
        self.last_scan = None;
        tracing::info!(component = "orchestrator", cycle = index, batch_size, "Cycle starting");

        let mut outcomes = Vec::with_capacity(self.config.steps.len());
        let mut interrupted = false;
        let steps = self.config.steps.clone();
        for step in &steps {
            if !self.should_continue() {
                interrupted = true;
                tracing::warn!(
                    component = "orchestrator",
                    cycle = index,
                    next_step = %step.kind,
                    "Interrupted; not launching further steps"
                );
                break;
            }
            let (outcome, issue_count) = self.run_step(step, index, batch_size).await;
            if let Some(n) = issue_count {
                self.last_scan = Some(n);
                self.metrics.issues_remaining = Some(n);
            }
            let hard_failure = !outcome.ok;
            outcomes.push(outcome);
            if hard_failure {
                break;
            }
        }

        let duration = start.elapsed();
        let success = outcomes.iter().all(|o| o.ok);
        tracing::info!(
            component = "orchestrator",
            cycle = index,
            success,
            interrupted,
            duration_ms = duration.as_millis() as u64,
            "Cycle finished"
        );
        Cycle {
            index,
            started_at,
            ended_at: Utc::now(),
            batch_size,
            steps: outcomes,
            duration,
            success,
            interrupted,
        }
    }

    /// Run one step. The second value is the issue count printed by a
    /// successful scan step.
    async fn run_step(&self, step: &StepSpec, cycle: u32, batch_size: u32) -> (StepOutcome, Option<u64>) {
        let started_at = Utc::now();

        let service_url = match &step.service_capability {
            Some(capability) => match self.resolve_service(capability).await {
                Some(url) => Some(url),
                None => {
                    let outcome = StepOutcome::from_fault(
                        step,
                        started_at,
                        format!("no provider for capability '{}'", capability),
                    );
                    log_step(&outcome, cycle);
                    return (outcome, None);
                }
            },
            None => None,
        };

        let ctx = StepContext {
            session_id: &self.session_id,
            session_dir: &self.config.session_dir,
            working_dir: &self.config.working_dir,
            cycle,
            batch_size,
            timeout_ceiling_secs: self.config.timeout_per_cycle,
            service_url: service_url.as_deref(),
        };
        let command = step.to_command(&ctx);
        tracing::debug!(
            component = "orchestrator",
            step = %step.kind,
            command = %command.display(),
            timeout_secs = command.timeout.as_secs(),
            "Launching step"
        );

        let (outcome, issue_count) = match self.runner.run(&command).await {
            Ok(output) => {
                let issue_count = if step.kind == StepKind::Scan && output.exited_cleanly() {
                    parse_issue_count(&output.stdout)
                } else {
                    None
                };
                let outcome = StepOutcome::from_process(
                    step,
                    started_at,
                    output,
                    command.timeout,
                    self.config.execution_mode.keeps_full_output(),
                );
                (outcome, issue_count)
            }
            Err(e) => (
                StepOutcome::from_fault(step, started_at, format!("{:#}", e)),
                None,
            ),
        };
        log_step(&outcome, cycle);
        (outcome, issue_count)
    }

    async fn resolve_service(&self, capability: &str) -> Option<String> {
        let discovery = self.discovery.as_ref()?;
        discovery
            .find_service(capability, true)
            .await
            .map(|service| discovery.service_url(&service))
    }

    async fn finalize(&mut self, reason: StopReason) -> Result<(), OrchestratorError> {
        let stages = [
            (
                OrchestratorState::QualityAssurance,
                self.config.finalization.quality_assurance.clone(),
            ),
            (
                OrchestratorState::SecurityValidation,
                self.config.finalization.security_validation.clone(),
            ),
            (
                OrchestratorState::PerformanceOptimization,
                self.config.finalization.performance_optimization.clone(),
            ),
            (
                OrchestratorState::DeploymentPreparation,
                self.config.finalization.deployment_preparation.clone(),
            ),
        ];
        let cycle = self.metrics.total_cycles;
        let batch_size = self.batch.current();

        for (stage, steps) in stages {
            if !self.should_continue() {
                return self.finish(OrchestratorState::Completed, StopReason::Interrupted);
            }
            self.transition(stage)?;
            for step in &steps {
                if !self.should_continue() {
                    return self.finish(OrchestratorState::Completed, StopReason::Interrupted);
                }
                let (outcome, _) = self.run_step(step, cycle, batch_size).await;
                if !outcome.ok {
                    tracing::error!(
                        component = "orchestrator",
                        stage = %stage,
                        detail = %outcome.detail,
                        "Finalization step failed"
                    );
                    return self.finish(OrchestratorState::Failed, StopReason::FinalizationFailed);
                }
            }
        }
        self.finish(OrchestratorState::Completed, reason)
    }
}

/// Hard failures at error, soft failures at warn, successes at info.
fn log_step(outcome: &StepOutcome, cycle: u32) {
    let duration_ms = outcome.duration.as_millis() as u64;
    if !outcome.ok {
        tracing::error!(
            component = "orchestrator",
            cycle,
            step = %outcome.kind,
            duration_ms,
            exit_code = ?outcome.exit_code,
            detail = %outcome.detail,
            "Step failed"
        );
    } else if outcome.soft_failure {
        tracing::warn!(
            component = "orchestrator",
            cycle,
            step = %outcome.kind,
            duration_ms,
            exit_code = ?outcome.exit_code,
            detail = %outcome.detail,
            "Informational step failed"
        );
    } else {
        tracing::info!(
            component = "orchestrator",
            cycle,
            step = %outcome.kind,
            duration_ms,
            "Step succeeded"
        );
    }
}
