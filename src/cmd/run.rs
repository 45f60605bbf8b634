//! `conductor run`.

use anyhow::{Context, Result};
use conductor::config::{OrchestratorConfig, Overrides, RegistryConfig};
use conductor::logging;
use conductor::orchestrator::persist::StatePersister;
use conductor::orchestrator::{
    CompletionProbe, CycleOrchestrator, OrchestratorState, RunSummary, SubprocessRunner, probe,
};
use conductor::registry::{DiscoveryClient, ServiceRegistry};
use conductor::shutdown::spawn_interrupt_watcher;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::super::{Cli, RunArgs};

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            max_cycles: self.max_cycles,
            target_issues: self.target_issues,
            execution_mode: self.mode,
            enable_recovery: self.no_recovery.then_some(false),
            session_dir: self.session_dir.clone(),
            log_level: self.log_level.clone(),
            timeout_per_cycle: self.timeout_per_cycle,
            initial_batch_size: self.batch_size,
            adaptive_batch_sizing: self.no_adaptive.then_some(false),
            registry_dir: self.registry_dir.clone(),
        }
    }
}

/// Open the registry only when the resolved config will consult it.
fn discovery_for(
    config: &OrchestratorConfig,
    registry: &RegistryConfig,
) -> Result<Option<DiscoveryClient>> {
    if !config.uses_registry() {
        return Ok(None);
    }
    let registry = ServiceRegistry::open(registry)
        .with_context(|| format!("Failed to open registry at {}", registry.dir.display()))?;
    Ok(Some(DiscoveryClient::new(registry)))
}

pub async fn cmd_run(cli: &Cli, cwd: &Path, args: &RunArgs) -> Result<()> {
    let mut loaded = super::load_config(cli, cwd)?;
    args.overrides().apply(&mut loaded.toml);
    loaded.toml.resolve_paths(cwd);
    let toml = loaded.toml;

    let session_dir = toml.orchestrator.session_dir.clone();
    let _log_guard = logging::init(
        &super::log_level(cli, &toml),
        cli.log_format,
        Some(&session_dir.join("logs")),
    )?;
    for problem in &loaded.env_problems {
        tracing::warn!(component = "config", "{}", problem);
    }
    if loaded.exists {
        tracing::debug!(component = "config", path = %loaded.path.display(), "Loaded configuration");
    }

    // A resumed session keeps the settings it was started with.
    let snapshot = if args.resume {
        let snapshot = StatePersister::new(&session_dir)
            .load()?
            .with_context(|| format!("No session to resume in {}", session_dir.display()))?;
        Some(snapshot)
    } else {
        None
    };
    let config = match &snapshot {
        Some(snapshot) => snapshot.config.clone(),
        None => toml.orchestrator_config()?,
    };
    let runner = Arc::new(SubprocessRunner::new().with_grace_period(config.grace_period()));
    let completion: Arc<dyn CompletionProbe> = probe::from_config(&config.probe, runner.clone());

    let mut orchestrator = match snapshot {
        Some(snapshot) => CycleOrchestrator::resume(snapshot, runner, completion)?,
        None => CycleOrchestrator::new(config, runner, completion)?,
    };
    if let Some(discovery) = discovery_for(orchestrator.config(), &toml.registry)? {
        orchestrator = orchestrator.with_discovery(discovery);
    }

    let running = Arc::new(AtomicBool::new(true));
    let watcher = spawn_interrupt_watcher(running.clone());
    let mut orchestrator = orchestrator.with_running_flag(running);

    let result = orchestrator.run().await;
    watcher.abort();
    let summary = result?;
    print_summary(&summary, &orchestrator);

    if summary.final_state == OrchestratorState::Failed {
        anyhow::bail!(
            "Run {} failed ({})",
            summary.session_id,
            summary
                .stop_reason
                .map_or_else(|| "unknown".to_string(), |r| r.to_string())
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, orchestrator: &CycleOrchestrator) {
    let metrics = orchestrator.metrics();
    let state = match summary.final_state {
        OrchestratorState::Completed => console::style(summary.final_state.as_str()).green().bold(),
        _ => console::style(summary.final_state.as_str()).red().bold(),
    };
    println!();
    println!("{}", console::style("Conductor Run Summary").bold().cyan());
    println!("  Session:       {}", summary.session_id);
    println!("  Final state:   {}", state);
    if let Some(reason) = summary.stop_reason {
        println!("  Stop reason:   {}", reason);
    }
    println!(
        "  Cycles:        {} ({} ok, {} failed, {} interrupted)",
        metrics.total_cycles,
        metrics.successful_cycles,
        metrics.failed_cycles,
        metrics.interrupted_cycles
    );
    println!("  Success rate:  {:.0}%", metrics.success_rate * 100.0);
    println!("  Batch size:    {}", metrics.adaptive_batch_size);
    if let Some(issues) = metrics.issues_remaining {
        println!("  Issues left:   {}", issues);
    }
    println!("  Report:        {}", summary.report_path.display());
    println!();
}
