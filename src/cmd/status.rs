//! `conductor status`.

use anyhow::Result;
use conductor::orchestrator::persist::StatePersister;
use std::path::Path;

use super::super::Cli;

pub fn cmd_status(cli: &Cli, cwd: &Path, session_dir: Option<&Path>, json: bool) -> Result<()> {
    let session_dir = match session_dir {
        Some(dir) => cwd.join(dir),
        None => super::load_config(cli, cwd)?.toml.orchestrator.session_dir,
    };
    let persister = StatePersister::new(&session_dir);

    let Some(snapshot) = persister.load()? else {
        println!("No session found in {}", session_dir.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let m = &snapshot.performance_metrics;
    println!();
    println!("{}", console::style("Conductor Session").bold().cyan());
    println!("  Session:       {}", snapshot.session_id);
    println!(
        "  Started:       {}",
        snapshot.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  State:         {}", snapshot.current_state);
    println!(
        "  Running:       {}",
        if snapshot.is_running { "yes" } else { "no" }
    );
    if let Some(reason) = snapshot.stop_reason {
        println!("  Stop reason:   {}", reason);
    }
    println!(
        "  Cycles:        {} ({} ok, {} failed, {} interrupted)",
        m.total_cycles, m.successful_cycles, m.failed_cycles, m.interrupted_cycles
    );
    println!("  Avg duration:  {:.1}s", m.average_cycle_duration_secs);
    println!("  Batch size:    {}", m.adaptive_batch_size);
    println!(
        "  Recoveries:    {}/{}",
        snapshot.recovery_attempts, snapshot.config.recovery.max_recovery_attempts
    );
    if let Some(issues) = m.issues_remaining {
        println!("  Issues left:   {}", issues);
    }

    if let Some(cycle) = snapshot.cycles.last() {
        println!();
        println!("Last cycle (#{}):", cycle.index);
        for step in &cycle.steps {
            let marker = if !step.ok {
                console::style("✗").red()
            } else if step.soft_failure {
                console::style("!").yellow()
            } else {
                console::style("✓").green()
            };
            println!(
                "  {} {:<14} {:>6}ms  {}",
                marker,
                step.kind.as_str(),
                step.duration.as_millis(),
                step.detail
            );
        }
    }

    let reports = persister.list_reports()?;
    if let Some(latest) = reports.last() {
        println!();
        println!("Latest report: {}", latest.display());
    }
    if snapshot.is_resumable() && !snapshot.is_running {
        println!();
        println!("Resume with `conductor run --resume`.");
    }
    println!();
    Ok(())
}
