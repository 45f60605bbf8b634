//! Integration tests for conductor
//!
//! These drive the binary end to end with small shell scripts standing in for
//! the scanner, fixer and test tools.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn conductor() -> Command {
    cargo_bin_cmd!("conductor")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write an executable shell script into `dir` and return its path.
#[cfg(unix)]
fn create_test_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn session_dir(dir: &TempDir) -> PathBuf {
    dir.path().join(".conductor/session")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conductor_help() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("registry"));
    }

    #[test]
    fn test_conductor_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_status_without_session() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No session found"));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["run", "--mode", "turbo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid execution mode"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No conductor.toml found"))
            .stdout(predicate::str::contains("max_cycles = 10"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        let content = fs::read_to_string(dir.path().join("conductor.toml")).unwrap();
        assert!(content.contains("[orchestrator]"));
        assert!(content.contains("issue-scanner"));
    }

    #[test]
    fn test_config_init_keeps_existing_file() {
        let dir = create_temp_project();
        fs::write(dir.path().join("conductor.toml"), "# mine\n").unwrap();
        conductor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        assert_eq!(
            fs::read_to_string(dir.path().join("conductor.toml")).unwrap(),
            "# mine\n"
        );
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));
    }

    #[test]
    fn test_config_validate_reports_every_problem() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("conductor.toml"),
            r#"
[orchestrator]
max_cycles = 0
timeout_per_cycle = 0
"#,
        )
        .unwrap();
        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("max_cycles"))
            .stdout(predicate::str::contains("timeout_per_cycle"));
    }

    #[test]
    fn test_config_env_override_is_shown() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .env("CONDUCTOR_MAX_CYCLES", "42")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_cycles = 42"));
    }

    #[test]
    fn test_run_rejects_invalid_config() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["run", "--max-cycles", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("max_cycles"));
        assert!(!session_dir(&dir).join("orchestrator_state.json").exists());
    }
}

// =============================================================================
// Orchestrator Runs
// =============================================================================

#[cfg(unix)]
mod runs {
    use super::*;

    /// A project whose pipeline is `scan.sh` then `fix.sh {batch_size}`.
    fn project(scan_body: &str, fix_body: &str, extra: &str) -> TempDir {
        let dir = create_temp_project();
        let scan = create_test_script(dir.path(), "scan.sh", scan_body);
        let fix = create_test_script(dir.path(), "fix.sh", fix_body);
        fs::write(
            dir.path().join("conductor.toml"),
            format!(
                r#"
[orchestrator]
max_cycles = 3
{extra}

[[pipeline.steps]]
kind = "scan"
command = "{scan}"

[[pipeline.steps]]
kind = "apply-fixes"
command = "{fix}"
args = ["{{batch_size}}"]
"#,
                extra = extra,
                scan = scan.display(),
                fix = fix.display(),
            ),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_single_cycle_run_persists_state_and_report() {
        let dir = project(
            r#"echo '{"issues_remaining": 4}'"#,
            r#"echo "$1" >> "$(dirname "$0")/batches.txt""#,
            "",
        );
        conductor()
            .current_dir(dir.path())
            .args(["run", "--mode", "single_cycle"])
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETED"))
            .stdout(predicate::str::contains("single_cycle"));

        let batches = fs::read_to_string(dir.path().join("batches.txt")).unwrap();
        assert_eq!(batches.trim(), "10");

        let state: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(session_dir(&dir).join("orchestrator_state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state["current_state"], "COMPLETED");
        assert_eq!(state["is_running"], false);
        assert_eq!(state["performance_metrics"]["issues_remaining"], 4);
        assert_eq!(state["performance_metrics"]["adaptive_batch_size"], 12);

        let reports: Vec<_> = fs::read_dir(session_dir(&dir).join("reports"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(session_dir(&dir).join("logs/conductor.log").exists());
    }

    #[test]
    fn test_target_reached_stops_early() {
        let dir = project(r#"echo '{"issues": []}'"#, "exit 0", "");
        conductor()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("target_reached"))
            .stdout(predicate::str::contains("Cycles:        1"));
    }

    #[test]
    fn test_failed_cycle_without_recovery_exits_nonzero() {
        let dir = project("echo 3", "exit 2", "");
        conductor()
            .current_dir(dir.path())
            .args(["run", "--no-recovery"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("FAILED"))
            .stderr(predicate::str::contains("cycle_failed"));
    }

    #[test]
    fn test_recovery_exhaustion_fails_the_run() {
        let dir = project("echo 3", "exit 1", "");
        conductor()
            .current_dir(dir.path())
            .args(["run", "--max-cycles", "10"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("recovery_exhausted"));

        let state: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(session_dir(&dir).join("orchestrator_state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(state["recovery_attempts"], 3);
        assert_eq!(state["performance_metrics"]["total_cycles"], 4);
    }

    #[test]
    fn test_status_after_run() {
        let dir = project("echo 5", "exit 0", "");
        conductor()
            .current_dir(dir.path())
            .args(["run", "--max-cycles", "2"])
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETED"))
            .stdout(predicate::str::contains("max_cycles"))
            .stdout(predicate::str::contains("Latest report"));

        let output = conductor()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .output()
            .unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(snapshot["performance_metrics"]["total_cycles"], 2);
    }

    #[test]
    fn test_resume_terminated_session_is_rejected() {
        let dir = project("echo 5", "exit 0", "");
        conductor()
            .current_dir(dir.path())
            .args(["run", "--mode", "single_cycle"])
            .assert()
            .success();
        conductor()
            .current_dir(dir.path())
            .args(["run", "--resume"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be resumed"));
    }

    #[test]
    fn test_resume_without_session_fails() {
        let dir = project("echo 5", "exit 0", "");
        conductor()
            .current_dir(dir.path())
            .args(["run", "--resume"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No session to resume"));
    }

    #[test]
    fn test_json_log_format() {
        let dir = project("echo 5", "exit 0", "");
        conductor()
            .current_dir(dir.path())
            .args(["--log-format", "json", "run", "--mode", "single_cycle"])
            .assert()
            .success()
            .stderr(predicate::str::contains(r#""message":"State transition""#));
    }
}

// =============================================================================
// Registry
// =============================================================================

mod registry {
    use super::*;

    #[test]
    fn test_list_empty_registry() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["registry", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No services registered"));
    }

    #[test]
    fn test_list_json_empty_registry() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["registry", "list", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn test_sweep_empty_registry() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .args(["registry", "sweep"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Checked 0 service(s)"));
    }

    #[test]
    fn test_corrupt_registry_is_reported() {
        let dir = create_temp_project();
        let registry_dir = dir.path().join(".conductor/registry");
        fs::create_dir_all(&registry_dir).unwrap();
        fs::write(registry_dir.join("services.json"), "{not json").unwrap();
        conductor()
            .current_dir(dir.path())
            .args(["registry", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("corrupt"));
    }
}
