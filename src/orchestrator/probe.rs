//! Completion probes: how the orchestrator learns how many issues remain.

use crate::config::ProbeSection;
use crate::orchestrator::runner::{CommandRunner, CommandSpec};
use crate::util::parse_issue_count;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What a probe may look at.
#[derive(Debug, Clone)]
pub struct ProbeContext<'a> {
    pub session_id: &'a str,
    pub session_dir: &'a Path,
    pub working_dir: &'a Path,
    /// Count parsed from the last scan step's stdout, if any
    pub last_scan: Option<u64>,
}

/// Reports the number of outstanding issues. `Ok(None)` means unknown, which
/// never counts as complete.
#[async_trait]
pub trait CompletionProbe: Send + Sync {
    async fn issues_remaining(&self, ctx: &ProbeContext<'_>) -> Result<Option<u64>>;
}

/// Runs a dedicated command and parses its stdout.
pub struct CommandProbe {
    runner: Arc<dyn CommandRunner>,
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            command: command.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl CompletionProbe for CommandProbe {
    async fn issues_remaining(&self, ctx: &ProbeContext<'_>) -> Result<Option<u64>> {
        let args = self
            .args
            .iter()
            .map(|a| a.replace("{session_dir}", &ctx.session_dir.to_string_lossy()));
        let spec = CommandSpec::new(&self.command, ctx.working_dir)
            .with_args(args)
            .with_timeout(self.timeout)
            .with_env("CONDUCTOR_SESSION_ID", ctx.session_id);
        let output = self.runner.run(&spec).await?;
        if output.timed_out {
            bail!(
                "Completion probe '{}' timed out after {}s",
                spec.display(),
                self.timeout.as_secs()
            );
        }
        if !output.exited_cleanly() {
            bail!(
                "Completion probe '{}' exited with code {:?}",
                spec.display(),
                output.exit_code
            );
        }
        let count = parse_issue_count(&output.stdout);
        if count.is_none() {
            tracing::warn!(
                component = "probe",
                command = %spec.display(),
                "Completion probe output had no issue count"
            );
        }
        Ok(count)
    }
}

/// Uses the count the scan step printed during the cycle.
pub struct ScanOutputProbe;

#[async_trait]
impl CompletionProbe for ScanOutputProbe {
    async fn issues_remaining(&self, ctx: &ProbeContext<'_>) -> Result<Option<u64>> {
        Ok(ctx.last_scan)
    }
}

/// The probe described by `[probe]`: a command when one is configured,
/// otherwise the scan step's output.
pub fn from_config(section: &ProbeSection, runner: Arc<dyn CommandRunner>) -> Arc<dyn CompletionProbe> {
    match &section.command {
        Some(command) => Arc::new(CommandProbe::new(
            runner,
            command.clone(),
            section.args.clone(),
            Duration::from_secs(section.timeout_secs),
        )),
        None => Arc::new(ScanOutputProbe),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::runner::SubprocessRunner;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn ctx(dir: &Path, last_scan: Option<u64>) -> ProbeContext<'_> {
        ProbeContext {
            session_id: "s",
            session_dir: dir,
            working_dir: dir,
            last_scan,
        }
    }

    fn probe_for(script: &Path) -> CommandProbe {
        CommandProbe::new(
            Arc::new(SubprocessRunner::new()),
            script.to_string_lossy().to_string(),
            Vec::new(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_command_probe_parses_json() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "probe.sh",
            "#!/bin/sh\necho '{\"issues_remaining\": 3}'\n",
        );
        let count = probe_for(&script)
            .issues_remaining(&ctx(dir.path(), None))
            .await
            .unwrap();
        assert_eq!(count, Some(3));
    }

    #[tokio::test]
    async fn test_command_probe_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let script = create_test_script(dir.path(), "probe.sh", "#!/bin/sh\nexit 4\n");
        let err = probe_for(&script)
            .issues_remaining(&ctx(dir.path(), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with code"));
    }

    #[tokio::test]
    async fn test_command_probe_unparseable_is_unknown() {
        let dir = tempdir().unwrap();
        let script = create_test_script(dir.path(), "probe.sh", "#!/bin/sh\necho clean\n");
        let count = probe_for(&script)
            .issues_remaining(&ctx(dir.path(), None))
            .await
            .unwrap();
        assert_eq!(count, None);
    }

    #[tokio::test]
    async fn test_scan_output_probe_echoes_last_scan() {
        let dir = tempdir().unwrap();
        let probe = ScanOutputProbe;
        assert_eq!(
            probe.issues_remaining(&ctx(dir.path(), Some(9))).await.unwrap(),
            Some(9)
        );
        assert_eq!(
            probe.issues_remaining(&ctx(dir.path(), None)).await.unwrap(),
            None
        );
    }
}
