//! Pipeline step kinds, their configuration and their outcomes.
//!
//! The step set is closed: a cycle is an ordered list of [`StepSpec`]s, each
//! tagged with one [`StepKind`]. Unknown kinds are rejected when the config is
//! parsed, not when the step would run.

use crate::errors::StepFailure;
use crate::orchestrator::runner::{CommandSpec, ProcessOutput};
use crate::orchestrator::state::duration_serde;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Output kept per step outside development mode.
pub const OUTPUT_EXCERPT_BYTES: usize = 4096;

/// The kinds of step a pipeline can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Issue scanner; prints the current issue count
    Scan,
    /// Fix application; consumes the batch size
    ApplyFixes,
    SecurityScan,
    RunTests,
    Benchmark,
    Package,
}

impl StepKind {
    pub fn all() -> &'static [StepKind] {
        &[
            StepKind::Scan,
            StepKind::ApplyFixes,
            StepKind::SecurityScan,
            StepKind::RunTests,
            StepKind::Benchmark,
            StepKind::Package,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Scan => "scan",
            StepKind::ApplyFixes => "apply-fixes",
            StepKind::SecurityScan => "security-scan",
            StepKind::RunTests => "run-tests",
            StepKind::Benchmark => "benchmark",
            StepKind::Package => "package",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub kind: StepKind,
    /// Program to execute (looked up on PATH when not a path)
    pub command: String,
    /// Arguments; `{batch_size}`, `{session_dir}`, `{cycle}` and
    /// `{service_url}` are substituted before launch.
    #[serde(default)]
    pub args: Vec<String>,
    /// Informational step: failures are logged but never fail the cycle
    #[serde(default)]
    pub allow_failure: bool,
    /// Per-step timeout; capped by `timeout_per_cycle`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Resolve a provider of this capability through discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_capability: Option<String>,
}

impl StepSpec {
    pub fn new(kind: StepKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            args: Vec::new(),
            allow_failure: false,
            timeout_secs: None,
            service_capability: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn soft(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_service(mut self, capability: impl Into<String>) -> Self {
        self.service_capability = Some(capability.into());
        self
    }

    /// Effective timeout: the step's own, never above the cycle ceiling.
    pub fn effective_timeout(&self, ceiling_secs: u64) -> Duration {
        let secs = self
            .timeout_secs
            .map_or(ceiling_secs, |s| s.min(ceiling_secs));
        Duration::from_secs(secs.max(1))
    }

    /// Build the concrete command for one launch.
    pub fn to_command(&self, ctx: &StepContext<'_>) -> CommandSpec {
        let args: Vec<String> = self.args.iter().map(|a| ctx.substitute(a)).collect();
        let mut spec = CommandSpec::new(&self.command, ctx.working_dir)
            .with_args(args)
            .with_timeout(self.effective_timeout(ctx.timeout_ceiling_secs))
            .allow_failure(self.allow_failure)
            .with_env("CONDUCTOR_SESSION_ID", ctx.session_id)
            .with_env("CONDUCTOR_CYCLE", ctx.cycle.to_string())
            .with_env("CONDUCTOR_BATCH_SIZE", ctx.batch_size.to_string());
        if let Some(url) = ctx.service_url {
            spec = spec.with_env("CONDUCTOR_SERVICE_URL", url);
        }
        spec
    }
}

/// Values available to a step at launch.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub session_id: &'a str,
    pub session_dir: &'a Path,
    pub working_dir: &'a Path,
    pub cycle: u32,
    pub batch_size: u32,
    pub timeout_ceiling_secs: u64,
    pub service_url: Option<&'a str>,
}

impl StepContext<'_> {
    fn substitute(&self, arg: &str) -> String {
        let mut out = arg
            .replace("{batch_size}", &self.batch_size.to_string())
            .replace("{session_dir}", &self.session_dir.to_string_lossy())
            .replace("{cycle}", &self.cycle.to_string());
        if let Some(url) = self.service_url {
            out = out.replace("{service_url}", url);
        }
        out
    }
}

/// Explicit result of one step: `{ok, retryable, detail}` plus process facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub kind: StepKind,
    /// False only when the step fails the cycle
    pub ok: bool,
    pub retryable: bool,
    pub detail: String,
    /// A soft step that did not exit cleanly
    #[serde(default)]
    pub soft_failure: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl StepOutcome {
    /// Classify a finished process.
    pub fn from_process(
        spec: &StepSpec,
        started_at: DateTime<Utc>,
        output: ProcessOutput,
        timeout: Duration,
        keep_full_output: bool,
    ) -> Self {
        let failure = if output.timed_out {
            Some(StepFailure::Timeout {
                kind: spec.kind,
                timeout_secs: timeout.as_secs(),
            })
        } else if output.exit_code != Some(0) {
            Some(StepFailure::Failure {
                kind: spec.kind,
                exit_code: output.exit_code.unwrap_or(-1),
            })
        } else {
            None
        };

        let (ok, soft_failure, detail) = match &failure {
            None => (true, false, format!("{} succeeded", spec.kind)),
            // A soft step never fails the cycle, even on timeout.
            Some(f) if spec.allow_failure => (true, true, f.to_string()),
            Some(f) => (false, false, f.to_string()),
        };

        Self {
            kind: spec.kind,
            ok,
            retryable: failure.as_ref().is_some_and(StepFailure::is_retryable),
            detail,
            soft_failure,
            exit_code: output.exit_code,
            started_at,
            duration: output.duration,
            stdout: excerpt(output.stdout, keep_full_output),
            stderr: excerpt(output.stderr, keep_full_output),
        }
    }

    /// An unexpected fault raised while running the step.
    pub fn from_fault(spec: &StepSpec, started_at: DateTime<Utc>, message: String) -> Self {
        let failure = StepFailure::Component {
            kind: spec.kind,
            message,
        };
        Self {
            kind: spec.kind,
            ok: spec.allow_failure,
            retryable: failure.is_retryable(),
            detail: failure.to_string(),
            soft_failure: spec.allow_failure,
            exit_code: None,
            started_at,
            duration: (Utc::now() - started_at).to_std().unwrap_or_default(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

fn excerpt(text: String, keep_full: bool) -> String {
    if keep_full || text.len() <= OUTPUT_EXCERPT_BYTES {
        return text;
    }
    let mut cut = text.len() - OUTPUT_EXCERPT_BYTES;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[truncated]\n{}", &text[cut..])
}

/// The standard scan → fix → security → tests pipeline.
pub fn default_pipeline() -> Vec<StepSpec> {
    vec![
        StepSpec::new(StepKind::Scan, "issue-scanner")
            .with_args(["--session-dir", "{session_dir}", "--format", "json"]),
        StepSpec::new(StepKind::ApplyFixes, "fix-applier")
            .with_args(["--batch-size", "{batch_size}"]),
        StepSpec::new(StepKind::SecurityScan, "security-scanner").soft(),
        StepSpec::new(StepKind::RunTests, "test-runner").soft(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx<'a>(dir: &'a Path, url: Option<&'a str>) -> StepContext<'a> {
        StepContext {
            session_id: "sess-1",
            session_dir: dir,
            working_dir: dir,
            cycle: 3,
            batch_size: 7,
            timeout_ceiling_secs: 120,
            service_url: url,
        }
    }

    fn output(exit_code: Option<i32>, timed_out: bool) -> ProcessOutput {
        ProcessOutput {
            succeeded: exit_code == Some(0) && !timed_out,
            exit_code,
            stdout: "out".into(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            timed_out,
        }
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&StepKind::ApplyFixes).unwrap();
        assert_eq!(json, "\"apply-fixes\"");
        for kind in StepKind::all() {
            let json = format!("\"{}\"", kind.as_str());
            let back: StepKind = serde_json::from_str(&json).unwrap();
            assert_eq!(&back, kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: Result<StepKind, _> = serde_json::from_str("\"deploy-to-prod\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let dir = PathBuf::from("/work/session");
        let spec = StepSpec::new(StepKind::ApplyFixes, "fixer").with_args([
            "--batch-size",
            "{batch_size}",
            "--out={session_dir}/cycle-{cycle}",
            "--svc",
            "{service_url}",
        ]);
        let cmd = spec.to_command(&ctx(&dir, Some("http://127.0.0.1:9000")));
        assert_eq!(
            cmd.args,
            vec![
                "--batch-size",
                "7",
                "--out=/work/session/cycle-3",
                "--svc",
                "http://127.0.0.1:9000"
            ]
        );
        assert!(
            cmd.env
                .contains(&("CONDUCTOR_SERVICE_URL".into(), "http://127.0.0.1:9000".into()))
        );
        assert!(cmd.env.contains(&("CONDUCTOR_BATCH_SIZE".into(), "7".into())));
    }

    #[test]
    fn test_step_timeout_capped_by_ceiling() {
        let spec = StepSpec::new(StepKind::Scan, "scan").with_timeout_secs(600);
        assert_eq!(spec.effective_timeout(120), Duration::from_secs(120));
        let spec = StepSpec::new(StepKind::Scan, "scan").with_timeout_secs(30);
        assert_eq!(spec.effective_timeout(120), Duration::from_secs(30));
        let spec = StepSpec::new(StepKind::Scan, "scan");
        assert_eq!(spec.effective_timeout(120), Duration::from_secs(120));
    }

    #[test]
    fn test_hard_failure_fails_step() {
        let spec = StepSpec::new(StepKind::ApplyFixes, "fixer");
        let outcome = StepOutcome::from_process(
            &spec,
            Utc::now(),
            output(Some(2), false),
            Duration::from_secs(10),
            false,
        );
        assert!(!outcome.ok);
        assert!(outcome.retryable);
        assert!(outcome.detail.contains("exited with code 2"));
    }

    #[test]
    fn test_soft_failure_keeps_cycle_alive() {
        let spec = StepSpec::new(StepKind::SecurityScan, "sec").soft();
        let outcome = StepOutcome::from_process(
            &spec,
            Utc::now(),
            output(Some(1), false),
            Duration::from_secs(10),
            false,
        );
        assert!(outcome.ok);
        assert!(outcome.soft_failure);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[test]
    fn test_timeout_is_classified() {
        let spec = StepSpec::new(StepKind::RunTests, "tests");
        let outcome = StepOutcome::from_process(
            &spec,
            Utc::now(),
            output(None, true),
            Duration::from_secs(45),
            false,
        );
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("timed out after 45s"));
    }

    #[test]
    fn test_fault_on_hard_step_fails() {
        let spec = StepSpec::new(StepKind::Scan, "missing");
        let outcome = StepOutcome::from_fault(&spec, Utc::now(), "no such file".into());
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("unexpected fault"));
    }

    #[test]
    fn test_output_excerpt_truncates_long_output() {
        let long = "x".repeat(OUTPUT_EXCERPT_BYTES * 2);
        let cut = excerpt(long.clone(), false);
        assert!(cut.starts_with("[truncated]"));
        assert!(cut.len() < long.len());
        assert_eq!(excerpt(long.clone(), true), long);
    }

    #[test]
    fn test_default_pipeline_shape() {
        let steps = default_pipeline();
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Scan,
                StepKind::ApplyFixes,
                StepKind::SecurityScan,
                StepKind::RunTests
            ]
        );
        assert!(!steps[0].allow_failure);
        assert!(!steps[1].allow_failure);
        assert!(steps[2].allow_failure);
        assert!(steps[3].allow_failure);
    }
}
