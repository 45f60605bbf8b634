//! CLI command implementations.
//!
//! | Module     | Commands handled  |
//! |------------|-------------------|
//! | `run`      | `Run`             |
//! | `status`   | `Status`          |
//! | `config`   | `Config`          |
//! | `registry` | `Registry`        |

pub mod config;
pub mod registry;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use registry::cmd_registry;
pub use run::cmd_run;
pub use status::cmd_status;

use anyhow::Result;
use conductor::config::{CONFIG_FILE, ConductorToml};
use std::path::{Path, PathBuf};

use super::Cli;

/// A loaded `conductor.toml` with environment overrides applied and paths
/// resolved against the file's directory.
pub struct LoadedConfig {
    pub path: PathBuf,
    pub exists: bool,
    pub toml: ConductorToml,
    /// Environment values that could not be applied
    pub env_problems: Vec<String>,
}

pub fn config_path(cli: &Cli, cwd: &Path) -> PathBuf {
    match &cli.config {
        Some(path) if path.is_relative() => cwd.join(path),
        Some(path) => path.clone(),
        None => cwd.join(CONFIG_FILE),
    }
}

pub fn load_config(cli: &Cli, cwd: &Path) -> Result<LoadedConfig> {
    let path = config_path(cli, cwd);
    let exists = path.exists();
    if cli.config.is_some() && !exists {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let mut toml = ConductorToml::load_or_default(&path)?;
    let env_problems = toml.apply_env();
    let base_dir = path.parent().unwrap_or(cwd);
    toml.resolve_paths(base_dir);
    Ok(LoadedConfig {
        path,
        exists,
        toml,
        env_problems,
    })
}

/// `--verbose` wins over the configured level.
pub fn log_level(cli: &Cli, toml: &ConductorToml) -> String {
    if cli.verbose {
        "debug".to_string()
    } else {
        toml.effective_log_level()
    }
}
