//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;
use conductor::config::ConductorToml;
use std::path::Path;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, cwd: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => show(cli, cwd),
        Some(ConfigCommands::Validate) => validate(cli, cwd),
        Some(ConfigCommands::Init { force }) => init(cli, cwd, force),
    }
}

fn show(cli: &Cli, cwd: &Path) -> Result<()> {
    let loaded = super::load_config(cli, cwd)?;
    println!();
    if loaded.exists {
        println!("Config file: {}", loaded.path.display());
    } else {
        println!("No conductor.toml found at {}", loaded.path.display());
        println!("Using default configuration.");
    }
    println!();
    println!("Effective values (with env overrides):");
    println!();
    print!("{}", loaded.toml.to_toml_string()?);
    for problem in &loaded.env_problems {
        println!("  warning: {}", problem);
    }
    println!();
    Ok(())
}

fn validate(cli: &Cli, cwd: &Path) -> Result<()> {
    let loaded = super::load_config(cli, cwd)?;
    if !loaded.exists {
        println!("No conductor.toml found. Using defaults (valid).");
        return Ok(());
    }

    let mut problems = loaded.env_problems;
    problems.extend(loaded.toml.validate());
    if problems.is_empty() {
        println!("Configuration is valid.");
        return Ok(());
    }

    println!("Configuration problems:");
    for problem in &problems {
        println!("  - {}", problem);
    }
    anyhow::bail!(
        "{} problem(s) in {}",
        problems.len(),
        loaded.path.display()
    )
}

fn init(cli: &Cli, cwd: &Path, force: bool) -> Result<()> {
    let path = super::config_path(cli, cwd);
    if path.exists() && !force {
        println!("conductor.toml already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    ConductorToml::default().save(&path)?;
    println!("Created {}", path.display());
    Ok(())
}
