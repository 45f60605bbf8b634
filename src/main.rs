use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::config::ExecutionMode;
use conductor::logging::LogFormat;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Cycle-based pipeline orchestrator with a service registry")]
pub struct Cli {
    /// Path to conductor.toml (defaults to ./conductor.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator until the target, max cycles or failure
    Run(RunArgs),
    /// Show the persisted state of a session
    Status {
        /// Session directory (defaults to the configured one)
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Service registry operations
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
}

#[derive(clap::Args, Clone, Default)]
pub struct RunArgs {
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Stop once the completion probe reports at most this many issues
    #[arg(long)]
    pub target_issues: Option<u64>,

    /// continuous, single_cycle, development or production
    #[arg(long)]
    pub mode: Option<ExecutionMode>,

    #[arg(long)]
    pub no_recovery: bool,

    #[arg(long)]
    pub session_dir: Option<PathBuf>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// Per-step timeout ceiling in seconds
    #[arg(long)]
    pub timeout_per_cycle: Option<u64>,

    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Keep the batch size fixed
    #[arg(long)]
    pub no_adaptive: bool,

    #[arg(long)]
    pub registry_dir: Option<PathBuf>,

    /// Continue the session persisted in the session directory
    #[arg(long)]
    pub resume: bool,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list every problem
    Validate,
    /// Write a default conductor.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum RegistryCommands {
    /// Serve the registry HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List registered services
    List {
        /// Only services offering this capability
        #[arg(long)]
        capability: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Run one health sweep against the stored registry
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, &cwd, args).await?,
        Commands::Status { session_dir, json } => {
            cmd::cmd_status(&cli, &cwd, session_dir.as_deref(), *json)?
        }
        Commands::Config { command } => cmd::cmd_config(&cli, &cwd, command.clone())?,
        Commands::Registry { command } => cmd::cmd_registry(&cli, &cwd, command.clone()).await?,
    }

    Ok(())
}
