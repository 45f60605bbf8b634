//! `conductor registry`: serve, list and sweep.

use anyhow::{Context, Result};
use conductor::logging;
use conductor::registry::{DiscoveryFilter, ServiceRegistry, server};
use conductor::shutdown::shutdown_signal;
use std::path::Path;
use tokio::net::TcpListener;

use super::super::{Cli, RegistryCommands};

pub async fn cmd_registry(cli: &Cli, cwd: &Path, command: RegistryCommands) -> Result<()> {
    let loaded = super::load_config(cli, cwd)?;
    let mut config = loaded.toml.registry.clone();

    match command {
        RegistryCommands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let _log_guard = logging::init(
                &super::log_level(cli, &loaded.toml),
                cli.log_format,
                Some(&config.dir.join("logs")),
            )?;
            let registry = ServiceRegistry::open(&config)?;
            let addr = format!("{}:{}", config.host, config.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            tracing::info!(
                component = "registry",
                addr = %addr,
                dir = %config.dir.display(),
                services = registry.len().await,
                "Registry listening"
            );
            server::serve(registry, listener, config.sweep_interval(), shutdown_signal()).await
        }
        RegistryCommands::List { capability, json } => {
            let registry = ServiceRegistry::open(&config)?;
            let filter = DiscoveryFilter {
                capability,
                ..DiscoveryFilter::default()
            };
            let services = registry.discover(&filter).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&services)?);
                return Ok(());
            }
            if services.is_empty() {
                println!("No services registered in {}", config.dir.display());
                return Ok(());
            }
            println!();
            for service in &services {
                let capabilities: Vec<&str> =
                    service.capabilities.iter().map(|c| c.name.as_str()).collect();
                println!(
                    "  {}  {:<10} {:<20} {:<22} {}",
                    &service.id[..service.id.len().min(8)],
                    service.status,
                    service.name,
                    format!("{}:{}", service.host, service.port),
                    capabilities.join(",")
                );
            }
            println!();
            Ok(())
        }
        RegistryCommands::Sweep => {
            let registry = ServiceRegistry::open(&config)?;
            let report = registry.health_check_services().await;
            println!(
                "Checked {} service(s), probed {}, {} status change(s)",
                report.checked,
                report.probed,
                report.changes.len()
            );
            for change in &report.changes {
                println!("  {}: {} -> {}", change.service_id, change.from, change.to);
            }
            Ok(())
        }
    }
}
