//! fleetd: the fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - State store (redb)
//! - Node provider (local processes, or in-memory for dry runs)
//! - Supervisor run loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml --port 8080 --data-dir /var/lib/fleet
//! fleetd config --config /etc/fleet/fleet.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleet_provider::{LocalProvider, MemoryProvider, NodeProvider};
use fleet_state::StateStore;
use fleet_supervisor::Supervisor;
use tracing::{error, info, warn};

use crate::config::{FleetConfig, LogConfig, ProviderConfig};

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleet_supervisor=debug,fleet_state=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor loop and the API server.
    Run {
        /// Path to fleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `[api] port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `[store] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.store.data_dir = data_dir;
            }
            init_tracing(&config.log)?;
            run(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path),
        None => Ok(FleetConfig::default()),
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .parse()?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build_provider(config: &ProviderConfig) -> Arc<dyn NodeProvider> {
    match config {
        ProviderConfig::Local(local) => {
            info!(command = %local.command, base_port = local.base_port, "local provider");
            Arc::new(LocalProvider::new(local.clone()))
        }
        ProviderConfig::Memory => {
            warn!("memory provider selected, nodes will not actually run");
            Arc::new(MemoryProvider::new())
        }
    }
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!(mode = ?config.supervisor.mode, "fleet daemon starting");

    // ── State store ────────────────────────────────────────────

    let store = if config.store.in_memory {
        warn!("in-memory store, state is lost on exit");
        StateStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let db_path = config.store.data_dir.join("fleet.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    // ── Supervisor ─────────────────────────────────────────────

    let provider = build_provider(&config.provider);
    let supervisor = Supervisor::new(store.clone(), provider, config.supervisor.clone());
    match store.get_active_deployment()? {
        Some(deployment) => {
            info!(deployment_id = deployment.id, commit_id = %deployment.commit_id, "active deployment");
            supervisor.start();
        }
        None => {
            info!("no active deployment yet, supervisor starts on the first deployment");
        }
    }

    // ── API server ─────────────────────────────────────────────

    let router = fleet_api::build_router(supervisor.clone());
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    supervisor.stop().await;
    info!("fleet daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crate_of(type_name: &str) -> &str {
        type_name.split("::").next().unwrap_or_default()
    }

    #[test]
    fn default_filter_targets_real_crates() {
        assert!(DEFAULT_LOG_FILTER.parse::<tracing_subscriber::EnvFilter>().is_ok());
        let targets: Vec<&str> = DEFAULT_LOG_FILTER
            .split(',')
            .filter_map(|directive| directive.split_once('=').map(|(target, _)| target))
            .collect();
        for expected in [
            crate_of(module_path!()),
            crate_of(std::any::type_name::<Supervisor>()),
            crate_of(std::any::type_name::<StateStore>()),
        ] {
            assert!(targets.contains(&expected), "{expected} missing from {DEFAULT_LOG_FILTER}");
        }
    }
}
