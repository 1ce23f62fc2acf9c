//! deliveryd - continuous delivery daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use clap::Parser;
use delivery_core::config::ConfigError;
use delivery_core::Config;
use deliveryd::{Daemon, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Project-local settings, read when present.
const WORKSPACE_CONFIG: &str = ".delivery/config";

#[derive(Parser)]
#[command(name = "deliveryd", about = "Continuous delivery daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "7800")]
    port: u16,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Settings file (overrides .delivery/config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding .delivery/config; relative paths resolve against it
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Pipeline template to run for every push
    #[arg(long)]
    pipeline: Option<String>,

    /// Deployed endpoints are published under this base URL
    #[arg(long)]
    base_url: Option<String>,
}

/// Defaults, then `.delivery/config`, then `--config`, then CLI flags.
fn load_settings(cli: &Cli) -> Result<Config, ConfigError> {
    let mut settings = Config::default();

    let workspace_config = cli.workspace.join(WORKSPACE_CONFIG);
    if workspace_config.is_file() {
        settings.load_file(&workspace_config)?;
    }
    if let Some(path) = &cli.config {
        settings.load_file(path)?;
    }

    if let Some(pipeline) = &cli.pipeline {
        settings.pipeline.clone_from(pipeline);
    }
    if let Some(base_url) = &cli.base_url {
        settings.base_url.clone_from(base_url);
    }
    settings.resolve_paths(absolute(&cli.workspace).as_path());
    Ok(settings)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let defaults = DaemonConfig::default();
    let config = DaemonConfig {
        db_path: cli.db.clone().unwrap_or(defaults.db_path),
        port: cli.port,
        auth_token: defaults.auth_token,
        settings,
    };

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {:#}", e);
                    }
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        daemon.shutdown().await;
    });
}
