//! skilld - skill manager daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use skilld::{Daemon, DaemonConfig, DEFAULT_PORT};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "skilld", about = "Skill manager daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "SKILLD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Path to skills.conf
    #[arg(short, long, env = "SKILLD_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig {
        port: cli.port,
        config_path: cli.config,
        ..Default::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config) {
            Ok(daemon) => {
                let daemon_ref = &daemon;

                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigterm = signal(SignalKind::terminate())
                        .expect("failed to register SIGTERM handler");
                    let mut sigint =
                        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {:?}", e);
                            }
                        }
                        _ = sigint.recv() => {
                            tracing::info!("received SIGINT, initiating graceful shutdown");
                            daemon_ref.shutdown().await;
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, initiating graceful shutdown");
                            daemon_ref.shutdown().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    tokio::select! {
                        result = daemon.run() => {
                            if let Err(e) = result {
                                error!("daemon error: {:?}", e);
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, initiating graceful shutdown");
                            daemon_ref.shutdown().await;
                        }
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {:?}", e);
                std::process::exit(1);
            }
        }
    });
}
