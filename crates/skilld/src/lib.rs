//! skilld - skill manager daemon
//!
//! Library components for the daemon process: the reconciliation scheduler
//! and everything it drives, plus the bus and its HTTP surface.

pub mod backend;
pub mod bus;
pub mod commands;
pub mod config_source;
pub mod git_backend;
pub mod identity;
pub mod locks;
pub mod manifest;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use skill_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bus::MessageBus;
use commands::{CommandContext, CommandTable};
use config_source::{ConfigSource, FileConfigSource, StaticConfig};
use git_backend::GitBackend;
use identity::FileIdentity;
use registry::{DirectoryLoader, LoadedSkills};
use scheduler::{Scheduler, SchedulerDeps, SystemClock};
use server::AppState;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// `skills.conf` path. Defaults apply when unset.
    pub config_path: Option<PathBuf>,
    /// HTTP server port (default: 7710).
    pub port: u16,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// How often the scheduler checks whether a pass is due.
    pub tick: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            port: DEFAULT_PORT,
            auth_token: std::env::var("SKILLD_AUTH_TOKEN").ok(),
            tick: scheduler::DEFAULT_TICK,
        }
    }
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    bus: Arc<MessageBus>,
    loader: Arc<DirectoryLoader>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub fn new(config: DaemonConfig) -> eyre::Result<Self> {
        let source: Arc<dyn ConfigSource> = match &config.config_path {
            Some(path) => Arc::new(
                FileConfigSource::new(path)
                    .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
            ),
            None => Arc::new(StaticConfig(Config::default())),
        };
        let initial = source.current();

        let bus = Arc::new(MessageBus::default());
        let loader = Arc::new(DirectoryLoader::new(
            Arc::new(LoadedSkills::new()),
            Arc::clone(&bus),
        ));
        let identity = FileIdentity::new(initial.identity_path(), initial.api_url.clone());

        let scheduler = Scheduler::new(SchedulerDeps {
            backend: Arc::new(GitBackend::new(Arc::clone(&source))),
            config: source,
            bus: Arc::clone(&bus),
            clock: Arc::new(SystemClock),
            identity: Arc::new(identity),
            loader: Arc::clone(&loader),
        })
        .with_tick(config.tick);

        Ok(Self {
            config,
            bus,
            loader,
            scheduler: Arc::new(scheduler),
            cancel: CancellationToken::new(),
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run the daemon until shutdown.
    pub async fn run(&self) -> eyre::Result<()> {
        info!("skilld starting on port {}", self.config.port);
        if let Some(path) = &self.config.config_path {
            info!("config: {}", path.display());
        }
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        // Subscribe before anything can emit.
        let dispatcher_handle = tokio::spawn(commands::run_dispatcher(
            CommandTable::new(),
            CommandContext {
                scheduler: Arc::clone(&self.scheduler),
                loader: Arc::clone(&self.loader),
                bus: Arc::clone(&self.bus),
            },
            self.bus.subscribe(),
            self.cancel.clone(),
        ));

        let state = Arc::new(AppState {
            bus: Arc::clone(&self.bus),
            scheduler: Arc::clone(&self.scheduler),
            loader: Arc::clone(&self.loader),
            auth_token: self.config.auth_token.clone(),
        });
        let http_port = self.config.port;
        let http_handle = tokio::spawn(async move {
            if let Err(e) = server::start_server(state, http_port).await {
                error!("HTTP server error: {}", e);
            }
        });

        // Spawned so a dropped `run` future cannot strand `shutdown`.
        let worker = tokio::spawn(Arc::clone(&self.scheduler).run());
        let result = worker.await;

        http_handle.abort();
        self.cancel.cancel();
        if let Err(e) = dispatcher_handle.await {
            error!("command dispatcher failed: {}", e);
        }

        result
            .wrap_err("scheduler worker panicked")?
            .wrap_err("scheduler failed")
    }

    /// Stop the daemon, letting an in-flight pass finish, then shut down every
    /// loaded skill.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        self.scheduler.shutdown().await;
        self.loader.unload_all();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn shutdown_unloads_loaded_skills() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("skills.conf");
        fs::write(
            &config_path,
            format!("data_dir={}\n", dir.path().display()),
        )
        .unwrap();
        let daemon = Daemon::new(DaemonConfig {
            config_path: Some(config_path),
            port: 0,
            auth_token: None,
            tick: Duration::from_millis(10),
        })
        .unwrap();

        let skill = dir.path().join("skills").join("skill-joke");
        fs::create_dir_all(&skill).unwrap();
        fs::write(skill.join("__init__.py"), "").unwrap();
        let loader = daemon.scheduler().loader();
        loader.load(&skill);
        let mut rx = daemon.bus().subscribe();

        daemon.shutdown().await;

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.msg_type, "mycroft.skills.shutdown");
        assert_eq!(msg.data["id"], "skill-joke");
        assert!(!loader.skills().is_loaded("skill-joke"));
        assert!(daemon.scheduler().is_shutdown());
    }
}
