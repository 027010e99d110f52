//! Agent process wiring
//!
//! Opens the store, then starts the expiry scheduler, the distribution
//! endpoint and the command interface. All of them stop on one shutdown
//! broadcast.

use crate::config::Config;
use crate::daemon::clock::{Clock, SystemClock};
use crate::daemon::registry::{Registry, RegistryOptions};
use crate::daemon::scheduler::ExpiryScheduler;
use crate::daemon::server::{CommandServer, ServerError};
use crate::daemon::store::{open_store, StoreError};
use crate::server::{self, logging_hook, DistributionState, FetchHook, TemplateEngine};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors that prevent the agent from starting
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to open share store: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to bind distribution endpoint on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to load templates: {0}")]
    Templates(#[from] minijinja::Error),

    #[error("Command interface error: {0}")]
    Server(#[from] ServerError),
}

/// A configured, not yet started agent
pub struct Agent {
    config: Config,
    config_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    hook: FetchHook,
}

impl Agent {
    /// `config_path` is the file `ResetConfig` rewrites.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
            clock: Arc::new(SystemClock),
            hook: logging_hook(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fetch_hook(mut self, hook: FetchHook) -> Self {
        self.hook = hook;
        self
    }

    /// Start every agent task.
    pub async fn start(self) -> Result<AgentHandle, AgentError> {
        let store = open_store(&self.config.store)?;
        info!(backend = store.backend_name(), "Share store opened");

        let registry = Arc::new(Registry::new(
            store,
            self.clock,
            RegistryOptions::from_settings(&self.config.shares),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut tasks = Vec::new();

        tasks.push(
            ExpiryScheduler::new(
                Arc::clone(&registry),
                Duration::from_secs(self.config.shares.sweep_interval_secs),
            )
            .spawn(shutdown_tx.subscribe()),
        );

        let bind = self.config.distribution.bind.clone();
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = shutdown_tx.send(());
                return Err(AgentError::Bind { addr: bind, source });
            }
        };
        let distribution_addr = listener.local_addr().map_err(|source| AgentError::Bind {
            addr: bind.clone(),
            source,
        })?;

        let state = Arc::new(DistributionState {
            registry: Arc::clone(&registry),
            template_engine: TemplateEngine::new()?,
            public_url: self.config.distribution.public_url.clone(),
            hook: self.hook,
        });
        let mut http_shutdown_rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = http_shutdown_rx.recv().await;
            };
            if let Err(e) = server::serve(listener, state, shutdown).await {
                error!("Distribution endpoint failed: {}", e);
            }
        }));

        let socket_path = self.config.agent.effective_socket_path();
        let mut command_server = CommandServer::new(
            Arc::clone(&registry),
            socket_path.clone(),
            self.config.agent.effective_pid_path(),
            shutdown_tx.clone(),
        )
        .with_public_url(self.config.distribution.public_url.clone())
        .with_request_timeout(Duration::from_secs(self.config.agent.request_timeout_secs));
        if let Some(config_path) = self.config_path {
            command_server = command_server.with_config_path(config_path);
        }

        match command_server.run().await {
            Ok(task) => tasks.push(task),
            Err(e) => {
                let _ = shutdown_tx.send(());
                return Err(e.into());
            }
        }

        info!(
            distribution = %distribution_addr,
            socket = %socket_path.display(),
            "Agent started"
        );

        Ok(AgentHandle {
            shutdown_tx,
            registry,
            distribution_addr,
            socket_path,
            tasks,
        })
    }
}

/// Handle to a running agent
pub struct AgentHandle {
    shutdown_tx: broadcast::Sender<()>,
    registry: Arc<Registry>,
    distribution_addr: SocketAddr,
    socket_path: PathBuf,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// Signal every agent task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Address the distribution endpoint is bound to
    pub fn distribution_addr(&self) -> SocketAddr {
        self.distribution_addr
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for every agent task to finish
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Agent task failed: {}", e);
            }
        }
        info!("Agent stopped");
    }

    /// Run until an OS signal or a `Shutdown` request, then stop cleanly.
    pub async fn run_until_shutdown(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Received OS signal, stopping agent");
                self.shutdown();
            }
            _ = shutdown_rx.recv() => {}
        }
        self.wait().await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
