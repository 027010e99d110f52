//! Command interface of the agent
//!
//! The agent listens on a Unix socket and handles requests from the cli.
//! The socket is private to the user running the agent: it is created with
//! mode 0600 and every connection's peer uid is checked against the socket
//! owner.

use crate::config::{Config, ConfigError};
use crate::daemon::protocol::{AgentRequest, AgentResponse, ErrorKind, ShareView};
use crate::daemon::registry::{
    duration_from_hours, AddShare, Registry, RegistryError, RegistryResult,
};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest accepted request line
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Errors that can occur in the command server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent already running at {0}")]
    SocketExists(PathBuf),

    #[error("Peer uid {peer} does not own the agent socket")]
    PeerRejected { peer: u32 },

    #[error("Request exceeds {0} bytes")]
    RequestTooLarge(u64),

    #[error("No request received within {0:?}")]
    IdleTimeout(Duration),

    #[error("Server shutdown")]
    Shutdown,
}

/// Unix socket server dispatching cli requests to the registry
pub struct CommandServer {
    registry: Arc<Registry>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    public_url: String,
    config_path: Option<PathBuf>,
    request_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl CommandServer {
    pub fn new(
        registry: Arc<Registry>,
        socket_path: PathBuf,
        pid_path: PathBuf,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            socket_path,
            pid_path,
            public_url: "http://localhost:8080".to_string(),
            config_path: None,
            request_timeout: Duration::from_secs(30),
            shutdown_tx,
        }
    }

    /// Base URL used to build share links
    pub fn with_public_url(mut self, public_url: impl Into<String>) -> Self {
        self.public_url = public_url.into();
        self
    }

    /// Config file rewritten by `ResetConfig`
    pub fn with_config_path(mut self, config_path: PathBuf) -> Self {
        self.config_path = Some(config_path);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get the PID file path
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Bind the socket, write the PID file and start accepting connections.
    ///
    /// The accept loop runs until the shutdown channel fires, then removes
    /// the socket and PID file.
    pub async fn run(&self) -> Result<JoinHandle<()>, ServerError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ServerError::SocketExists(self.socket_path.clone()));
            }
            // Stale socket from a previous run
            std::fs::remove_file(&self.socket_path)?;
        }

        self.write_pid_file()?;

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        let owner_uid = std::fs::metadata(&self.socket_path)?.uid();
        info!(socket = %self.socket_path.display(), "Command interface listening");

        let handler = Arc::new(RequestHandler {
            registry: Arc::clone(&self.registry),
            public_url: self.public_url.clone(),
            config_path: self.config_path.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        });
        let request_timeout = self.request_timeout;
        let socket_path = self.socket_path.clone();
        let pid_path = self.pid_path.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _addr)) => {
                                debug!("Accepted new connection");
                                let handler = Arc::clone(&handler);
                                let mut conn_shutdown_rx = shutdown_rx.resubscribe();

                                tokio::spawn(async move {
                                    let result = handle_connection(
                                        stream,
                                        owner_uid,
                                        handler,
                                        request_timeout,
                                        &mut conn_shutdown_rx,
                                    )
                                    .await;
                                    match result {
                                        Ok(()) | Err(ServerError::Shutdown) => {}
                                        Err(e @ ServerError::IdleTimeout(_)) => debug!("Connection closed: {}", e),
                                        Err(e) => warn!("Connection error: {}", e),
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Command interface stopping");
                        break;
                    }
                }
            }

            cleanup_files(&socket_path, &pid_path);
        }))
    }

    fn write_pid_file(&self) -> Result<(), ServerError> {
        let pid = std::process::id();
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.pid_path, pid.to_string())?;
        debug!(path = %self.pid_path.display(), pid, "Wrote PID file");
        Ok(())
    }
}

/// Shared state for answering requests on any connection
struct RequestHandler {
    registry: Arc<Registry>,
    public_url: String,
    config_path: Option<PathBuf>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RequestHandler {
    async fn handle(&self, owner: &str, request: AgentRequest) -> AgentResponse {
        match request {
            AgentRequest::Ping => AgentResponse::Pong,

            AgentRequest::Shutdown => {
                info!(owner, "Shutdown requested");
                AgentResponse::ShuttingDown
            }

            AgentRequest::Add {
                path,
                name,
                duration_hours,
                modes,
            } => {
                let duration = match duration_from_hours(duration_hours) {
                    Some(duration) => duration,
                    None => {
                        return error_response(&RegistryError::InvalidDuration {
                            max_hours: self.registry.options().max_duration.num_hours(),
                        })
                    }
                };
                let request = AddShare {
                    owner: owner.to_string(),
                    path,
                    name,
                    duration,
                    modes,
                };

                match self.run_blocking("Add", move |registry| registry.add(request)).await {
                    Ok(record) => AgentResponse::Added(ShareView::new(record, &self.public_url)),
                    Err(response) => response,
                }
            }

            AgentRequest::List => {
                let owner = owner.to_string();
                match self.run_blocking("List", move |registry| registry.list(&owner)).await {
                    Ok(records) => AgentResponse::Shares(
                        records
                            .into_iter()
                            .map(|record| ShareView::new(record, &self.public_url))
                            .collect(),
                    ),
                    Err(response) => response,
                }
            }

            AgentRequest::Remove { selector } => {
                let owner = owner.to_string();
                match self
                    .run_blocking("Remove", move |registry| registry.remove(&owner, selector))
                    .await
                {
                    Ok(record) => AgentResponse::Removed(ShareView::new(record, &self.public_url)),
                    Err(response) => response,
                }
            }

            AgentRequest::ResetConfig => {
                let removed = match self.run_blocking("Reset", |registry| registry.reset()).await {
                    Ok(removed) => removed,
                    Err(response) => return response,
                };
                if let Some(path) = &self.config_path {
                    if let Err(e) = Config::reset_to_defaults(path) {
                        return config_error_response(path, &e);
                    }
                    info!(path = %path.display(), "Configuration reset to defaults");
                }
                AgentResponse::Reset { removed }
            }
        }
    }

    /// Run a registry operation on the blocking pool.
    ///
    /// Store writes are synchronous and file validation touches the disk.
    async fn run_blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, AgentResponse>
    where
        F: FnOnce(&Registry) -> RegistryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        match tokio::task::spawn_blocking(move || f(&registry)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(error_response(&e)),
            Err(e) => {
                error!("{} task failed: {}", operation, e);
                Err(AgentResponse::Error {
                    kind: ErrorKind::Internal,
                    message: format!("{} failed: {}", operation, e),
                })
            }
        }
    }
}

fn error_response(e: &RegistryError) -> AgentResponse {
    match e.kind() {
        ErrorKind::Internal | ErrorKind::Io | ErrorKind::DuplicateId => error!("Request failed: {}", e),
        _ => debug!("Request rejected: {}", e),
    }
    AgentResponse::Error {
        kind: e.kind(),
        message: e.to_string(),
    }
}

fn config_error_response(path: &Path, e: &ConfigError) -> AgentResponse {
    error!(path = %path.display(), "Failed to reset config: {}", e);
    AgentResponse::Error {
        kind: ErrorKind::Io,
        message: format!("Shares were removed but the config could not be reset: {}", e),
    }
}

/// Only the user who owns the socket may issue commands.
fn check_peer(peer_uid: u32, owner_uid: u32) -> Result<(), ServerError> {
    if peer_uid == owner_uid {
        Ok(())
    } else {
        Err(ServerError::PeerRejected { peer: peer_uid })
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &AgentResponse,
) -> Result<(), ServerError> {
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Handle a single cli connection
async fn handle_connection(
    stream: UnixStream,
    owner_uid: u32,
    handler: Arc<RequestHandler>,
    request_timeout: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let peer_uid = stream.peer_cred()?.uid();
    let (reader, mut writer) = stream.into_split();

    if let Err(e) = check_peer(peer_uid, owner_uid) {
        warn!(peer_uid, "Rejected connection: {}", e);
        let response = AgentResponse::Error {
            kind: ErrorKind::InvalidInput,
            message: e.to_string(),
        };
        write_response(&mut writer, &response).await?;
        return Err(e);
    }

    let owner = format!("uid:{}", peer_uid);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        let read = async {
            let mut limited = (&mut reader).take(MAX_REQUEST_BYTES);
            tokio::time::timeout(request_timeout, limited.read_line(&mut line)).await
        };

        tokio::select! {
            read_result = read => {
                let bytes_read = match read_result {
                    Err(_) => return Err(ServerError::IdleTimeout(request_timeout)),
                    Ok(result) => result?,
                };
                if bytes_read == 0 {
                    debug!("Client disconnected");
                    return Ok(());
                }
                if !line.ends_with('\n') && bytes_read as u64 >= MAX_REQUEST_BYTES {
                    let response = AgentResponse::Error {
                        kind: ErrorKind::InvalidInput,
                        message: format!("Request exceeds {} bytes", MAX_REQUEST_BYTES),
                    };
                    write_response(&mut writer, &response).await?;
                    return Err(ServerError::RequestTooLarge(MAX_REQUEST_BYTES));
                }

                let response = match serde_json::from_str::<AgentRequest>(&line) {
                    Ok(request) => {
                        debug!(owner = %owner, "Received request: {:?}", request);
                        handler.handle(&owner, request).await
                    }
                    Err(e) => {
                        warn!("Failed to parse request: {}", e);
                        AgentResponse::Error {
                            kind: ErrorKind::InvalidInput,
                            message: format!("Invalid request: {}", e),
                        }
                    }
                };

                let should_shutdown = matches!(response, AgentResponse::ShuttingDown);
                write_response(&mut writer, &response).await?;

                if should_shutdown {
                    let _ = handler.shutdown_tx.send(());
                    return Err(ServerError::Shutdown);
                }
            }

            _ = shutdown_rx.recv() => {
                return Err(ServerError::Shutdown);
            }
        }
    }
}

/// Remove the socket and PID file on shutdown
fn cleanup_files(socket_path: &Path, pid_path: &Path) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!("Failed to remove socket file: {}", e);
    }
    if let Err(e) = std::fs::remove_file(pid_path) {
        warn!("Failed to remove PID file: {}", e);
    }
}

/// Read the agent PID from a PID file
pub fn read_agent_pid(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
