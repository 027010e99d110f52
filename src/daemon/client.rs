//! Agent client used by the cli
//!
//! `AgentClient` speaks the newline-delimited JSON protocol over the agent's
//! Unix socket, starting the agent first when it isn't running.

use crate::daemon::protocol::{
    AccessModes, AgentRequest, AgentResponse, ErrorKind, Selector, ShareView,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tracing::{debug, info};

/// Default timeout for agent operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for agent startup check
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between startup checks
const STARTUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// File name of the agent executable, expected next to the cli
pub const AGENT_BINARY: &str = "riptide-agent";

/// Errors that can occur when communicating with the agent
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to agent: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("Agent is not running")]
    AgentNotRunning,

    #[error("Failed to start agent: {0}")]
    AgentStartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("{message}")]
    Agent { kind: ErrorKind, message: String },

    #[error("Unexpected response from agent")]
    UnexpectedResponse,

    #[error("Connection closed by agent")]
    ConnectionClosed,
}

impl ClientError {
    /// Error category reported by the agent, if the agent produced this error.
    pub fn agent_kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Agent { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// How to launch the agent when it isn't running
#[derive(Debug, Clone, Default)]
pub struct AgentLauncher {
    /// Agent executable; defaults to `riptide-agent` next to the current executable
    pub binary: Option<PathBuf>,
    /// Config file passed to the agent with `--config`
    pub config_path: Option<PathBuf>,
}

impl AgentLauncher {
    fn binary_path(&self) -> Result<PathBuf, ClientError> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        let exe = std::env::current_exe().map_err(|e| {
            ClientError::AgentStartFailed(format!("Failed to get current executable: {}", e))
        })?;
        let dir = exe.parent().ok_or_else(|| {
            ClientError::AgentStartFailed("Current executable has no parent directory".to_string())
        })?;
        Ok(dir.join(AGENT_BINARY))
    }

    /// Spawn the agent as a detached process
    fn spawn(&self) -> Result<(), ClientError> {
        use std::process::{Command, Stdio};

        let binary = self.binary_path()?;
        info!(binary = %binary.display(), "Starting agent process");

        let mut command = Command::new(&binary);
        if let Some(config_path) = &self.config_path {
            command.arg("--config").arg(config_path);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ClientError::AgentStartFailed(format!(
                    "Failed to spawn {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        debug!("Agent process spawned");
        Ok(())
    }
}

/// Client for communicating with the riptide agent
pub struct AgentClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
    socket_path: PathBuf,
}

impl AgentClient {
    /// Connect to a running agent
    ///
    /// Returns `AgentNotRunning` if nothing is listening on the socket.
    pub async fn connect_to(socket_path: PathBuf) -> Result<Self, ClientError> {
        debug!("Connecting to agent at {:?}", socket_path);

        if !socket_path.exists() {
            return Err(ClientError::AgentNotRunning);
        }

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    ClientError::AgentNotRunning
                }
                _ => ClientError::ConnectionFailed(e),
            })?;

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            socket_path,
        })
    }

    /// Connect to the agent, starting it if not running
    ///
    /// Spawns the agent, then waits up to 5 seconds for its socket to accept
    /// connections.
    pub async fn connect_or_start(
        socket_path: PathBuf,
        launcher: &AgentLauncher,
    ) -> Result<Self, ClientError> {
        match Self::connect_to(socket_path.clone()).await {
            Ok(client) => return Ok(client),
            Err(ClientError::AgentNotRunning) => {
                debug!("Agent not running, starting it");
            }
            Err(e) => return Err(e),
        }

        launcher.spawn()?;

        let start_time = std::time::Instant::now();
        while start_time.elapsed() < STARTUP_TIMEOUT {
            if socket_path.exists() {
                match Self::connect_to(socket_path.clone()).await {
                    Ok(client) => {
                        info!("Connected to newly started agent");
                        return Ok(client);
                    }
                    Err(ClientError::AgentNotRunning) => {}
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(STARTUP_CHECK_INTERVAL).await;
        }

        Err(ClientError::AgentStartFailed(
            "Agent started but socket did not become available within timeout".to_string(),
        ))
    }

    /// Get the socket path this client is connected to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send_request(&mut self, request: AgentRequest) -> Result<AgentResponse, ClientError> {
        match tokio::time::timeout(DEFAULT_TIMEOUT, self.send_request_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn send_request_inner(
        &mut self,
        request: AgentRequest,
    ) -> Result<AgentResponse, ClientError> {
        let request_json = serde_json::to_string(&request)?;
        debug!("Sending request: {}", request_json);

        self.writer.write_all(request_json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut response_line = String::new();
        let bytes_read = self.reader.read_line(&mut response_line).await?;
        if bytes_read == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        debug!("Received response: {}", response_line.trim());

        match serde_json::from_str(&response_line)? {
            AgentResponse::Error { kind, message } => Err(ClientError::Agent { kind, message }),
            response => Ok(response),
        }
    }

    /// Check if the agent is alive
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.send_request(AgentRequest::Ping).await? {
            AgentResponse::Pong => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Share a file for `duration_hours`
    pub async fn add(
        &mut self,
        path: PathBuf,
        name: Option<String>,
        duration_hours: i64,
        modes: AccessModes,
    ) -> Result<ShareView, ClientError> {
        let request = AgentRequest::Add {
            path,
            name,
            duration_hours,
            modes,
        };
        match self.send_request(request).await? {
            AgentResponse::Added(view) => Ok(view),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// List the caller's active shares, oldest first
    pub async fn list(&mut self) -> Result<Vec<ShareView>, ClientError> {
        match self.send_request(AgentRequest::List).await? {
            AgentResponse::Shares(shares) => Ok(shares),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn remove(&mut self, selector: Selector) -> Result<ShareView, ClientError> {
        match self.send_request(AgentRequest::Remove { selector }).await? {
            AgentResponse::Removed(view) => Ok(view),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Drop every share and restore the default configuration
    pub async fn reset_config(&mut self) -> Result<usize, ClientError> {
        match self.send_request(AgentRequest::ResetConfig).await? {
            AgentResponse::Reset { removed } => Ok(removed),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Request the agent to shut down
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.send_request(AgentRequest::Shutdown).await? {
            AgentResponse::ShuttingDown => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
