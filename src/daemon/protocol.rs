//! Wire types for cli-agent communication
//!
//! Messages are sent as newline-delimited JSON over a Unix socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Public identifier of a share.
///
/// Random (UUIDv4) so fetchers cannot enumerate other shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(pub Uuid);

impl ShareId {
    /// Generate a new random share ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShareId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ShareId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ShareId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The way a fetcher accesses a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Human-browsable page with a download link
    Website,
    /// Raw byte stream for wget/curl
    Wget,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Website => "website",
            AccessMode::Wget => "wget",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of access modes enabled on a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessModes {
    pub website: bool,
    pub wget: bool,
}

impl AccessModes {
    /// Both modes enabled.
    pub const ALL: AccessModes = AccessModes {
        website: true,
        wget: true,
    };

    /// Only the given mode enabled.
    pub fn only(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Website => Self {
                website: true,
                wget: false,
            },
            AccessMode::Wget => Self {
                website: false,
                wget: true,
            },
        }
    }

    pub fn allows(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Website => self.website,
            AccessMode::Wget => self.wget,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.website && !self.wget
    }
}

impl Default for AccessModes {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::fmt::Display for AccessModes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.website, self.wget) {
            (true, true) => f.write_str("website+wget"),
            (true, false) => f.write_str("website"),
            (false, true) => f.write_str("wget"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Metadata of a single share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub id: ShareId,
    /// Local user that created the share
    pub owner: String,
    /// Absolute location of the shared bytes
    pub path: PathBuf,
    /// Display name presented to fetchers
    pub name: String,
    /// Byte length captured when the share was created
    pub size: u64,
    /// Lower-case file extension, used as a content-type hint
    pub file_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub modes: AccessModes,
    /// The agent made a private copy at `path` and deletes it with the share
    #[serde(default)]
    pub owned_copy: bool,
}

impl ShareRecord {
    /// A share is logically gone once its expiry time has been reached.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

/// Selects a share for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Selector {
    /// Literal share id
    ById(ShareId),
    /// Position in the owner's current listing (0-based)
    ByIndex(usize),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::ById(id) => write!(f, "{}", id),
            Selector::ByIndex(index) => write!(f, "#{}", index),
        }
    }
}

impl std::str::FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(id) = s.parse::<ShareId>() {
            return Ok(Selector::ById(id));
        }
        s.parse::<usize>()
            .map(Selector::ByIndex)
            .map_err(|_| format!("'{}' is neither a share id nor a list index", s))
    }
}

/// A share record together with its public link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareView {
    #[serde(flatten)]
    pub record: ShareRecord,
    pub url: String,
}

impl ShareView {
    pub fn new(record: ShareRecord, public_url: &str) -> Self {
        let url = share_url(public_url, record.id);
        Self { record, url }
    }
}

/// Build the public link of a share.
pub fn share_url(public_url: &str, id: ShareId) -> String {
    format!("{}/{}", public_url.trim_end_matches('/'), id)
}

/// Error categories reported to the cli.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Expired,
    ModeNotEnabled,
    DuplicateId,
    Io,
    Internal,
}

/// Requests sent from the cli to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum AgentRequest {
    /// Share a file
    Add {
        path: PathBuf,
        name: Option<String>,
        duration_hours: i64,
        modes: AccessModes,
    },
    /// List the caller's active shares
    List,
    /// Remove one of the caller's shares
    Remove { selector: Selector },
    /// Drop every share and restore the default configuration
    ResetConfig,
    /// Check if the agent is alive
    Ping,
    /// Request agent shutdown
    Shutdown,
}

/// Responses sent from the agent to the cli
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "data")]
pub enum AgentResponse {
    Added(ShareView),
    Shares(Vec<ShareView>),
    Removed(ShareView),
    Reset { removed: usize },
    Pong,
    ShuttingDown,
    Error { kind: ErrorKind, message: String },
}
