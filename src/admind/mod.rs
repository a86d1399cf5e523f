//! Admin directory protocol.
//!
//! A running server publishes a control directory under the run dir. Clients
//! drop request files into it and watch for the marker files the daemon
//! writes back; see [`protocol`] for the layout.

pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;
pub mod shell;

pub use channel::{ChannelReader, ChannelWriter};
pub use client::{AdmindClient, SessionChannels, SessionRequest, DEFAULT_POLL_INTERVAL};
pub use server::{AdminDirectory, IncomingRequest, ServerChannels};
pub use shell::ShellSession;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use protocol::{write_atomic, SERVER_INFO_FILE};

/// Lifecycle of a request as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    Running,
    Ready,
    /// The daemon reported a failure.
    Error,
    /// The daemon or the request vanished.
    Gone,
}

impl RequestState {
    /// ERROR and GONE are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Gone)
    }

    /// Whether `self` is `target` or further along PENDING → RUNNING → READY.
    pub fn has_reached(self, target: RequestState) -> bool {
        match (self.progress(), target.progress()) {
            (Some(current), Some(wanted)) => current >= wanted,
            _ => self == target,
        }
    }

    fn progress(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Running => Some(1),
            Self::Ready => Some(2),
            Self::Error | Self::Gone => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Gone => "GONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AdmindError {
    #[error("Unable to find '{0}'")]
    ServerNotFound(String),
    #[error("A server is already running from {} (pid {pid})", path.display())]
    AlreadyRunning { path: PathBuf, pid: u32 },
    #[error("Request {token} is {state}, channels need a running session")]
    ChannelsUnavailable { token: String, state: RequestState },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed request {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Unreadable server info {}: {source}", path.display())]
    ServerInfo {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to encode server info: {0}")]
    ServerInfoEncode(#[source] toml::ser::Error),
}

impl AdmindError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of `server.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub pid: u32,
    /// Changes on every daemon start. Requests submitted to an earlier
    /// incarnation are reported GONE.
    pub server_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl ServerInfo {
    /// Describe the current process.
    pub fn current(log_file: Option<PathBuf>) -> Self {
        Self {
            pid: std::process::id(),
            server_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            log_file,
        }
    }

    pub fn read(dir: &Path) -> Result<Self, AdmindError> {
        let path = dir.join(SERVER_INFO_FILE);
        let contents = fs::read_to_string(&path).map_err(|e| AdmindError::io(&path, e))?;
        toml::from_str(&contents).map_err(|source| AdmindError::ServerInfo { path, source })
    }

    pub fn write(&self, dir: &Path) -> Result<(), AdmindError> {
        let path = dir.join(SERVER_INFO_FILE);
        let contents = toml::to_string(self).map_err(AdmindError::ServerInfoEncode)?;
        write_atomic(&path, contents.as_bytes()).map_err(|e| AdmindError::io(&path, e))
    }
}

/// Whether a process with this pid exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Resolves a server name to its control directory.
pub trait Locator: Send + Sync {
    /// The control directory of a live server, or `None` if it is not
    /// running.
    fn locate(&self, server: &str) -> Option<PathBuf>;
}

/// Finds servers under a run directory: `<run_dir>/<name>/server.toml`.
#[derive(Debug, Clone)]
pub struct DirectoryLocator {
    run_dir: PathBuf,
}

impl DirectoryLocator {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Control directory for `server`, whether or not it is live.
    pub fn server_dir(&self, server: &str) -> PathBuf {
        self.run_dir.join(server)
    }
}

impl Locator for DirectoryLocator {
    fn locate(&self, server: &str) -> Option<PathBuf> {
        let dir = self.server_dir(server);
        let info = ServerInfo::read(&dir).ok()?;
        process_alive(info.pid).then_some(dir)
    }
}
