//! Configuration for ladmin.
//!
//! Read from `$LADMIN_CONFIG`, or `<config_dir>/ladmin/config.toml`. A
//! missing file means defaults; every field may be left out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "LADMIN_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admind: AdmindConfig,
    #[serde(default)]
    pub telnet: TelnetConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

impl Config {
    /// Load configuration from disk, or return default if not found
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate();
        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
            return PathBuf::from(path);
        }
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("ladmin").join("config.toml")
    }

    /// Where the interactive client keeps its log.
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("ladmin")
    }

    /// Clamp intervals into usable ranges
    pub fn validate(&mut self) {
        self.server.validate();
        self.admind.validate();
        self.telnet.validate();
        self.console.validate();
    }
}

/// The managed server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used to find the admin directory
    pub name: String,
    /// Program started by `ladmin start`
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    /// Working directory of the launched server
    pub working_dir: Option<PathBuf>,
    /// Run in the foreground by `ladmin stop` when the server cannot be reached
    pub stop_command: Option<PathBuf>,
    pub stop_args: Vec<String>,
    pub start_timeout_ms: u64,
    /// Daemon stdout and stderr
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            stop_command: None,
            stop_args: Vec::new(),
            start_timeout_ms: 15_000,
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&mut self) {
        self.start_timeout_ms = self.start_timeout_ms.clamp(100, 600_000);
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Admin directory access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmindConfig {
    /// Parent of every server's control directory
    pub run_dir: Option<PathBuf>,
    /// How long `shell` waits for RUNNING
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// How long one-shot commands wait for READY
    pub request_timeout_ms: u64,
}

impl Default for AdmindConfig {
    fn default() -> Self {
        Self {
            run_dir: None,
            connect_timeout_ms: 5_000,
            poll_interval_ms: 50,
            request_timeout_ms: 30_000,
        }
    }
}

impl AdmindConfig {
    pub fn validate(&mut self) {
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(100, 600_000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(5, 1_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(100, 3_600_000);
    }

    pub fn run_dir(&self) -> PathBuf {
        self.run_dir.clone().unwrap_or_else(default_run_dir)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// `$XDG_RUNTIME_DIR/ladmin`, or a per-user directory under /tmp.
pub fn default_run_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("ladmin"),
        None => PathBuf::from(format!("/tmp/ladmin-{}", nix::unistd::getuid())),
    }
}

/// Raw socket console
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub host: String,
    pub port: u16,
    pub handshake_timeout_ms: u64,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6523,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl TelnetConfig {
    pub fn validate(&mut self) {
        self.handshake_timeout_ms = self.handshake_timeout_ms.clamp(100, 60_000);
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Interactive loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub idle_sleep_ms: u64,
    /// Quiet period after the last resize before the size is sent
    pub resize_settle_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 20,
            resize_settle_ms: 500,
        }
    }
}

impl ConsoleConfig {
    pub fn validate(&mut self) {
        self.idle_sleep_ms = self.idle_sleep_ms.clamp(1, 200);
        self.resize_settle_ms = self.resize_settle_ms.min(5_000);
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn resize_settle(&self) -> Duration {
        Duration::from_millis(self.resize_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.name, "default");
        assert_eq!(config.server.start_timeout(), Duration::from_millis(15_000));
        assert_eq!(config.admind.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.admind.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.telnet.port, 6523);
        assert_eq!(config.console.idle_sleep(), Duration::from_millis(20));
        assert_eq!(config.console.resize_settle(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.name, "default");
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
name = "billing"
command = "/opt/billing/bin/server"
args = ["--port", "9000"]

[admind]
run_dir = "/run/admin"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.name, "billing");
        assert_eq!(
            config.server.command.as_deref(),
            Some(Path::new("/opt/billing/bin/server"))
        );
        assert_eq!(config.server.args, vec!["--port", "9000"]);
        assert_eq!(config.server.start_timeout_ms, 15_000);
        assert_eq!(config.admind.run_dir(), PathBuf::from("/run/admin"));
        assert_eq!(config.telnet.host, "localhost");
    }

    #[test]
    fn test_validate_clamps_intervals() {
        let mut config = Config::default();
        config.admind.poll_interval_ms = 0;
        config.console.idle_sleep_ms = 10_000;
        config.server.start_timeout_ms = 1;
        config.validate();

        assert_eq!(config.admind.poll_interval_ms, 5);
        assert_eq!(config.console.idle_sleep_ms, 200);
        assert_eq!(config.server.start_timeout_ms, 100);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nname = 1").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }
}
