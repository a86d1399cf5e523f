//! Process launch supervision.
//!
//! A supervisor thread creates the child and reports back through a
//! [`LaunchWatchdog`]. In daemon mode the launch returns as soon as the
//! process exists; in foreground mode it also waits for the exit status.
//! The child is never killed when the launcher goes away.

mod watchdog;

pub use watchdog::{LaunchState, LaunchWatchdog};

use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a launch may take before it counts as timed out.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to start supervisor thread: {0}")]
    Supervisor(#[source] io::Error),
    #[error("Failed to open launch log {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Return once the process exists; it keeps running on its own.
    Daemon,
    /// Wait for the process to exit.
    Foreground,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Where a daemon's stdout and stderr go. Discarded when unset.
    pub fn log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build(&self, mode: LaunchMode) -> Result<Command, LaunchError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(key, value)| (key, value)));
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        if mode == LaunchMode::Daemon {
            // Own process group, so terminal signals aimed at us skip it
            command.process_group(0);
            command.stdin(Stdio::null());
            match &self.log_file {
                Some(path) => {
                    let log = open_log(path)?;
                    let log_err = log.try_clone().map_err(|source| LaunchError::Log {
                        path: path.clone(),
                        source,
                    })?;
                    command.stdout(log).stderr(log_err);
                }
                None => {
                    command.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }
        }
        Ok(command)
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

fn open_log(path: &Path) -> Result<File, LaunchError> {
    let log_error = |source| LaunchError::Log {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(log_error)
}

/// How a launch ended.
#[derive(Debug)]
pub struct LaunchReport {
    pub state: LaunchState,
    pub pid: Option<u32>,
    /// Why the process could not be created.
    pub failure: Option<String>,
    /// Exit status of a foreground launch.
    pub exit_status: Option<ExitStatus>,
}

impl LaunchReport {
    pub fn is_started(&self) -> bool {
        self.state == LaunchState::Started
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.and_then(|status| status.code())
    }
}

/// Starts processes and waits for them to come up.
#[derive(Debug, Clone)]
pub struct Launcher {
    start_timeout: Duration,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(DEFAULT_START_TIMEOUT)
    }
}

impl Launcher {
    pub fn new(start_timeout: Duration) -> Self {
        Self { start_timeout }
    }

    /// Launch `command` and wait for STARTED, FAILED or TIMED_OUT. A
    /// foreground launch that started also waits for the process to exit.
    pub fn launch(
        &self,
        command: &LaunchCommand,
        mode: LaunchMode,
    ) -> Result<LaunchReport, LaunchError> {
        let process = command.build(mode)?;
        let watchdog = Arc::new(LaunchWatchdog::new());
        let supervisor_watchdog = Arc::clone(&watchdog);

        info!(command = %command, ?mode, "launching");
        let supervisor = thread::Builder::new()
            .name("launch-supervisor".to_string())
            .spawn(move || supervise(process, &supervisor_watchdog, mode))
            .map_err(LaunchError::Supervisor)?;

        let state = watchdog.wait_for_started(self.start_timeout);
        let mut report = LaunchReport {
            state,
            pid: watchdog.pid(),
            failure: watchdog.failure_reason(),
            exit_status: None,
        };

        match state {
            LaunchState::Started if mode == LaunchMode::Foreground => {
                report.exit_status = supervisor.join().unwrap_or_else(|_| {
                    warn!("launch supervisor panicked");
                    None
                });
                debug!(status = ?report.exit_status, "foreground process exited");
            }
            LaunchState::Started => info!(pid = ?report.pid, "process started"),
            LaunchState::Failed => warn!(cause = ?report.failure, "launch failed"),
            LaunchState::TimedOut | LaunchState::Starting => {
                let timeout_ms = self.start_timeout.as_millis() as u64;
                warn!(timeout_ms, "launch timed out");
            }
        }
        Ok(report)
    }
}

/// Runs on the supervisor thread.
fn supervise(
    mut process: Command,
    watchdog: &LaunchWatchdog,
    mode: LaunchMode,
) -> Option<ExitStatus> {
    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(e) => {
            watchdog.fail(e.to_string());
            return None;
        }
    };

    if !watchdog.started(child.id()) {
        let pid = child.id();
        warn!(pid, "process started after the launch was given up");
    }

    match mode {
        // Dropping the handle neither kills nor waits
        LaunchMode::Daemon => None,
        LaunchMode::Foreground => match child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "failed to wait for foreground process");
                None
            }
        },
    }
}
