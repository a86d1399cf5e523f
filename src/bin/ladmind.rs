//! ladmind: reference administration daemon.
//!
//! Publishes a control directory under the run dir and serves requests
//! dropped into it:
//!   shell     PTY-backed shell bridged to the request channels
//!   status    pid, uptime and open sessions
//!   echo      returns the payload
//!   shutdown  answers, then removes the directory and exits

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use tracing::{debug, info, warn};

use ladmin::admind::{
    AdminDirectory, DirectoryLocator, IncomingRequest, ServerInfo, ShellSession,
};
use ladmin::config::default_run_dir;
use ladmin::logging::{self, LogTarget};

/// How long a shutdown answer stays readable before the directory goes away.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const LOOP_SLEEP: Duration = Duration::from_millis(10);

/// How long an answered request waits for its client to close it.
const ANSWER_TTL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "ladmind", version, about = "Reference administration daemon")]
struct Args {
    /// Server name; the control directory is `<run-dir>/<name>`.
    #[arg(long, env = "LADMIN_SERVER", default_value = "default")]
    name: String,

    #[arg(long, env = "LADMIN_RUN_DIR")]
    run_dir: Option<PathBuf>,

    /// Shell started for `shell` requests.
    #[arg(long, env = "SHELL", default_value = "/bin/sh")]
    shell: String,

    /// Recorded in server.toml for clients to find.
    #[arg(long, env = "LADMIN_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    logging::init(LogTarget::Stderr, level)?;

    let run_dir = args.run_dir.clone().unwrap_or_else(default_run_dir);
    let dir = DirectoryLocator::new(run_dir).server_dir(&args.name);
    let directory = AdminDirectory::create(&dir, &ServerInfo::current(args.log_file.clone()))
        .with_context(|| format!("Failed to publish {}", dir.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT, SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("Failed to register signal handler")?;
    }

    info!(name = %args.name, dir = %dir.display(), "ladmind started");
    let mut daemon = Daemon::new(directory, args.shell);
    daemon.run(&shutdown);
    daemon.stop()?;
    info!("ladmind stopped");

    Ok(())
}

struct Daemon {
    directory: AdminDirectory,
    shell: String,
    started: Instant,
    sessions: Vec<ShellSession>,
    /// The shutdown request and when it was answered.
    stopping: Option<(IncomingRequest, Instant)>,
}

impl Daemon {
    fn new(directory: AdminDirectory, shell: String) -> Self {
        Self {
            directory,
            shell,
            started: Instant::now(),
            sessions: Vec::new(),
            stopping: None,
        }
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) && !self.stop_due() {
            match self.directory.accept() {
                Ok(requests) => {
                    for request in requests {
                        self.dispatch(request);
                    }
                }
                Err(e) => warn!(error = %e, "failed to scan requests"),
            }

            self.pump_sessions();
            let released = self.directory.reap(ANSWER_TTL);
            if released > 0 {
                debug!(released, "answered requests released");
            }

            thread::sleep(LOOP_SLEEP);
        }
    }

    fn stop_due(&self) -> bool {
        self.stopping.as_ref().is_some_and(|(request, since)| {
            request.is_closed() || since.elapsed() >= SHUTDOWN_GRACE
        })
    }

    fn dispatch(&mut self, request: IncomingRequest) {
        let command = request.command().to_string();
        info!(token = request.token(), command = %command, "dispatching request");
        let outcome = match command.as_str() {
            "shell" => match request.start() {
                Ok(channels) => {
                    let session = ShellSession::new(request, channels, &self.shell);
                    self.sessions.push(session);
                    return;
                }
                Err(e) => Err(e.to_string()),
            },
            "status" => request.respond(&self.status()).map_err(|e| e.to_string()),
            "echo" => request
                .respond(request.payload())
                .map_err(|e| e.to_string()),
            "shutdown" => match request.respond("Shutting down") {
                Ok(()) => {
                    if self.stopping.is_none() {
                        self.stopping = Some((request, Instant::now()));
                        return;
                    }
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            },
            other => Err(format!("Unknown command '{other}'")),
        };

        if let Err(message) = outcome {
            warn!(token = request.token(), %message, "request failed");
            if let Err(e) = request.fail(&message) {
                warn!(token = request.token(), error = %e, "could not report failure");
            }
        }
        self.directory.settle(request);
    }

    fn status(&self) -> String {
        format!(
            "pid {} up {}s, {} shell session(s)",
            std::process::id(),
            self.started.elapsed().as_secs(),
            self.sessions.len()
        )
    }

    fn pump_sessions(&mut self) {
        let mut ended = Vec::new();
        self.sessions.retain_mut(|session| match session.pump() {
            Ok(true) => true,
            Ok(false) => {
                ended.push((session.request().clone(), None));
                false
            }
            Err(e) => {
                ended.push((session.request().clone(), Some(format!("{e:#}"))));
                false
            }
        });

        for (request, failure) in ended {
            let published = match failure {
                Some(message) => {
                    warn!(token = request.token(), %message, "shell session failed");
                    request.fail(&message)
                }
                None if request.is_closed() => Ok(()),
                None => request.finish(),
            };
            if let Err(e) = published {
                warn!(token = request.token(), error = %e, "could not publish session end");
            }
            self.directory.settle(request);
        }
    }

    /// Kill remaining shells and remove the directory.
    fn stop(mut self) -> Result<()> {
        self.sessions.clear();
        self.directory
            .remove()
            .context("Failed to remove the admin directory")
    }
}
