//! Client side of the admin directory protocol.
//!
//! A request is a file dropped into the server's control directory; the
//! daemon answers by writing marker files next to it. Every call here is a
//! handful of `stat`s, so [`AdmindClient::poll`] is cheap enough to run on
//! each iteration of the console loop.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::channel::{ChannelReader, ChannelWriter};
use super::protocol::{write_atomic, RequestPaths, RequestRecord};
use super::{AdmindError, Locator, RequestState, ServerInfo};

/// How often [`AdmindClient::wait`] looks at the directory.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A submitted request.
///
/// Shared between the console loop and the shutdown hook, so everything
/// that changes after submit is atomic.
#[derive(Debug)]
pub struct SessionRequest {
    command: String,
    paths: RequestPaths,
    /// Incarnation of the daemon the request was submitted to.
    server_id: String,
    /// Set once ERROR or GONE has been observed.
    settled: OnceLock<RequestState>,
    closed: AtomicBool,
}

impl SessionRequest {
    pub fn token(&self) -> &str {
        self.paths.token()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Channels of a running session, seen from the client.
#[derive(Debug)]
pub struct SessionChannels {
    /// Keystrokes towards the daemon.
    pub input: ChannelWriter,
    /// Output from the daemon.
    pub output: ChannelReader,
}

/// Talks to one named server.
pub struct AdmindClient {
    server: String,
    locator: Arc<dyn Locator>,
    poll_interval: Duration,
}

impl AdmindClient {
    pub fn new(server: impl Into<String>, locator: Arc<dyn Locator>) -> Self {
        Self {
            server: server.into(),
            locator,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// `server.toml` of the live server.
    pub fn server_info(&self) -> Result<ServerInfo, AdmindError> {
        let dir = self
            .admind_dir()
            .ok_or_else(|| AdmindError::ServerNotFound(self.server.clone()))?;
        ServerInfo::read(&dir)
    }

    /// Control directory of the server, if it is live.
    pub fn admind_dir(&self) -> Option<PathBuf> {
        self.locator.locate(&self.server)
    }

    pub fn is_running(&self) -> bool {
        self.admind_dir().is_some()
    }

    /// Submit a request. The token is a fresh UUID, so it is unique for the
    /// daemon's lifetime.
    pub fn submit(&self, command: &str, payload: &str) -> Result<SessionRequest, AdmindError> {
        let dir = self
            .admind_dir()
            .ok_or_else(|| AdmindError::ServerNotFound(self.server.clone()))?;

        let server_id = ServerInfo::read(&dir)?.server_id;
        let token = Uuid::new_v4().to_string();
        let paths = RequestPaths::new(&dir, &token);
        let record = RequestRecord {
            command: command.to_string(),
            payload: payload.to_string(),
        };
        let contents = serde_json::to_vec(&record).map_err(AdmindError::Encode)?;

        let path = paths.request();
        write_atomic(&path, &contents).map_err(|e| AdmindError::io(&path, e))?;
        debug!(server = %self.server, token = %token, command, "request submitted");

        Ok(SessionRequest {
            command: command.to_string(),
            paths,
            server_id,
            settled: OnceLock::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// One non-blocking look at the request.
    pub fn poll(&self, request: &SessionRequest) -> RequestState {
        if let Some(state) = request.settled.get() {
            return *state;
        }

        let state = self.observe(request);
        if state.is_terminal() {
            let settled = *request.settled.get_or_init(|| state);
            debug!(token = request.token(), state = %settled, "request settled");
            return settled;
        }
        state
    }

    fn observe(&self, request: &SessionRequest) -> RequestState {
        let Some(dir) = self.admind_dir() else {
            return RequestState::Gone;
        };
        // A restarted daemon never answers requests of the previous one
        match ServerInfo::read(&dir) {
            Ok(info) if info.server_id == request.server_id => {}
            _ => return RequestState::Gone,
        }

        let paths = &request.paths;
        if paths.error().exists() {
            RequestState::Error
        } else if paths.ready().exists() {
            RequestState::Ready
        } else if paths.running().exists() {
            RequestState::Running
        } else if paths.request().exists() {
            RequestState::Pending
        } else {
            RequestState::Gone
        }
    }

    /// Block until the request reaches `until` (or moves past it), settles
    /// in ERROR/GONE, or `timeout` runs out. Returns the last observed state.
    pub fn wait(
        &self,
        request: &SessionRequest,
        timeout: Duration,
        until: RequestState,
    ) -> RequestState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.poll(request);
            if state.is_terminal() || state.has_reached(until) {
                return state;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(token = request.token(), state = %state, wanted = %until, "wait timed out");
                return state;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// The final payload written by the daemon.
    pub fn response(&self, request: &SessionRequest) -> Result<String, AdmindError> {
        let path = request.paths.response();
        let bytes = fs::read(&path).map_err(|e| AdmindError::io(&path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The daemon's failure text, without side effects.
    pub fn last_error(&self, request: &SessionRequest) -> Option<String> {
        fs::read_to_string(request.paths.error())
            .ok()
            .map(|text| text.trim_end().to_string())
    }

    /// The failure text; also releases the request if it is still active.
    pub fn error(&self, request: &SessionRequest) -> Option<String> {
        let text = self.last_error(request);
        if !self.poll(request).is_terminal() {
            self.close(request);
        }
        text
    }

    /// Release the request so the daemon can tear down whatever runs behind
    /// it. Safe to call repeatedly and from several threads; only the first
    /// call does anything, and only it returns true.
    pub fn close(&self, request: &SessionRequest) -> bool {
        if request.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let path = request.paths.closed();
        match write_atomic(&path, b"") {
            Ok(()) => debug!(token = request.token(), "request released"),
            // The daemon directory is gone; nothing left to release
            Err(e) => debug!(token = request.token(), error = %e, "release marker not written"),
        }
        true
    }

    /// Open the byte channels of a session that is RUNNING. Output stays
    /// readable once the session is READY.
    pub fn open_channels(&self, request: &SessionRequest) -> Result<SessionChannels, AdmindError> {
        let state = self.poll(request);
        if !matches!(state, RequestState::Running | RequestState::Ready) {
            return Err(AdmindError::ChannelsUnavailable {
                token: request.token().to_string(),
                state,
            });
        }

        let output_path = request.paths.response();
        let output =
            ChannelReader::open(&output_path).map_err(|e| AdmindError::io(&output_path, e))?;
        let input_path = request.paths.input();
        let input = ChannelWriter::open(&input_path).map_err(|e| AdmindError::io(&input_path, e))?;

        Ok(SessionChannels { input, output })
    }
}
