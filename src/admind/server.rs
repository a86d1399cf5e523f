//! Daemon side of the admin directory protocol.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::channel::{ChannelReader, ChannelWriter};
use super::protocol::{write_atomic, RequestPaths, RequestRecord, REQUESTS_DIR, REQUEST_EXT};
use super::{process_alive, AdmindError, ServerInfo};

/// A published control directory.
#[derive(Debug)]
pub struct AdminDirectory {
    dir: PathBuf,
    requests: PathBuf,
    /// Tokens already handed out by [`AdminDirectory::accept`].
    seen: HashSet<String>,
    /// Answered requests waiting for their client to close them.
    settled: Vec<(IncomingRequest, Instant)>,
}

impl AdminDirectory {
    /// Publish `dir` for the server described by `info`.
    ///
    /// Leftover requests from an earlier daemon are discarded. Fails if the
    /// directory belongs to another live process.
    pub fn create(dir: &Path, info: &ServerInfo) -> Result<Self, AdmindError> {
        if let Ok(existing) = ServerInfo::read(dir) {
            if existing.pid != info.pid && process_alive(existing.pid) {
                return Err(AdmindError::AlreadyRunning {
                    path: dir.to_path_buf(),
                    pid: existing.pid,
                });
            }
        }

        let requests = dir.join(REQUESTS_DIR);
        if requests.exists() {
            fs::remove_dir_all(&requests).map_err(|e| AdmindError::io(&requests, e))?;
        }
        fs::create_dir_all(&requests).map_err(|e| AdmindError::io(&requests, e))?;
        info.write(dir)?;

        debug!(dir = %dir.display(), pid = info.pid, "admin directory published");
        Ok(Self {
            dir: dir.to_path_buf(),
            requests,
            seen: HashSet::new(),
            settled: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Requests submitted since the previous call.
    ///
    /// A request whose body cannot be parsed is failed on the spot and not
    /// returned.
    pub fn accept(&mut self) -> Result<Vec<IncomingRequest>, AdmindError> {
        let entries = fs::read_dir(&self.requests).map_err(|e| AdmindError::io(&self.requests, e))?;

        let mut incoming = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(REQUEST_EXT) {
                continue;
            }
            let Some(token) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !self.seen.insert(token.to_string()) {
                continue;
            }

            let paths = RequestPaths::new(&self.dir, token);
            match read_record(&path) {
                Ok(record) => {
                    debug!(token, command = %record.command, "request accepted");
                    incoming.push(IncomingRequest { paths, record });
                }
                Err(e) => {
                    warn!(token, error = %e, "rejecting malformed request");
                    let rejected = IncomingRequest {
                        paths,
                        record: RequestRecord {
                            command: String::new(),
                            payload: String::new(),
                        },
                    };
                    if let Err(e) = rejected.fail(&format!("Malformed request: {e}")) {
                        warn!(token, error = %e, "could not report malformed request");
                    }
                    self.settle(rejected);
                }
            }
        }
        Ok(incoming)
    }

    /// Hand over a request that got its final answer. Its files stay until
    /// [`reap`](Self::reap) sees it closed or expired.
    pub fn settle(&mut self, request: IncomingRequest) {
        self.settled.push((request, Instant::now()));
    }

    /// Answered requests still waiting for their client.
    pub fn pending_release(&self) -> usize {
        self.settled.len()
    }

    /// Release answered requests the client closed, and those whose client
    /// has not closed them within `ttl`. Returns how many were released.
    pub fn reap(&mut self, ttl: Duration) -> usize {
        let before = self.settled.len();
        let seen = &mut self.seen;
        self.settled.retain(|(request, since)| {
            let closed = request.is_closed();
            if !closed && since.elapsed() < ttl {
                return true;
            }
            if !closed {
                let token = request.token();
                debug!(token, "releasing request abandoned by its client");
            }
            request.release();
            seen.remove(request.token());
            false
        });
        before - self.settled.len()
    }

    /// Remove the whole directory. Clients see GONE afterwards.
    pub fn remove(self) -> Result<(), AdmindError> {
        fs::remove_dir_all(&self.dir).map_err(|e| AdmindError::io(&self.dir, e))
    }
}

fn read_record(path: &Path) -> Result<RequestRecord, AdmindError> {
    let contents = fs::read(path).map_err(|e| AdmindError::io(path, e))?;
    serde_json::from_slice(&contents).map_err(|source| AdmindError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Channels of a running session, seen from the daemon.
#[derive(Debug)]
pub struct ServerChannels {
    /// Client keystrokes.
    pub input: ChannelReader,
    /// Output towards the client.
    pub output: ChannelWriter,
}

/// A request picked up by the daemon.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    paths: RequestPaths,
    record: RequestRecord,
}

impl IncomingRequest {
    pub fn token(&self) -> &str {
        self.paths.token()
    }

    pub fn command(&self) -> &str {
        &self.record.command
    }

    pub fn payload(&self) -> &str {
        &self.record.payload
    }

    /// Create both channels, then publish RUNNING.
    pub fn start(&self) -> Result<ServerChannels, AdmindError> {
        let input_path = self.paths.input();
        File::create(&input_path).map_err(|e| AdmindError::io(&input_path, e))?;
        let response_path = self.paths.response();
        let output = ChannelWriter::create(&response_path)
            .map_err(|e| AdmindError::io(&response_path, e))?;
        let input = ChannelReader::open(&input_path).map_err(|e| AdmindError::io(&input_path, e))?;

        self.mark(&self.paths.running(), b"")?;
        Ok(ServerChannels { input, output })
    }

    /// Store the final payload and publish READY.
    pub fn respond(&self, payload: &str) -> Result<(), AdmindError> {
        self.mark(&self.paths.response(), payload.as_bytes())?;
        self.finish()
    }

    /// Publish READY for a session whose output was streamed.
    pub fn finish(&self) -> Result<(), AdmindError> {
        self.mark(&self.paths.ready(), b"")
    }

    /// Publish ERROR with `message`.
    pub fn fail(&self, message: &str) -> Result<(), AdmindError> {
        self.mark(&self.paths.error(), message.as_bytes())
    }

    /// Whether the client released the request.
    pub fn is_closed(&self) -> bool {
        self.paths.closed().exists()
    }

    /// Delete every file of this request.
    pub fn release(&self) {
        for path in self.paths.all() {
            let _ = fs::remove_file(path);
        }
        debug!(token = self.token(), "request files removed");
    }

    fn mark(&self, path: &Path, contents: &[u8]) -> Result<(), AdmindError> {
        write_atomic(path, contents).map_err(|e| AdmindError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publish(root: &TempDir) -> AdminDirectory {
        AdminDirectory::create(&root.path().join("app"), &ServerInfo::current(None)).unwrap()
    }

    fn drop_request(admind: &AdminDirectory, token: &str, body: &str) {
        fs::write(RequestPaths::new(admind.path(), token).request(), body).unwrap();
    }

    #[test]
    fn accept_returns_each_request_once() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "t1", r#"{"command":"status","payload":""}"#);

        let first = admind.accept().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].token(), "t1");
        assert_eq!(first[0].command(), "status");
        assert!(admind.accept().unwrap().is_empty());
    }

    #[test]
    fn temporary_files_are_ignored() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        let tmp = admind.path().join(REQUESTS_DIR).join("t1.request.tmp");
        fs::write(tmp, "{").unwrap();

        assert!(admind.accept().unwrap().is_empty());
    }

    #[test]
    fn malformed_request_is_failed() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "bad", "not json");

        assert!(admind.accept().unwrap().is_empty());
        let error = fs::read_to_string(RequestPaths::new(admind.path(), "bad").error()).unwrap();
        assert!(error.starts_with("Malformed request"));
    }

    #[test]
    fn start_creates_channels_before_running() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "t1", r#"{"command":"shell","payload":"true"}"#);
        let request = admind.accept().unwrap().remove(0);

        let mut channels = request.start().unwrap();
        let paths = RequestPaths::new(admind.path(), "t1");
        assert!(paths.running().exists());
        assert!(paths.input().exists());

        channels.output.write(b"prompt> ").unwrap();
        assert_eq!(fs::read(paths.response()).unwrap(), b"prompt> ");
    }

    #[test]
    fn release_removes_everything() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "t1", r#"{"command":"status"}"#);
        let request = admind.accept().unwrap().remove(0);
        request.respond("fine").unwrap();
        fs::write(RequestPaths::new(admind.path(), "t1").closed(), "").unwrap();
        assert!(request.is_closed());

        request.release();
        let left: Vec<_> = fs::read_dir(admind.path().join(REQUESTS_DIR))
            .unwrap()
            .collect();
        assert!(left.is_empty());
    }

    #[test]
    fn reap_releases_closed_requests_only() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "t1", r#"{"command":"status"}"#);
        drop_request(&admind, "t2", r#"{"command":"status"}"#);
        for request in admind.accept().unwrap() {
            request.respond("fine").unwrap();
            admind.settle(request);
        }
        fs::write(RequestPaths::new(admind.path(), "t1").closed(), "").unwrap();

        assert_eq!(admind.reap(Duration::from_secs(600)), 1);
        assert_eq!(admind.pending_release(), 1);
        assert!(!RequestPaths::new(admind.path(), "t1").request().exists());
        assert!(RequestPaths::new(admind.path(), "t2").ready().exists());
    }

    #[test]
    fn reap_expires_abandoned_requests() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "t1", r#"{"command":"status"}"#);
        let request = admind.accept().unwrap().remove(0);
        request.respond("fine").unwrap();
        admind.settle(request);

        assert_eq!(admind.reap(Duration::ZERO), 1);
        assert_eq!(admind.pending_release(), 0);
        assert!(admind.seen.is_empty());
        let left: Vec<_> = fs::read_dir(admind.path().join(REQUESTS_DIR))
            .unwrap()
            .collect();
        assert!(left.is_empty());
    }

    #[test]
    fn malformed_requests_are_reaped_too() {
        let root = TempDir::new().unwrap();
        let mut admind = publish(&root);
        drop_request(&admind, "bad", "not json");
        admind.accept().unwrap();

        assert_eq!(admind.pending_release(), 1);
        assert_eq!(admind.reap(Duration::ZERO), 1);
        assert!(admind.seen.is_empty());
    }

    #[test]
    fn stale_requests_are_cleared_on_create() {
        let root = TempDir::new().unwrap();
        let admind = publish(&root);
        drop_request(&admind, "old", r#"{"command":"status"}"#);
        drop(admind);

        let mut admind = publish(&root);
        assert!(admind.accept().unwrap().is_empty());
    }

    #[test]
    fn live_owner_blocks_create() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("app");
        fs::create_dir_all(&dir).unwrap();
        let mut owner = ServerInfo::current(None);
        // pid 1 is always alive
        owner.pid = 1;
        owner.write(&dir).unwrap();

        let err = AdminDirectory::create(&dir, &ServerInfo::current(None)).unwrap_err();
        assert!(matches!(err, AdmindError::AlreadyRunning { pid: 1, .. }));
    }
}
