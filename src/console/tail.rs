//! Following a server's log file.
//!
//! The log path comes from the server's `server.toml`. The loop has the same
//! shape as the proxy loop: read what is available, write it out, and sleep
//! only when nothing moved.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossterm::style::Stylize;
use tracing::{debug, info};

use super::{ExitReason, BUFFER_SIZE, IDLE_SLEEP};
use crate::admind::{AdmindClient, ChannelReader};
use crate::terminal::Console;

/// Reads a log file as it grows, switching to a new file when the path is
/// rotated to a different inode.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    reader: Option<ChannelReader>,
    inode: Option<u64>,
}

impl LogFollower {
    /// Nothing is opened until [`check_rotation`](Self::check_rotation).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            inode: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file at `path` if it is not the one being read. Returns true
    /// when a new file was opened. A missing file is not an error.
    pub fn check_rotation(&mut self) -> io::Result<bool> {
        let inode = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.ino(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if self.inode == Some(inode) {
            return Ok(false);
        }

        let reader = ChannelReader::open(&self.path)?;
        self.inode = Some(reader.metadata()?.ino());
        self.reader = Some(reader);
        debug!(path = %self.path.display(), inode = ?self.inode, "following log file");
        Ok(true)
    }

    /// Read bytes already in the file. Returns 0 when there is nothing new.
    pub fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_available(buf),
            None => Ok(0),
        }
    }
}

/// Prints a server's log until Ctrl+C or Ctrl+Z.
///
/// The server may come and go while tailing; each time it (re)appears its
/// log file is looked up again.
pub struct TailSession<C: Console> {
    console: C,
    client: AdmindClient,
    idle_sleep: Duration,
    shutdown: Option<Arc<AtomicBool>>,
    /// Id of the server incarnation currently followed.
    connected: Option<String>,
    follower: Option<LogFollower>,
}

impl<C: Console> TailSession<C> {
    pub fn new(console: C, client: AdmindClient) -> Self {
        Self {
            console,
            client,
            idle_sleep: IDLE_SLEEP,
            shutdown: None,
            connected: None,
            follower: None,
        }
    }

    pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Stop with [`ExitReason::Shutdown`] once `flag` is set.
    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn run(mut self) -> io::Result<ExitReason> {
        let mut buf = [0u8; BUFFER_SIZE];

        loop {
            if self.shutdown_requested() {
                return Ok(ExitReason::Shutdown);
            }
            if self.console.take_events().suspended {
                return Ok(ExitReason::Suspended);
            }

            self.track_server()?;

            let count = match self.follower.as_mut() {
                Some(follower) => follower.read_available(&mut buf)?,
                None => 0,
            };
            if count > 0 {
                self.console.write_output(&buf[..count])?;
                continue;
            }

            // The old file is drained, so switching now loses nothing
            if let Some(follower) = self.follower.as_mut() {
                if follower.check_rotation()? {
                    info!(path = %follower.path().display(), "log file rotated");
                    continue;
                }
            }
            thread::sleep(self.idle_sleep);
        }
    }

    fn shutdown_requested(&self) -> bool {
        let flag = self.shutdown.as_ref();
        flag.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn track_server(&mut self) -> io::Result<()> {
        let server = self.client.server().to_string();
        match self.client.server_info() {
            Ok(info) if self.connected.as_deref() != Some(info.server_id.as_str()) => {
                self.notice(&format!("Connected to '{server}' ({})", info.server_id))?;
                match info.log_file {
                    // A restart logging to the same path keeps its offset
                    Some(path) => {
                        let current = self.follower.as_ref().map(LogFollower::path);
                        if current != Some(path.as_path()) {
                            self.follower = Some(LogFollower::new(path));
                        }
                        if let Some(follower) = self.follower.as_mut() {
                            follower.check_rotation()?;
                        }
                    }
                    None => {
                        let message = format!("No log file recorded for '{server}', will not tail");
                        self.notice(&message)?;
                        self.follower = None;
                    }
                }
                self.connected = Some(info.server_id);
            }
            Ok(_) => {}
            Err(_) if self.connected.is_some() => {
                self.notice(&format!("Disconnected from '{server}'"))?;
                self.connected = None;
            }
            Err(_) => {}
        }
        Ok(())
    }

    fn notice(&mut self, message: &str) -> io::Result<()> {
        let line = format!("{}\n", message.blue());
        self.console.write_output(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admind::{AdminDirectory, DirectoryLocator, ServerInfo};
    use crate::terminal::{ConsoleEvents, TerminalInfo};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Suspends once `stop_after` shows up in the output, or at the deadline.
    struct Screen {
        info: TerminalInfo,
        output: Arc<Mutex<Vec<u8>>>,
        stop_after: &'static [u8],
        deadline: Instant,
    }

    impl Console for Screen {
        fn info(&self) -> &TerminalInfo {
            &self.info
        }

        fn refresh_size(&mut self) -> io::Result<TerminalInfo> {
            Ok(self.info.clone())
        }

        fn enter_raw_mode(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn restore_mode(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read_available(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(Some(0))
        }

        fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.output.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn take_events(&mut self) -> ConsoleEvents {
            let output = self.output.lock().unwrap();
            let done = output
                .windows(self.stop_after.len())
                .any(|window| window == self.stop_after);
            ConsoleEvents {
                resized: false,
                suspended: done || Instant::now() >= self.deadline,
            }
        }
    }

    fn screen(stop_after: &'static [u8]) -> (Screen, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let screen = Screen {
            info: TerminalInfo::new(80, 24, "xterm"),
            output: Arc::clone(&output),
            stop_after,
            deadline: Instant::now() + Duration::from_secs(5),
        };
        (screen, output)
    }

    fn client(run_dir: &TempDir) -> AdmindClient {
        AdmindClient::new("app", Arc::new(DirectoryLocator::new(run_dir.path())))
    }

    fn position(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    #[test]
    fn follower_reads_growth_and_switches_on_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.log");
        fs::write(&path, "one\n").unwrap();

        let mut follower = LogFollower::new(&path);
        assert!(follower.check_rotation().unwrap());
        assert!(!follower.check_rotation().unwrap());

        let mut buf = [0u8; 64];
        let count = follower.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"one\n");

        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"two\n")
            .unwrap();
        let count = follower.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"two\n");

        fs::rename(&path, dir.path().join("server.log.1")).unwrap();
        fs::write(&path, "three\n").unwrap();
        assert!(follower.check_rotation().unwrap());
        let count = follower.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..count], b"three\n");
    }

    #[test]
    fn missing_log_is_waited_for() {
        let dir = TempDir::new().unwrap();
        let mut follower = LogFollower::new(dir.path().join("later.log"));

        assert!(!follower.check_rotation().unwrap());
        assert_eq!(follower.read_available(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn tail_follows_the_log_across_rotation() {
        let run_dir = TempDir::new().unwrap();
        let log = run_dir.path().join("server.log");
        fs::write(&log, "one\n").unwrap();
        let locator = DirectoryLocator::new(run_dir.path());
        let info = ServerInfo::current(Some(log.clone()));
        let _server = AdminDirectory::create(&locator.server_dir("app"), &info).unwrap();

        let writer = {
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let mut file = OpenOptions::new().append(true).open(&log).unwrap();
                file.write_all(b"two\n").unwrap();
                thread::sleep(Duration::from_millis(50));
                fs::rename(&log, log.with_extension("log.1")).unwrap();
                fs::write(&log, "three\n").unwrap();
            })
        };

        let (screen, output) = screen(b"three\n");
        let reason = TailSession::new(screen, client(&run_dir))
            .idle_sleep(Duration::from_millis(2))
            .run()
            .unwrap();
        writer.join().unwrap();

        assert_eq!(reason, ExitReason::Suspended);
        let output = output.lock().unwrap();
        let connected = position(&output, b"Connected to 'app'").unwrap();
        let one = position(&output, b"one\n").unwrap();
        let two = position(&output, b"two\n").unwrap();
        let three = position(&output, b"three\n").unwrap();
        assert!(connected < one && one < two && two < three);
    }

    #[test]
    fn server_without_log_file_is_reported() {
        let run_dir = TempDir::new().unwrap();
        let locator = DirectoryLocator::new(run_dir.path());
        let _server =
            AdminDirectory::create(&locator.server_dir("app"), &ServerInfo::current(None)).unwrap();

        let (screen, output) = screen(b"will not tail");
        let reason = TailSession::new(screen, client(&run_dir))
            .idle_sleep(Duration::from_millis(2))
            .run()
            .unwrap();

        assert_eq!(reason, ExitReason::Suspended);
        let output = output.lock().unwrap();
        let notice = b"No log file recorded for 'app'";
        assert!(position(&output, notice).is_some());
    }

    #[test]
    fn shutdown_flag_stops_tail_without_a_server() {
        let run_dir = TempDir::new().unwrap();
        let (screen, output) = screen(b"never printed");
        let flag = Arc::new(AtomicBool::new(true));

        let reason = TailSession::new(screen, client(&run_dir))
            .shutdown_flag(flag)
            .run()
            .unwrap();

        assert_eq!(reason, ExitReason::Shutdown);
        assert!(output.lock().unwrap().is_empty());
    }
}
