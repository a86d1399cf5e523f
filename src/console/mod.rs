//! Interactive proxy loop.
//!
//! One cooperative loop per session. Every iteration checks the link,
//! copies whatever remote output is ready to the screen, copies whatever
//! keystrokes are ready to the remote side, and only sleeps when neither
//! direction moved a byte. Nothing in the loop blocks.

mod resize;
mod session;
mod tail;
mod telnet;

pub use resize::{ResizeDebouncer, RESIZE_SETTLE};
pub use session::SessionTransport;
pub use tail::{LogFollower, TailSession};
pub use telnet::TelnetTransport;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::admind::protocol::encode_keystroke;
use crate::terminal::{Console, TerminalInfo};

/// Sleep between iterations that moved no bytes.
pub const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Ctrl+D
pub const LOGOUT_KEY: u8 = 0x04;
/// Ctrl+Z, as it arrives in raw mode
pub const SUSPEND_KEY: u8 = 0x1A;

const BUFFER_SIZE: usize = 4096;

/// State of the remote end, as reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    /// The remote work completed normally.
    Finished,
    /// The remote side asked us to log out.
    Logout,
    /// The remote side vanished.
    Gone,
    /// The remote side reported a failure.
    Failed(String),
}

/// Result of one non-blocking read from a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes came off the wire (possibly fewer were displayable).
    Data(usize),
    Eof,
}

/// The remote end of an interactive session.
pub trait Transport {
    fn status(&mut self) -> LinkStatus;

    /// Read output that is already available and append its displayable
    /// part to `out`. Never blocks.
    fn read_available(&mut self, out: &mut Vec<u8>) -> io::Result<ReadOutcome>;

    /// Send encoded keystrokes.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn send_window_size(&mut self, info: &TerminalInfo) -> io::Result<()>;

    /// Release the remote channels. Called exactly once per session.
    fn release(&mut self);
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Ctrl+D.
    Logout,
    /// Ctrl+Z or SIGTSTP.
    Suspended,
    /// The remote side requested logout.
    RemoteLogout,
    /// The remote stream hit end of file.
    ConnectionClosed,
    /// Local input hit end of file.
    LocalEof,
    /// The remote work completed.
    Finished,
    /// The daemon vanished.
    Gone,
    Failed(String),
    /// A termination signal arrived.
    Shutdown,
}

impl ExitReason {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl LinkStatus {
    /// How a session ends on this status, or `None` while the link is open.
    pub fn exit_reason(self) -> Option<ExitReason> {
        match self {
            Self::Open => None,
            Self::Finished => Some(ExitReason::Finished),
            Self::Logout => Some(ExitReason::RemoteLogout),
            Self::Gone => Some(ExitReason::Gone),
            Self::Failed(message) => Some(ExitReason::Failed(message)),
        }
    }
}

/// A live session between a console and a transport.
///
/// Owns both ends. Raw mode is entered by [`run`](Self::run) and restored,
/// together with releasing the transport, exactly once on every way out,
/// including a panic unwinding through the loop.
pub struct ConsoleSession<C: Console, T: Transport> {
    console: C,
    transport: T,
    resize: ResizeDebouncer,
    idle_sleep: Duration,
    shutdown: Option<Arc<AtomicBool>>,
    torn_down: bool,
}

impl<C: Console, T: Transport> ConsoleSession<C, T> {
    pub fn new(console: C, transport: T) -> Self {
        Self {
            console,
            transport,
            resize: ResizeDebouncer::default(),
            idle_sleep: IDLE_SLEEP,
            shutdown: None,
            torn_down: false,
        }
    }

    pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn resize_settle(mut self, settle: Duration) -> Self {
        self.resize = ResizeDebouncer::new(settle);
        self
    }

    /// End the session with [`ExitReason::Shutdown`] once `flag` is set.
    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Run until one side ends the session.
    pub fn run(mut self) -> io::Result<ExitReason> {
        self.console.enter_raw_mode()?;
        let result = self.pump();
        self.teardown();

        match &result {
            Ok(reason) => info!(?reason, "console session ended"),
            Err(e) => warn!(error = %e, "console session failed"),
        }
        result
    }

    fn shutdown_requested(&self) -> bool {
        let flag = self.shutdown.as_ref();
        flag.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn pump(&mut self) -> io::Result<ExitReason> {
        let mut remote = Vec::with_capacity(BUFFER_SIZE);
        let mut local = [0u8; BUFFER_SIZE];
        let mut encoded = Vec::with_capacity(BUFFER_SIZE * 2);

        loop {
            // Liveness
            if self.shutdown_requested() {
                return Ok(ExitReason::Shutdown);
            }
            if let Some(reason) = self.transport.status().exit_reason() {
                if matches!(reason, ExitReason::Finished | ExitReason::Gone) {
                    self.drain_remote(&mut remote);
                }
                return Ok(reason);
            }

            // Signals
            let events = self.console.take_events();
            if events.suspended {
                return Ok(ExitReason::Suspended);
            }
            let now = Instant::now();
            if events.resized {
                self.resize.touch(now);
            }
            if self.resize.take_due(now) {
                let info = self.console.refresh_size()?;
                let (width, height) = (info.width, info.height);
                debug!(width, height, "sending window size");
                self.transport.send_window_size(&info)?;
            }

            // Remote to local
            remote.clear();
            let mut moved = match self.transport.read_available(&mut remote)? {
                ReadOutcome::Eof => return Ok(ExitReason::ConnectionClosed),
                ReadOutcome::Data(count) => count > 0,
            };
            if !remote.is_empty() {
                self.console.write_output(&remote)?;
            }

            // Local to remote
            match self.console.read_available(&mut local)? {
                None => return Ok(ExitReason::LocalEof),
                Some(0) => {}
                Some(count) => {
                    moved = true;
                    encoded.clear();
                    let exit = encode_keys(&local[..count], &mut encoded);
                    if !encoded.is_empty() {
                        self.transport.send(&encoded)?;
                    }
                    if let Some(reason) = exit {
                        return Ok(reason);
                    }
                }
            }

            if !moved {
                thread::sleep(self.idle_sleep);
            }
        }
    }

    /// Copy out whatever output is left once the remote side is done.
    fn drain_remote(&mut self, remote: &mut Vec<u8>) {
        loop {
            remote.clear();
            match self.transport.read_available(remote) {
                Ok(ReadOutcome::Data(count)) if count > 0 => {
                    if let Err(e) = self.console.write_output(remote) {
                        debug!(error = %e, "dropping remaining output");
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Err(e) = self.console.restore_mode() {
            warn!(error = %e, "failed to restore terminal mode");
        }
        self.transport.release();
    }
}

impl<C: Console, T: Transport> Drop for ConsoleSession<C, T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Encode keystrokes for the remote side, stopping at a key that ends the
/// session. Ctrl+D is still sent; Ctrl+Z is not.
fn encode_keys(keys: &[u8], out: &mut Vec<u8>) -> Option<ExitReason> {
    for &key in keys {
        match key {
            SUSPEND_KEY => return Some(ExitReason::Suspended),
            LOGOUT_KEY => {
                out.push(key);
                return Some(ExitReason::Logout);
            }
            _ => encode_keystroke(key, out),
        }
    }
    None
}
