//! Local terminal handling for the interactive console.
//!
//! The proxy loop only talks to the [`Console`] trait, so tests can drive it
//! with fakes. [`SystemTerminal`] is the real implementation: crossterm raw
//! mode plus unbuffered, poll-guarded reads from stdin.

mod signals;

pub use signals::SignalFlags;

use std::fs::File;
use std::io::{self, Read, Stdout, Write};
use std::os::fd::{AsFd, BorrowedFd};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Terminal type reported when `$TERM` is unset.
pub const DEFAULT_TERMINAL_TYPE: &str = "xterm";

/// Size used when the terminal cannot be queried (not a tty).
const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Dimensions and type of the local terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
    /// Terminal type as found in `$TERM`.
    pub term_type: String,
}

impl TerminalInfo {
    pub fn new(width: u16, height: u16, term_type: impl Into<String>) -> Self {
        Self {
            width,
            height,
            term_type: term_type.into(),
        }
    }

    /// Query the controlling terminal for its size and read `$TERM`.
    pub fn detect() -> Self {
        let (width, height) = crossterm::terminal::size().unwrap_or(FALLBACK_SIZE);
        let term_type = std::env::var("TERM")
            .ok()
            .filter(|term| !term.is_empty())
            .unwrap_or_else(|| DEFAULT_TERMINAL_TYPE.to_string());
        Self {
            width,
            height,
            term_type,
        }
    }
}

/// Signal-driven events collected since the previous [`Console::take_events`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleEvents {
    /// The window was resized at least once.
    pub resized: bool,
    /// A suspend signal (SIGTSTP) arrived.
    pub suspended: bool,
}

/// The local end of an interactive session.
pub trait Console {
    /// Last known terminal information.
    fn info(&self) -> &TerminalInfo;

    /// Re-read the terminal dimensions after a resize.
    fn refresh_size(&mut self) -> io::Result<TerminalInfo>;

    /// Switch to raw mode, remembering the previous mode.
    fn enter_raw_mode(&mut self) -> io::Result<()>;

    /// Put back the mode saved by [`Console::enter_raw_mode`]. A no-op when
    /// raw mode is not active.
    fn restore_mode(&mut self) -> io::Result<()>;

    /// Read keystrokes that are already available, without blocking.
    ///
    /// Returns `Ok(Some(0))` when nothing is pending and `Ok(None)` once the
    /// local input reached end of file.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write remote output to the screen.
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Collect and clear pending signal events.
    fn take_events(&mut self) -> ConsoleEvents;
}

/// Returns true when `fd` can be read without blocking.
pub fn is_readable(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ready = poll(&mut fds, PollTimeout::ZERO)?;
    Ok(ready > 0)
}

/// The process's own terminal.
pub struct SystemTerminal {
    /// Unbuffered duplicate of stdin, so readiness polling and reads agree.
    input: File,
    output: Stdout,
    info: TerminalInfo,
    raw: bool,
    signals: SignalFlags,
}

impl SystemTerminal {
    /// Open the terminal and start listening for resize and suspend signals.
    pub fn open() -> io::Result<Self> {
        let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
        let signals = SignalFlags::register()?;

        Ok(Self {
            input,
            output: io::stdout(),
            info: TerminalInfo::detect(),
            raw: false,
            signals,
        })
    }
}

impl Console for SystemTerminal {
    fn info(&self) -> &TerminalInfo {
        &self.info
    }

    fn refresh_size(&mut self) -> io::Result<TerminalInfo> {
        let (width, height) = crossterm::terminal::size()?;
        self.info.width = width;
        self.info.height = height;
        Ok(self.info.clone())
    }

    fn enter_raw_mode(&mut self) -> io::Result<()> {
        if !self.raw {
            enable_raw_mode()?;
            self.raw = true;
        }
        Ok(())
    }

    fn restore_mode(&mut self) -> io::Result<()> {
        if !self.raw {
            return Ok(());
        }
        self.raw = false;
        disable_raw_mode()?;

        // Remote line editors may leave bracketed paste switched on
        self.output.write_all(b"\x1b[?2004l")?;
        self.output.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if !is_readable(self.input.as_fd())? {
            return Ok(Some(0));
        }

        match self.input.read(buf) {
            Ok(0) => Ok(None),
            Ok(count) => Ok(Some(count)),
            Err(e) => match e.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(Some(0)),
                _ => Err(e),
            },
        }
    }

    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.write_all(bytes)?;
        self.output.flush()
    }

    fn take_events(&mut self) -> ConsoleEvents {
        self.signals.take()
    }
}

impl Drop for SystemTerminal {
    fn drop(&mut self) {
        let _ = self.restore_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn terminal_info_new_keeps_fields() {
        let info = TerminalInfo::new(132, 43, "vt100");
        assert_eq!(info.width, 132);
        assert_eq!(info.height, 43);
        assert_eq!(info.term_type, "vt100");
    }

    #[test]
    fn is_readable_reports_pending_bytes_only() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        assert!(!is_readable(reader.as_fd()).unwrap());

        writer.write_all(b"x").unwrap();
        assert!(is_readable(reader.as_fd()).unwrap());
    }
}
