//! PTY-backed shell sessions served by the daemon.
//!
//! The shell is only spawned once the client's terminal prelude has arrived,
//! so it starts with the right size and `TERM`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info, warn};

use super::protocol::{ControlDecoder, ControlEvent};
use super::server::{IncomingRequest, ServerChannels};
use crate::terminal::DEFAULT_TERMINAL_TYPE;

const READ_BUFFER: usize = 4096;

/// A running shell process and its PTY.
struct ShellPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    /// Output chunks from the reader thread.
    output_rx: Receiver<Vec<u8>>,
    _reader_thread: thread::JoinHandle<()>,
    /// Cleared by the reader thread on EOF.
    alive: Arc<AtomicBool>,
    child: Box<dyn Child + Send + Sync>,
}

impl ShellPty {
    fn spawn(shell: &str, term_type: &str, cols: u16, rows: u16) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", term_type);
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {shell}"))?;
        // The master only sees EOF once every slave handle is closed
        drop(pair.slave);

        let master = pair.master;
        let writer = master.take_writer().context("Failed to get PTY writer")?;
        let mut reader = master
            .try_clone_reader()
            .context("Failed to get PTY reader")?;

        let (tx, output_rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let alive_clone = Arc::clone(&alive);

        let reader_thread = thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            alive_clone.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            master,
            writer,
            output_rx,
            _reader_thread: reader_thread,
            alive,
            child,
        })
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst) && matches!(self.child.try_wait(), Ok(None))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .context("Failed to resize PTY")
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// One interactive `shell` request.
pub struct ShellSession {
    request: IncomingRequest,
    channels: ServerChannels,
    decoder: ControlDecoder,
    shell: String,
    term_type: String,
    cols: u16,
    rows: u16,
    /// Keystrokes that arrived before the shell was spawned.
    pending_input: Vec<u8>,
    pty: Option<ShellPty>,
}

impl ShellSession {
    pub fn new(request: IncomingRequest, channels: ServerChannels, shell: &str) -> Self {
        Self {
            request,
            channels,
            decoder: ControlDecoder::new(),
            shell: shell.to_string(),
            term_type: DEFAULT_TERMINAL_TYPE.to_string(),
            cols: 80,
            rows: 24,
            pending_input: Vec::new(),
            pty: None,
        }
    }

    pub fn request(&self) -> &IncomingRequest {
        &self.request
    }

    /// Move pending bytes in both directions. Returns false once the shell
    /// exited or the client released the request.
    pub fn pump(&mut self) -> Result<bool> {
        if self.request.is_closed() {
            let token = self.request.token();
            debug!(token, "client released shell session");
            self.terminate();
            return Ok(false);
        }

        let mut buf = [0u8; READ_BUFFER];
        let count = self.channels.input.read_available(&mut buf)?;
        if count > 0 {
            for event in self.decoder.feed(&buf[..count]) {
                self.apply(event)?;
            }
        }

        let Some(pty) = self.pty.as_mut() else {
            return Ok(true);
        };
        while let Ok(data) = pty.output_rx.try_recv() {
            self.channels.output.write(&data)?;
        }

        if pty.is_alive() {
            return Ok(true);
        }
        // Late output from the reader thread
        while let Ok(data) = pty.output_rx.try_recv() {
            self.channels.output.write(&data)?;
        }
        self.pty = None;
        info!(token = self.request.token(), "shell exited");
        Ok(false)
    }

    fn apply(&mut self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::TerminalType(term_type) => self.term_type = term_type,
            ControlEvent::WindowSize { width, height } => {
                self.cols = width;
                self.rows = height;
                if let Some(pty) = &self.pty {
                    pty.resize(width, height)?;
                }
            }
            ControlEvent::PreludeComplete => self.spawn()?,
            ControlEvent::Data(bytes) => match self.pty.as_mut() {
                Some(pty) => pty.write(&bytes)?,
                None => self.pending_input.extend_from_slice(&bytes),
            },
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<()> {
        let mut pty = ShellPty::spawn(&self.shell, &self.term_type, self.cols, self.rows)?;
        info!(
            token = self.request.token(),
            shell = %self.shell,
            term = %self.term_type,
            cols = self.cols,
            rows = self.rows,
            "shell started"
        );
        if !self.pending_input.is_empty() {
            pty.write(&std::mem::take(&mut self.pending_input))?;
        }
        self.pty = Some(pty);
        Ok(())
    }

    fn terminate(&mut self) {
        if let Some(mut pty) = self.pty.take() {
            if let Err(e) = pty.child.kill() {
                warn!(token = self.request.token(), error = %e, "failed to kill shell");
            }
            let _ = pty.child.wait();
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admind::protocol::{encode_terminal_info, RequestPaths};
    use crate::admind::{AdminDirectory, ChannelWriter, ServerInfo};
    use crate::terminal::TerminalInfo;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn closing_the_request_kills_the_shell() {
        let root = TempDir::new().unwrap();
        let info = ServerInfo::current(None);
        let mut admind = AdminDirectory::create(&root.path().join("app"), &info).unwrap();
        let paths = RequestPaths::new(admind.path(), "t1");
        fs::write(paths.request(), r#"{"command":"shell","payload":"true"}"#).unwrap();

        let request = admind.accept().unwrap().remove(0);
        let channels = request.start().unwrap();
        let mut session = ShellSession::new(request, channels, "/bin/cat");

        let mut input = ChannelWriter::open(&paths.input()).unwrap();
        let prelude = encode_terminal_info(&TerminalInfo::new(80, 24, "dumb"));
        input.write(&prelude).unwrap();
        assert!(session.pump().unwrap());
        assert!(session.pty.is_some());

        fs::write(paths.closed(), "").unwrap();
        assert!(!session.pump().unwrap());
        assert!(session.pty.is_none());
    }
}
