//! On-disk layout and wire bytes shared by client and daemon.
//!
//! ```text
//! <run_dir>/<server>/server.toml            pid, server_id, started_at
//! <run_dir>/<server>/requests/<token>.request   {"command": .., "payload": ..}
//!                                  .running     marker
//!                                  .ready       marker
//!                                  .error       failure text
//!                                  .response    output channel / final payload
//!                                  .input       input channel (client appends)
//!                                  .closed      released by the client
//! ```
//!
//! Inside the input channel of an interactive session the client first sends
//! a terminal prelude: `F0 <type> FF`, `F1 <w>;<h> FF`, then a CR. Everything
//! after that is keystrokes, except further `F1` resize frames. A CR typed by
//! the user is followed by a NUL.

use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::terminal::TerminalInfo;

pub const SERVER_INFO_FILE: &str = "server.toml";
pub const REQUESTS_DIR: &str = "requests";

pub const REQUEST_EXT: &str = "request";
const RUNNING_EXT: &str = "running";
const READY_EXT: &str = "ready";
const ERROR_EXT: &str = "error";
const RESPONSE_EXT: &str = "response";
const INPUT_EXT: &str = "input";
const CLOSED_EXT: &str = "closed";

/// Starts a terminal type frame.
pub const TERMINAL_TYPE: u8 = 0xF0;
/// Starts a window size frame.
pub const WINDOW_SIZE: u8 = 0xF1;
/// Ends a frame. Never appears in UTF-8 text.
pub const FRAME_END: u8 = 0xFF;
pub const CR: u8 = 0x0D;
pub const NUL: u8 = 0x00;

/// The body of a `.request` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub command: String,
    #[serde(default)]
    pub payload: String,
}

/// Paths of every file that belongs to one request.
#[derive(Debug, Clone)]
pub struct RequestPaths {
    dir: PathBuf,
    token: String,
}

impl RequestPaths {
    pub fn new(admind_dir: &Path, token: &str) -> Self {
        Self {
            dir: admind_dir.join(REQUESTS_DIR),
            token: token.to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn request(&self) -> PathBuf {
        self.file(REQUEST_EXT)
    }

    pub fn running(&self) -> PathBuf {
        self.file(RUNNING_EXT)
    }

    pub fn ready(&self) -> PathBuf {
        self.file(READY_EXT)
    }

    pub fn error(&self) -> PathBuf {
        self.file(ERROR_EXT)
    }

    pub fn response(&self) -> PathBuf {
        self.file(RESPONSE_EXT)
    }

    pub fn input(&self) -> PathBuf {
        self.file(INPUT_EXT)
    }

    pub fn closed(&self) -> PathBuf {
        self.file(CLOSED_EXT)
    }

    pub fn all(&self) -> [PathBuf; 7] {
        [
            self.request(),
            self.running(),
            self.ready(),
            self.error(),
            self.response(),
            self.input(),
            self.closed(),
        ]
    }

    fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.token, ext))
    }
}

/// Write `contents` to a `.tmp` sibling and rename it over `path`, so
/// readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// `F0 <type> FF F1 <w>;<h> FF CR`
pub fn encode_terminal_info(info: &TerminalInfo) -> Vec<u8> {
    let mut prelude = vec![TERMINAL_TYPE];
    prelude.extend_from_slice(info.term_type.as_bytes());
    prelude.push(FRAME_END);
    prelude.extend(encode_window_size(info.width, info.height));
    prelude.push(CR);
    prelude
}

/// `F1 <w>;<h> FF`
pub fn encode_window_size(width: u16, height: u16) -> Vec<u8> {
    let mut frame = vec![WINDOW_SIZE];
    frame.extend_from_slice(format!("{width};{height}").as_bytes());
    frame.push(FRAME_END);
    frame
}

/// Append one keystroke, following a CR with the compatibility NUL.
pub fn encode_keystroke(byte: u8, out: &mut Vec<u8>) {
    out.push(byte);
    if byte == CR {
        out.push(NUL);
    }
}

/// What the daemon sees in an input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    TerminalType(String),
    WindowSize { width: u16, height: u16 },
    /// The CR that closes the prelude.
    PreludeComplete,
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DecoderState {
    #[default]
    Data,
    TerminalType,
    WindowSize,
    AfterCr,
}

/// Incremental decoder for the daemon side of an input channel.
///
/// Frames may be split across reads. A `F1` whose body is not `digits;digits`
/// is handed through as data.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    state: DecoderState,
    frame: Vec<u8>,
    prelude_done: bool,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prelude_done(&self) -> bool {
        self.prelude_done
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        let mut data = Vec::new();
        for &byte in bytes {
            self.step(byte, &mut data, &mut events);
        }
        flush_data(&mut data, &mut events);
        events
    }

    fn step(&mut self, byte: u8, data: &mut Vec<u8>, events: &mut Vec<ControlEvent>) {
        match self.state {
            DecoderState::AfterCr => {
                self.state = DecoderState::Data;
                if byte != NUL {
                    self.step(byte, data, events);
                }
            }
            DecoderState::TerminalType => {
                if byte == FRAME_END {
                    let name = mem::take(&mut self.frame);
                    flush_data(data, events);
                    events.push(ControlEvent::TerminalType(
                        String::from_utf8_lossy(&name).into_owned(),
                    ));
                    self.state = DecoderState::Data;
                } else {
                    self.frame.push(byte);
                }
            }
            DecoderState::WindowSize => {
                if byte == FRAME_END {
                    let body = mem::take(&mut self.frame);
                    self.state = DecoderState::Data;
                    match parse_window_size(&body) {
                        Some((width, height)) => {
                            flush_data(data, events);
                            events.push(ControlEvent::WindowSize { width, height });
                        }
                        None => {
                            tracing::debug!(?body, "dropping malformed window size frame");
                        }
                    }
                } else if byte.is_ascii_digit() || byte == b';' {
                    self.frame.push(byte);
                } else {
                    data.push(WINDOW_SIZE);
                    data.append(&mut self.frame);
                    self.state = DecoderState::Data;
                    self.step(byte, data, events);
                }
            }
            DecoderState::Data => match byte {
                TERMINAL_TYPE if !self.prelude_done => self.state = DecoderState::TerminalType,
                WINDOW_SIZE => self.state = DecoderState::WindowSize,
                CR if !self.prelude_done => {
                    flush_data(data, events);
                    self.prelude_done = true;
                    events.push(ControlEvent::PreludeComplete);
                }
                CR => {
                    data.push(CR);
                    self.state = DecoderState::AfterCr;
                }
                _ => data.push(byte),
            },
        }
    }
}

fn flush_data(data: &mut Vec<u8>, events: &mut Vec<ControlEvent>) {
    if !data.is_empty() {
        events.push(ControlEvent::Data(mem::take(data)));
    }
}

fn parse_window_size(body: &[u8]) -> Option<(u16, u16)> {
    let text = std::str::from_utf8(body).ok()?;
    let (width, height) = text.split_once(';')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}
