//! Telnet option negotiation for raw socket consoles.
//!
//! [`TelnetFilter`] strips negotiation out of the server's byte stream one
//! byte at a time. [`negotiate`] performs the fixed opening exchange that
//! has to finish before any keystroke is sent.

mod handshake;

pub use handshake::{
    escape_iac, naws_subnegotiation, negotiate, terminal_type_subnegotiation,
    SERVER_OFFER, SERVER_SUBNEGOTIATION_REQUEST,
};

use std::io;

use thiserror::Error;
use tracing::{debug, trace};

pub const IAC: u8 = 0xFF;
pub const DONT: u8 = 0xFE;
pub const DO: u8 = 0xFD;
pub const WONT: u8 = 0xFC;
pub const WILL: u8 = 0xFB;
pub const SB: u8 = 0xFA;
pub const SE: u8 = 0xF0;

/// Subnegotiation verbs.
pub const IS: u8 = 0x00;
pub const SEND: u8 = 0x01;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_LOGOUT: u8 = 18;
pub const OPT_TERMINAL_TYPE: u8 = 24;
pub const OPT_NAWS: u8 = 31;
pub const OPT_NEW_ENVIRON: u8 = 39;

/// Last of the two-byte commands (SE through GA).
const LAST_SIMPLE_COMMAND: u8 = 0xF9;

const CR: u8 = 0x0D;
const NUL: u8 = 0x00;

#[derive(Debug, Error)]
pub enum TelnetError {
    #[error("Unable to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Telnet handshake failed while {step}: {source}")]
    Handshake {
        step: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Where the filter is in the server's byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    LookForIac,
    /// A CR was just passed through; a following NUL is padding.
    DiscardIfNul,
    WaitForCommand,
    WaitForOption,
}

/// Byte-at-a-time negotiation filter.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: NegotiationState,
    command: u8,
    logout_requested: bool,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether the server's last word on LOGOUT was `DO`.
    pub fn logout_requested(&self) -> bool {
        self.logout_requested
    }

    /// Filter one byte from the server.
    ///
    /// Returns the byte to display, or `None` when the byte belonged to
    /// negotiation and must be suppressed.
    pub fn filter(&mut self, byte: u8) -> Option<u8> {
        match self.state {
            NegotiationState::DiscardIfNul if byte == NUL => {
                self.state = NegotiationState::LookForIac;
                None
            }
            NegotiationState::LookForIac | NegotiationState::DiscardIfNul => match byte {
                IAC => {
                    self.state = NegotiationState::WaitForCommand;
                    None
                }
                CR => {
                    self.state = NegotiationState::DiscardIfNul;
                    Some(byte)
                }
                _ => {
                    self.state = NegotiationState::LookForIac;
                    Some(byte)
                }
            },
            NegotiationState::WaitForCommand => {
                if byte == IAC {
                    self.state = NegotiationState::LookForIac;
                    return Some(IAC);
                }
                self.command = byte;
                self.state = if (SE..=LAST_SIMPLE_COMMAND).contains(&byte) {
                    trace!(command = byte, "two-byte telnet command");
                    NegotiationState::LookForIac
                } else {
                    NegotiationState::WaitForOption
                };
                None
            }
            NegotiationState::WaitForOption => {
                self.apply_option(byte);
                self.state = NegotiationState::LookForIac;
                None
            }
        }
    }

    /// Filter a chunk, appending the visible bytes to `out`.
    pub fn filter_into(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.extend(input.iter().filter_map(|&byte| self.filter(byte)));
    }

    fn apply_option(&mut self, option: u8) {
        match option {
            OPT_LOGOUT => match self.command {
                DO => self.logout_requested = true,
                DONT => self.logout_requested = false,
                _ => {}
            },
            OPT_ECHO | OPT_SGA | OPT_TERMINAL_TYPE | OPT_NAWS | OPT_NEW_ENVIRON => {
                trace!(command = self.command, option, "telnet option");
            }
            _ => {
                let command = self.command;
                debug!(command, option, "ignoring unrecognized telnet option");
            }
        }
    }
}
