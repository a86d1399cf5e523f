//! The scripted opening exchange with a telnet console server.

use std::io::{Read, Write};

use tracing::debug;

use super::{
    TelnetError, DO, DONT, IAC, IS, OPT_ECHO, OPT_NAWS, OPT_NEW_ENVIRON, OPT_SGA,
    OPT_TERMINAL_TYPE, SB, SE, SEND, WILL,
};
use crate::terminal::TerminalInfo;

/// What the server announces first.
#[rustfmt::skip]
pub const SERVER_OFFER: [u8; 21] = [
    IAC, WILL, OPT_ECHO,
    IAC, DONT, OPT_ECHO,
    IAC, DO, OPT_NAWS,
    IAC, WILL, OPT_SGA,
    IAC, DO, OPT_SGA,
    IAC, DO, OPT_TERMINAL_TYPE,
    IAC, DO, OPT_NEW_ENVIRON,
];

/// Our answer to [`SERVER_OFFER`], sent ahead of the window size.
#[rustfmt::skip]
const CLIENT_ACCEPT: [u8; 18] = [
    IAC, DO, OPT_ECHO,
    IAC, WILL, OPT_NAWS,
    IAC, DO, OPT_SGA,
    IAC, WILL, OPT_SGA,
    IAC, WILL, OPT_TERMINAL_TYPE,
    IAC, WILL, OPT_NEW_ENVIRON,
];

/// The server asking for terminal type and environment.
#[rustfmt::skip]
pub const SERVER_SUBNEGOTIATION_REQUEST: [u8; 14] = [
    IAC, SB, OPT_TERMINAL_TYPE, SEND, IAC, SE,
    IAC, SB, OPT_NEW_ENVIRON, SEND, 0x00, 0x03, IAC, SE,
];

/// We never export environment variables.
const CLIENT_EMPTY_ENVIRON: [u8; 6] = [IAC, SB, OPT_NEW_ENVIRON, IS, IAC, SE];

/// Double every IAC so payload bytes cannot be read as commands.
pub fn escape_iac(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
}

/// `IAC SB NAWS w-hi w-lo h-hi h-lo IAC SE`
pub fn naws_subnegotiation(width: u16, height: u16) -> Vec<u8> {
    let mut frame = vec![IAC, SB, OPT_NAWS];
    escape_iac(&width.to_be_bytes(), &mut frame);
    escape_iac(&height.to_be_bytes(), &mut frame);
    frame.extend_from_slice(&[IAC, SE]);
    frame
}

/// `IAC SB TTYPE IS <name> IAC SE`, with the name lowercased.
pub fn terminal_type_subnegotiation(term_type: &str) -> Vec<u8> {
    let mut frame = vec![IAC, SB, OPT_TERMINAL_TYPE, IS];
    escape_iac(term_type.to_ascii_lowercase().as_bytes(), &mut frame);
    frame.extend_from_slice(&[IAC, SE]);
    frame
}

/// Run the opening exchange. Must complete before any keystroke is sent.
///
/// The server's messages are consumed by length; a differing offer is
/// logged but not rejected.
pub fn negotiate<S: Read + Write>(stream: &mut S, info: &TerminalInfo) -> Result<(), TelnetError> {
    let mut offer = [0u8; SERVER_OFFER.len()];
    read_step(stream, &mut offer, "reading the server offer")?;
    if offer != SERVER_OFFER {
        debug!(?offer, "server offer differs from the usual script");
    }

    let mut reply = CLIENT_ACCEPT.to_vec();
    reply.extend(naws_subnegotiation(info.width, info.height));
    write_step(stream, &reply, "accepting options")?;

    let mut request = [0u8; SERVER_SUBNEGOTIATION_REQUEST.len()];
    read_step(stream, &mut request, "reading the subnegotiation request")?;
    if request != SERVER_SUBNEGOTIATION_REQUEST {
        debug!(?request, "subnegotiation request differs from the usual script");
    }

    let mut reply = CLIENT_EMPTY_ENVIRON.to_vec();
    reply.extend(terminal_type_subnegotiation(&info.term_type));
    write_step(stream, &reply, "sending the terminal type")?;

    debug!(
        width = info.width,
        height = info.height,
        term = %info.term_type,
        "telnet handshake complete"
    );
    Ok(())
}

fn read_step<S: Read>(
    stream: &mut S,
    buf: &mut [u8],
    step: &'static str,
) -> Result<(), TelnetError> {
    stream
        .read_exact(buf)
        .map_err(|source| TelnetError::Handshake { step, source })
}

fn write_step<S: Write>(
    stream: &mut S,
    bytes: &[u8],
    step: &'static str,
) -> Result<(), TelnetError> {
    stream
        .write_all(bytes)
        .and_then(|()| stream.flush())
        .map_err(|source| TelnetError::Handshake { step, source })
}
