//! Transport over a raw telnet socket.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsFd;
use std::time::Duration;

use tracing::{debug, info};

use super::{LinkStatus, ReadOutcome, Transport, BUFFER_SIZE};
use crate::telnet::{self, escape_iac, naws_subnegotiation, TelnetError, TelnetFilter};
use crate::terminal::{is_readable, TerminalInfo};

pub struct TelnetTransport {
    stream: TcpStream,
    filter: TelnetFilter,
    released: bool,
}

impl TelnetTransport {
    /// Connect and run the opening handshake. Reads and writes during the
    /// handshake give up after `handshake_timeout`.
    pub fn connect(
        host: &str,
        port: u16,
        info: &TerminalInfo,
        handshake_timeout: Duration,
    ) -> Result<Self, TelnetError> {
        let address = format!("{host}:{port}");
        let connect_error = |source| TelnetError::Connect {
            address: address.clone(),
            source,
        };

        let mut stream = TcpStream::connect((host, port)).map_err(connect_error)?;
        stream
            .set_read_timeout(Some(handshake_timeout))
            .and_then(|()| stream.set_write_timeout(Some(handshake_timeout)))
            .map_err(connect_error)?;

        telnet::negotiate(&mut stream, info)?;

        stream
            .set_read_timeout(None)
            .and_then(|()| stream.set_write_timeout(None))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(connect_error)?;
        info!(%address, "telnet session established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap a stream whose handshake is already done.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            filter: TelnetFilter::new(),
            released: false,
        }
    }
}

impl Transport for TelnetTransport {
    fn status(&mut self) -> LinkStatus {
        if self.filter.logout_requested() {
            LinkStatus::Logout
        } else {
            LinkStatus::Open
        }
    }

    fn read_available(&mut self, out: &mut Vec<u8>) -> io::Result<ReadOutcome> {
        if !is_readable(self.stream.as_fd())? {
            return Ok(ReadOutcome::Data(0));
        }

        let mut buf = [0u8; BUFFER_SIZE];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(count) => {
                self.filter.filter_into(&buf[..count], out);
                Ok(ReadOutcome::Data(count))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Data(0)),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut escaped = Vec::with_capacity(bytes.len());
        escape_iac(bytes, &mut escaped);
        self.stream.write_all(&escaped)?;
        self.stream.flush()
    }

    fn send_window_size(&mut self, info: &TerminalInfo) -> io::Result<()> {
        let frame = naws_subnegotiation(info.width, info.height);
        self.stream.write_all(&frame)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "telnet socket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::{DO, IAC, OPT_LOGOUT, SERVER_OFFER, SERVER_SUBNEGOTIATION_REQUEST};
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TelnetTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TelnetTransport::from_stream(client), server)
    }

    fn read_until_data(transport: &mut TelnetTransport) -> (ReadOutcome, Vec<u8>) {
        let mut out = Vec::new();
        for _ in 0..200 {
            let outcome = transport.read_available(&mut out).unwrap();
            if outcome != ReadOutcome::Data(0) {
                return (outcome, out);
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no data from server");
    }

    #[test]
    fn output_is_filtered_and_logout_is_reported() {
        let (mut transport, mut server) = pair();
        server
            .write_all(&[b'o', b'k', IAC, DO, OPT_LOGOUT])
            .unwrap();

        let (outcome, out) = read_until_data(&mut transport);
        assert_eq!(outcome, ReadOutcome::Data(5));
        assert_eq!(out, b"ok");
        assert_eq!(transport.status(), LinkStatus::Logout);
    }

    #[test]
    fn nothing_pending_does_not_block() {
        let (mut transport, _server) = pair();
        let mut out = Vec::new();
        let outcome = transport.read_available(&mut out).unwrap();
        assert_eq!(outcome, ReadOutcome::Data(0));
    }

    #[test]
    fn closed_socket_is_eof() {
        let (mut transport, server) = pair();
        drop(server);

        let (outcome, _) = read_until_data(&mut transport);
        assert_eq!(outcome, ReadOutcome::Eof);
    }

    #[test]
    fn literal_ff_is_escaped_on_send() {
        let (mut transport, mut server) = pair();
        transport.send(&[b'a', 0xFF]).unwrap();
        transport.release();

        let mut received = Vec::new();
        server.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![b'a', 0xFF, 0xFF]);
    }

    #[test]
    fn connect_runs_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&SERVER_OFFER).unwrap();
            let mut accept = [0u8; 27];
            stream.read_exact(&mut accept).unwrap();
            stream.write_all(&SERVER_SUBNEGOTIATION_REQUEST).unwrap();
            let mut rest = [0u8; 6 + 6 + 5];
            stream.read_exact(&mut rest).unwrap();
            (accept, rest)
        });

        let info = TerminalInfo::new(80, 24, "XTERM");
        let transport = TelnetTransport::connect("127.0.0.1", port, &info, Duration::from_secs(5));
        assert!(transport.is_ok());

        let (accept, rest) = server.join().unwrap();
        assert_eq!(&accept[18..], &naws_subnegotiation(80, 24)[..]);
        assert_eq!(&rest[10..15], b"xterm");
    }
}
