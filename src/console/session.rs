//! Transport over an admin directory session.

use std::io;
use std::sync::Arc;

use tracing::debug;

use super::{LinkStatus, ReadOutcome, Transport, BUFFER_SIZE};
use crate::admind::protocol::{encode_terminal_info, encode_window_size};
use crate::admind::{AdmindClient, AdmindError, RequestState, SessionChannels, SessionRequest};
use crate::terminal::TerminalInfo;

/// A `shell` request that reached RUNNING, seen as a byte stream.
pub struct SessionTransport {
    client: Arc<AdmindClient>,
    request: Arc<SessionRequest>,
    channels: SessionChannels,
}

impl SessionTransport {
    /// Open the request's channels and send the terminal prelude.
    pub fn attach(
        client: Arc<AdmindClient>,
        request: Arc<SessionRequest>,
        info: &TerminalInfo,
    ) -> Result<Self, AdmindError> {
        let mut channels = client.open_channels(&request)?;
        channels
            .input
            .write(&encode_terminal_info(info))
            .map_err(|e| AdmindError::io(channels.input.path(), e))?;
        debug!(token = request.token(), term = %info.term_type, "terminal prelude sent");

        Ok(Self {
            client,
            request,
            channels,
        })
    }
}

impl Transport for SessionTransport {
    fn status(&mut self) -> LinkStatus {
        match self.client.poll(&self.request) {
            RequestState::Pending | RequestState::Running => LinkStatus::Open,
            RequestState::Ready => LinkStatus::Finished,
            RequestState::Gone => LinkStatus::Gone,
            RequestState::Error => LinkStatus::Failed(
                self.client
                    .last_error(&self.request)
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
    }

    fn read_available(&mut self, out: &mut Vec<u8>) -> io::Result<ReadOutcome> {
        let mut buf = [0u8; BUFFER_SIZE];
        let count = self.channels.output.read_available(&mut buf)?;
        out.extend_from_slice(&buf[..count]);
        Ok(ReadOutcome::Data(count))
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.channels.input.write(bytes)
    }

    fn send_window_size(&mut self, info: &TerminalInfo) -> io::Result<()> {
        let frame = encode_window_size(info.width, info.height);
        self.channels.input.write(&frame)
    }

    fn release(&mut self) {
        self.client.close(&self.request);
    }
}
