//! Telnet protocol glue for the session framework.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Buf;
use tracing::{info, trace, warn};

use super::parser::{self, Command, ParseResult, TelnetPacket};
use crate::callback::SessionCallback;
use crate::error::{Error, Result};
use crate::packet::{PacketReader, Protocol};
use crate::session::Session;

/// Longest line accepted before the connection is dropped.
const MAX_LINE_LENGTH: usize = 4096;

/// Frames `\r\n`-terminated lines into [`TelnetPacket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelnetProtocol;

#[async_trait]
impl Protocol for TelnetProtocol {
    type Packet = TelnetPacket;

    async fn read_packet(&self, reader: &mut PacketReader) -> Result<TelnetPacket> {
        loop {
            if let ParseResult::Complete(packet, consumed) = parser::parse(reader.buffer()) {
                reader.buffer_mut().advance(consumed);
                return Ok(packet);
            }

            if reader.buffer().len() > MAX_LINE_LENGTH {
                return Err(Error::protocol(format!(
                    "line exceeds {MAX_LINE_LENGTH} bytes"
                )));
            }

            reader.fill().await?;
        }
    }
}

/// Greets clients, echoes `echo` arguments and hangs up on `quit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelnetCallback;

impl TelnetCallback {
    fn reply(session: &Session<TelnetPacket>, packet: TelnetPacket) {
        if let Err(e) = session.try_send_packet(packet) {
            warn!(session = session.id(), error = %e, "Dropping reply");
        }
    }
}

#[async_trait]
impl SessionCallback<TelnetPacket> for TelnetCallback {
    async fn on_connect(&self, session: &Arc<Session<TelnetPacket>>) -> bool {
        info!(session = session.id(), peer = %session.peer_addr(), "Client connected");
        Self::reply(session, TelnetPacket::line("Welcome!"));
        true
    }

    async fn on_message(&self, session: &Arc<Session<TelnetPacket>>, packet: TelnetPacket) -> bool {
        trace!(session = session.id(), command = ?packet.command(), "Processing command");

        match packet.command() {
            Command::Echo => Self::reply(session, TelnetPacket::line(packet.data().clone())),
            Command::Exit => return false,
            Command::Other(_) | Command::Undefined => {
                Self::reply(session, TelnetPacket::line("Unknown command"))
            }
        }
        true
    }

    fn on_close(&self, session: &Session<TelnetPacket>) {
        info!(session = session.id(), peer = %session.peer_addr(), "Client left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_reads_lines_across_chunks() {
        let mock = Builder::new()
            .read(b"echo he")
            .read(b"llo\r\nquit\r\n")
            .build();
        let mut reader = PacketReader::new(mock);

        let first = TelnetProtocol.read_packet(&mut reader).await.unwrap();
        assert_eq!(first.command(), &Command::Echo);
        assert_eq!(first.data().as_ref(), b"hello");

        // The second line arrived with the first and must not be lost.
        let second = TelnetProtocol.read_packet(&mut reader).await.unwrap();
        assert_eq!(second.command(), &Command::Exit);
    }

    #[tokio::test]
    async fn test_eof_reports_connection_closed() {
        let mock = Builder::new().read(b"echo unterminated").build();
        let mut reader = PacketReader::new(mock);

        let err = TelnetProtocol.read_packet(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let long = vec![b'x'; MAX_LINE_LENGTH + 1];
        let mock = Builder::new().read(&long).build();
        let mut reader = PacketReader::new(mock);

        let err = TelnetProtocol.read_packet(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
