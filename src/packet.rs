//! Packet and protocol contracts.
//!
//! The core never looks inside a packet. A [`Protocol`] turns the inbound
//! byte stream into packets, and the write loop turns packets back into
//! bytes through [`Packet::serialize`].

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Initial capacity of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 4 * 1024;

/// A unit of data that can be written to a connection.
pub trait Packet: Send + 'static {
    /// Encode the packet for the wire. Called once per send.
    fn serialize(&self) -> Bytes;
}

/// Reads packets off a connection.
///
/// `read_packet` must block until a full packet is buffered or the stream
/// fails. When the peer closes the stream it must return
/// [`Error::ConnectionClosed`]; [`PacketReader::fill`] already does so.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    type Packet: Packet;

    async fn read_packet(&self, reader: &mut PacketReader) -> Result<Self::Packet>;
}

/// Read side of a connection, with a buffer that persists across packets.
pub struct PacketReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    buffer: BytesMut,
}

impl PacketReader {
    pub fn new<R>(stream: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stream: Box::new(stream),
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Bytes received but not yet consumed by the protocol.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access for consuming parsed bytes (e.g. `split_to`, `advance`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Read more bytes from the stream into the buffer.
    ///
    /// A zero-byte read means the peer closed the connection and is reported
    /// as [`Error::ConnectionClosed`].
    pub async fn fill(&mut self) -> Result<usize> {
        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(n)
    }
}
