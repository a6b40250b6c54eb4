//! Error types shared by the server and its sessions.

use thiserror::Error;

/// Errors surfaced by sessions, protocols and the accept loop.
#[derive(Debug, Error)]
pub enum Error {
    /// The session is closed or closing, or the peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound queue stayed full for the whole send timeout.
    #[error("write packet blocked")]
    WriteBlocked,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error reported by a [`Protocol`](crate::Protocol). Opaque to the core.
    #[error("protocol error: {0}")]
    Protocol(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a framer-specific error.
    pub fn protocol<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Protocol(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(Error::WriteBlocked.to_string(), "write packet blocked");
        assert_eq!(
            Error::protocol("line too long").to_string(),
            "protocol error: line too long"
        );
    }
}
