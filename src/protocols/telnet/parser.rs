//! Telnet protocol parser.

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::Packet;

/// Command carried by a telnet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Echo the argument back.
    Echo,
    /// Close the session.
    Exit,
    /// A `<flag> <argument>` line with a flag the server does not know.
    Other(String),
    /// Anything that is not a recognised line shape.
    Undefined,
}

impl Command {
    fn from_flag(flag: &[u8]) -> Self {
        match flag {
            b"echo" => Command::Echo,
            b"exit" => Command::Exit,
            other => Command::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// A telnet line, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelnetPacket {
    command: Command,
    data: Bytes,
}

impl TelnetPacket {
    pub fn new(command: Command, data: impl Into<Bytes>) -> Self {
        Self {
            command,
            data: data.into(),
        }
    }

    /// Outbound line with no particular command attached.
    pub fn line(data: impl Into<Bytes>) -> Self {
        Self::new(Command::Undefined, data)
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Packet for TelnetPacket {
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 2);
        buf.put_slice(&self.data);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed packet with bytes consumed.
    Complete(TelnetPacket, usize),
    /// Need more data.
    Incomplete,
}

/// Parse one telnet line from the input buffer.
///
/// A line with exactly two space-separated fields is `<flag> <argument>`;
/// only the flags `echo` and `exit` are known there. The single words
/// `quit`, `exit` and `echo` are commands on their own.
/// Every other line is [`Command::Undefined`] and keeps its full text.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    let consumed = line_end + 2; // include \r\n

    let fields: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    let packet = match fields.as_slice() {
        [flag, arg] => TelnetPacket::new(Command::from_flag(flag), Bytes::copy_from_slice(arg)),
        [b"quit"] | [b"exit"] => TelnetPacket::new(Command::Exit, Bytes::new()),
        [b"echo"] => TelnetPacket::new(Command::Echo, Bytes::new()),
        _ => TelnetPacket::new(Command::Undefined, Bytes::copy_from_slice(line)),
    };

    ParseResult::Complete(packet, consumed)
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(input: &[u8]) -> (TelnetPacket, usize) {
        match parse(input) {
            ParseResult::Complete(packet, consumed) => (packet, consumed),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_echo_with_argument() {
        let (packet, consumed) = complete(b"echo hello\r\n");
        assert_eq!(consumed, 12);
        assert_eq!(packet.command(), &Command::Echo);
        assert_eq!(packet.data().as_ref(), b"hello");
    }

    #[test]
    fn test_parse_single_words() {
        let (packet, _) = complete(b"quit\r\n");
        assert_eq!(packet.command(), &Command::Exit);

        let (packet, _) = complete(b"exit\r\n");
        assert_eq!(packet.command(), &Command::Exit);

        let (packet, _) = complete(b"echo\r\n");
        assert_eq!(packet.command(), &Command::Echo);
        assert!(packet.data().is_empty());
    }

    #[test]
    fn test_parse_unknown_flag() {
        let (packet, _) = complete(b"shout hi\r\n");
        assert_eq!(packet.command(), &Command::Other("shout".to_string()));
        assert_eq!(packet.data().as_ref(), b"hi");
    }

    #[test]
    fn test_parse_exit_flag_with_argument() {
        let (packet, _) = complete(b"exit now\r\n");
        assert_eq!(packet.command(), &Command::Exit);
        assert_eq!(packet.data().as_ref(), b"now");

        let (packet, _) = complete(b"quit now\r\n");
        assert_eq!(packet.command(), &Command::Other("quit".to_string()));
        assert_eq!(packet.data().as_ref(), b"now");
    }

    #[test]
    fn test_parse_undefined_keeps_line() {
        let (packet, consumed) = complete(b"a b c\r\nnext\r\n");
        assert_eq!(consumed, 7);
        assert_eq!(packet.command(), &Command::Undefined);
        assert_eq!(packet.data().as_ref(), b"a b c");

        let (packet, _) = complete(b"\r\n");
        assert_eq!(packet.command(), &Command::Undefined);
        assert!(packet.data().is_empty());
    }

    #[test]
    fn test_incomplete() {
        match parse(b"echo hello") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse(b"echo hello\r") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_serialize_appends_crlf() {
        let packet = TelnetPacket::line("Welcome!");
        assert_eq!(packet.serialize().as_ref(), b"Welcome!\r\n");
    }
}
