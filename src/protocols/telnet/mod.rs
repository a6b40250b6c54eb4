//! Telnet protocol implementation.
//!
//! A line-oriented command protocol meant to be driven by hand from a
//! telnet or netcat client:
//! - Client sends: `<flag> <argument>\r\n`, or a single word
//! - Server replies: a single line terminated by `\r\n`
//!
//! ## Commands
//!
//! ```text
//! echo hello   ->  hello
//! echo         ->  (empty line)
//! quit | exit  ->  connection closed
//! anything     ->  Unknown command
//! ```
//!
//! On connect the server greets the client with `Welcome!`.

pub mod handler;
pub mod parser;

pub use handler::{TelnetCallback, TelnetProtocol};
pub use parser::{Command, TelnetPacket};
