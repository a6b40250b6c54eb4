//! Protocol implementations.
//!
//! Each protocol provides a parser plus the [`Protocol`](crate::Protocol)
//! and [`SessionCallback`](crate::SessionCallback) glue for the server.
//!
//! - `telnet`: line-delimited command protocol used by the demo server

pub mod telnet;
