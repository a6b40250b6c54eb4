//! trellis: a small TCP session framework
//!
//! The server accepts connections and gives each one a [`Session`] that
//! runs three cooperating tasks:
//! - a read loop that asks the [`Protocol`] for the next packet
//! - a dispatch loop that hands packets to the [`SessionCallback`]
//! - a write loop that drains the bounded outbound queue
//!
//! Framing and application logic are plugged in by the caller. Outbound
//! backpressure is the queue capacity plus the timeout given to
//! [`Session::send_packet`].
//!
//! ```no_run
//! use std::time::Duration;
//! use trellis::config::SessionConfig;
//! use trellis::protocols::telnet::{TelnetCallback, TelnetProtocol};
//! use trellis::Server;
//!
//! # async fn run() -> trellis::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5555").await?;
//! let server = Server::new(TelnetProtocol, TelnetCallback, SessionConfig::default());
//!
//! let stopper = server.clone();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     stopper.stop();
//! });
//!
//! server.serve(listener, Duration::from_secs(1)).await?;
//! server.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod protocols;

mod callback;
mod error;
mod packet;
mod server;
mod session;

pub use callback::SessionCallback;
pub use error::{Error, Result};
pub use packet::{Packet, PacketReader, Protocol};
pub use server::{bind, Server};
pub use session::Session;
