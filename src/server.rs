//! TCP server: accept loop and global shutdown.
//!
//! The server owns the shutdown signal and a task tracker that counts the
//! accept loop plus every session task. `stop()` fires the signal, `wait()`
//! blocks until everything tracked has finished.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::callback::SessionCallback;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::packet::{Packet, Protocol};
use crate::session::Session;

/// First back-off after a transient accept error.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// State shared between the server and all of its sessions.
pub(crate) struct Shared<T: Packet> {
    pub(crate) protocol: Arc<dyn Protocol<Packet = T>>,
    pub(crate) callback: Arc<dyn SessionCallback<T>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) config: SessionConfig,
}

impl<T: Packet> Shared<T> {
    pub(crate) fn new<P, C>(protocol: P, callback: C, config: SessionConfig) -> Self
    where
        P: Protocol<Packet = T>,
        C: SessionCallback<T>,
    {
        Self {
            protocol: Arc::new(protocol),
            callback: Arc::new(callback),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        }
    }
}

/// Server instance. Cheap to clone; clones share the same shutdown signal.
pub struct Server<T: Packet> {
    shared: Arc<Shared<T>>,
    next_session_id: Arc<AtomicU64>,
}

impl<T: Packet> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            next_session_id: Arc::clone(&self.next_session_id),
        }
    }
}

impl<T: Packet> Server<T> {
    /// Create a new server instance
    pub fn new<P, C>(protocol: P, callback: C, config: SessionConfig) -> Self
    where
        P: Protocol<Packet = T>,
        C: SessionCallback<T>,
    {
        Server {
            shared: Arc::new(Shared::new(protocol, callback, config)),
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Accept connections until [`stop`](Self::stop) is called.
    ///
    /// Each accept waits at most `poll_interval`; an expired wait is just a
    /// tick. Transient accept errors back off and retry, anything else is
    /// returned. The listener is closed when this returns.
    pub async fn serve(&self, listener: TcpListener, poll_interval: Duration) -> Result<()> {
        let _serving = self.shared.tracker.token();
        let shutdown = &self.shared.shutdown;

        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Server listening");
        }

        let mut backoff = MIN_ACCEPT_BACKOFF;

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                res = time::timeout(poll_interval, listener.accept()) => res,
            };

            match accepted {
                // Poll tick
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    backoff = MIN_ACCEPT_BACKOFF;
                    self.spawn_session(stream, peer);
                }
                Ok(Err(e)) if is_transient_accept_error(&e) => {
                    warn!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to accept connection"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(poll_interval.max(MIN_ACCEPT_BACKOFF));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Listener failed");
                    break Err(e.into());
                }
            }
        };

        drop(listener);
        info!("Accept loop stopped");
        result
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if self.shared.shutdown.is_cancelled() {
            debug!(peer = %peer, "Dropping connection accepted during shutdown");
            return;
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        match Session::new(id, stream, Arc::clone(&self.shared)) {
            Ok((session, io)) => {
                self.shared.tracker.spawn(session.start(io));
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to set up session");
            }
        }
    }

    /// Fire the shutdown signal. Idempotent.
    pub fn stop(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("Shutting down");
        }
        self.shared.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Wait until the accept loop and every session task have finished.
    ///
    /// Only returns after `stop()`, or once every session has ended on its own
    /// and `serve` has returned.
    pub async fn wait(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Number of tracked tasks still running (accept loop and session loops).
    pub fn active_tasks(&self) -> usize {
        self.shared.tracker.len()
    }
}

/// Bind a listener with `SO_REUSEADDR` set.
pub fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    TcpListener::from_std(socket.into())
}

/// Errors that leave the listener usable.
fn is_transient_accept_error(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    ) || is_resource_exhaustion(e)
}

/// Out of descriptors or buffers; clears up as connections close.
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[cfg(unix)]
    #[test]
    fn test_fd_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
