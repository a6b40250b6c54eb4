//! Per-connection session.
//!
//! A session runs three tasks over one TCP connection:
//!
//! ```text
//! socket ──read loop──▶ recv queue ──dispatch loop──▶ SessionCallback::on_message
//! send_packet ──▶ send queue ──write loop──▶ socket
//! ```
//!
//! The first loop to stop, for any reason, runs the close sequence. The
//! sequence is claimed with a single compare-and-swap, so it runs once no
//! matter how many loops (or callers of [`Session::close`]) race to it.

use std::any::Any;
use std::future::Future;
use std::net::{Shutdown, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use socket2::{SockRef, Socket};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketReader};
use crate::server::Shared;

/// One accepted connection and its queues.
pub struct Session<T: Packet> {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    /// Second handle on the socket, used to tear the connection down while
    /// the loops still own the stream halves.
    socket: Socket,
    shared: Arc<Shared<T>>,
    closed: AtomicBool,
    close_signal: CancellationToken,
    send_tx: flume::Sender<T>,
    /// Kept so the close sequence can discard packets nobody will write.
    send_rx: flume::Receiver<T>,
}

/// Loop-owned halves of a session, handed over by [`Session::start`].
pub(crate) struct SessionIo<T> {
    reader: PacketReader,
    writer: OwnedWriteHalf,
    send_rx: flume::Receiver<T>,
    recv_tx: flume::Sender<T>,
    recv_rx: flume::Receiver<T>,
}

impl<T: Packet> Session<T> {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        shared: Arc<Shared<T>>,
    ) -> Result<(Arc<Self>, SessionIo<T>)> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let socket = SockRef::from(&stream).try_clone()?;

        // A zero capacity makes each queue a rendezvous: a packet only
        // moves when the consuming loop is waiting for it.
        let config = shared.config;
        let (send_tx, send_rx) = flume::bounded(config.send_queue_size);
        let (recv_tx, recv_rx) = flume::bounded(config.recv_queue_size);

        let (read_half, write_half) = stream.into_split();

        let session = Arc::new(Session {
            id,
            peer_addr,
            local_addr,
            connected_at: Utc::now(),
            socket,
            shared,
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
            send_tx,
            send_rx: send_rx.clone(),
        });

        let io = SessionIo {
            reader: PacketReader::new(read_half),
            writer: write_half,
            send_rx,
            recv_tx,
            recv_rx,
        };

        Ok((session, io))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the close sequence has been claimed. Never reverts.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of packets waiting in the outbound queue.
    pub fn pending_packets(&self) -> usize {
        self.send_tx.len()
    }

    /// Queue a packet for the write loop.
    ///
    /// With a zero `timeout` this never waits: a full queue fails with
    /// [`Error::WriteBlocked`]. Otherwise it waits until the packet is queued,
    /// the session closes ([`Error::ConnectionClosed`]) or the timeout
    /// elapses ([`Error::WriteBlocked`]). With a zero-capacity queue "queued"
    /// means taken by the write loop.
    pub async fn send_packet(&self, packet: T, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.try_send_packet(packet);
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let sent = tokio::select! {
            biased;
            _ = self.close_signal.cancelled() => Err(Error::ConnectionClosed),
            res = self.send_tx.send_async(packet) => res.map_err(|_| Error::ConnectionClosed),
            _ = time::sleep(timeout) => Err(Error::WriteBlocked),
        };
        sent.and_then(|()| self.confirm_queued())
    }

    /// Non-blocking form of [`send_packet`](Self::send_packet).
    pub fn try_send_packet(&self, packet: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        match self.send_tx.try_send(packet) {
            Ok(()) => self.confirm_queued(),
            Err(flume::TrySendError::Full(_)) => Err(Error::WriteBlocked),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::ConnectionClosed),
        }
    }

    /// A close that won the race after the closed check must not leave the
    /// packet behind in the queue.
    fn confirm_queued(&self) -> Result<()> {
        if self.is_closed() {
            self.discard_outbound();
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn discard_outbound(&self) {
        let dropped = self.send_rx.drain().count();
        if dropped > 0 {
            trace!(session = self.id, dropped, "Discarded unsent packets");
        }
    }

    /// Run the close sequence if nobody has yet: mark closed, wake the
    /// loops, shut the socket down and notify the callback.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.close_signal.cancel();
        self.discard_outbound();
        self.shutdown_socket();

        let callback = &self.shared.callback;
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback.on_close(self))) {
            error!(
                session = self.id,
                panic = %panic_message(&*panic),
                "on_close panicked"
            );
        }

        info!(
            session = self.id,
            peer = %self.peer_addr,
            duration_ms = (Utc::now() - self.connected_at).num_milliseconds(),
            "Session closed"
        );
    }

    /// Teardown for a rejected connection: no loops ran, so `on_close` is
    /// skipped.
    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.cancel();
        self.discard_outbound();
        self.shutdown_socket();
    }

    fn shutdown_socket(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // Already gone if the peer reset the connection.
            trace!(session = self.id, error = %e, "Socket shutdown failed");
        }
    }

    /// Run the connect hook, then spawn the three loops.
    pub(crate) async fn start(self: Arc<Self>, io: SessionIo<T>) {
        debug!(session = self.id, peer = %self.peer_addr, "New connection");

        let accepted = AssertUnwindSafe(self.shared.callback.on_connect(&self))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(
                    session = self.id,
                    panic = %panic_message(&*panic),
                    "on_connect panicked"
                );
                false
            });

        if !accepted {
            debug!(session = self.id, peer = %self.peer_addr, "Connection rejected");
            self.abort();
            return;
        }

        info!(session = self.id, peer = %self.peer_addr, "Session opened");

        let SessionIo {
            reader,
            writer,
            send_rx,
            recv_tx,
            recv_rx,
        } = io;

        let tracker = &self.shared.tracker;
        tracker.spawn(guarded(
            Arc::clone(&self),
            "dispatch",
            dispatch_loop(Arc::clone(&self), recv_rx),
        ));
        tracker.spawn(guarded(
            Arc::clone(&self),
            "read",
            read_loop(Arc::clone(&self), reader, recv_tx),
        ));
        tracker.spawn(guarded(
            Arc::clone(&self),
            "write",
            write_loop(Arc::clone(&self), writer, send_rx),
        ));
    }
}

/// Run a loop, turning a panic into an ordinary close.
async fn guarded<T, F>(session: Arc<Session<T>>, name: &'static str, work: F)
where
    T: Packet,
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
        error!(
            session = session.id,
            loop_name = name,
            panic = %panic_message(&*panic),
            "Session loop panicked"
        );
    }
    debug!(session = session.id, loop_name = name, "Session loop exited");
    session.close();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn read_loop<T: Packet>(
    session: Arc<Session<T>>,
    mut reader: PacketReader,
    recv_tx: flume::Sender<T>,
) {
    let shutdown = session.shared.shutdown.clone();
    let protocol = Arc::clone(&session.shared.protocol);

    loop {
        let packet = tokio::select! {
            biased;
            _ = session.close_signal.cancelled() => return,
            _ = shutdown.cancelled() => return,
            res = protocol.read_packet(&mut reader) => match res {
                Ok(packet) => packet,
                Err(Error::ConnectionClosed) => {
                    debug!(session = session.id, "Connection closed by peer");
                    return;
                }
                Err(e) => {
                    debug!(session = session.id, error = %e, "Read failed");
                    return;
                }
            },
        };

        trace!(session = session.id, "Packet received");

        // The dispatch loop may already be gone; never wait on the queue
        // without also watching for close.
        tokio::select! {
            biased;
            _ = session.close_signal.cancelled() => return,
            _ = shutdown.cancelled() => return,
            res = recv_tx.send_async(packet) => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

async fn dispatch_loop<T: Packet>(session: Arc<Session<T>>, recv_rx: flume::Receiver<T>) {
    let shutdown = session.shared.shutdown.clone();
    let callback = Arc::clone(&session.shared.callback);

    loop {
        let packet = tokio::select! {
            biased;
            _ = session.close_signal.cancelled() => return,
            _ = shutdown.cancelled() => return,
            packet = recv_rx.recv_async() => match packet {
                Ok(packet) => packet,
                Err(_) => return,
            },
        };

        if session.is_closed() {
            return;
        }
        if !callback.on_message(&session, packet).await {
            debug!(session = session.id, "on_message ended the session");
            return;
        }
    }
}

async fn write_loop<T: Packet>(
    session: Arc<Session<T>>,
    mut writer: OwnedWriteHalf,
    send_rx: flume::Receiver<T>,
) {
    let shutdown = session.shared.shutdown.clone();

    loop {
        let packet = tokio::select! {
            biased;
            _ = session.close_signal.cancelled() => return,
            _ = shutdown.cancelled() => return,
            packet = send_rx.recv_async() => match packet {
                Ok(packet) => packet,
                Err(_) => return,
            },
        };

        if session.is_closed() {
            return;
        }

        let bytes = packet.serialize();
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(session = session.id, error = %e, "Write failed");
            return;
        }
        trace!(session = session.id, len = bytes.len(), "Packet written");
    }
}
