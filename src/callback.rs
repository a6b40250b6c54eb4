//! Session reaction hooks supplied by the application.

use std::sync::Arc;

use async_trait::async_trait;

use crate::packet::Packet;
use crate::session::Session;

/// Application logic driven by a session.
#[async_trait]
pub trait SessionCallback<T: Packet>: Send + Sync + 'static {
    /// Called once after the connection is accepted, before any loop runs.
    /// Returning `false` drops the connection without calling `on_close`.
    async fn on_connect(&self, session: &Arc<Session<T>>) -> bool;

    /// Called from the dispatch loop for every inbound packet, in arrival
    /// order. Returning `false` ends the session.
    async fn on_message(&self, session: &Arc<Session<T>>, packet: T) -> bool;

    /// Called exactly once when the session closes.
    fn on_close(&self, session: &Session<T>);
}
