//! Typed session notifications.

use crate::error::ConnectError;

/// What the consumer wants after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// Issue the next read immediately.
    More,
    /// Stop reading until [`Session::pull`](crate::Session::pull) is called.
    Pause,
}

/// Receives the notifications a session emits.
///
/// Every method runs on the thread driving the session. A panic inside one
/// is caught and routed to the fault channel.
pub trait SessionEvents {
    /// The handshake succeeded.
    fn on_connected(&mut self, _max_message_size: u32) {}

    /// The handshake failed.
    fn on_error(&mut self, _error: &ConnectError) {}

    /// An inbound message arrived.
    ///
    /// `data` borrows the session's read buffer, which the next read
    /// overwrites; copy it to keep it.
    fn on_data(&mut self, data: &[u8]) -> Demand;

    /// The inbound stream ended. No further data follows.
    fn on_end(&mut self) {}
}
