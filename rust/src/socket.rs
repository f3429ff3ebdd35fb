use std::time::Duration;

use crate::envelope::ReceivedEnvelope;
use crate::error::ObserverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    AuthenticationFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    /// The pipe is not up; reconnect right away.
    #[error("websocket unavailable")]
    Unavailable,
    /// Nothing arrived within the read timeout. Expected while idle.
    #[error("application level read timeout")]
    Timeout,
    #[error("websocket closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Called with each batch while the socket's read is in progress.
pub type BatchHandler<'a> = dyn FnMut(&[ReceivedEnvelope]) -> Result<(), ObserverError> + 'a;

/// The authenticated message pipe to the service.
///
/// `read_batch` invokes the handler from inside the read, and the handler
/// acks through `send_ack` on the same socket, so implementations must not
/// hold their own locks across the handler call.
pub trait MessageSocket: Send + Sync {
    fn connect(&self) -> Result<(), SocketError>;

    fn disconnect(&self);

    /// Reads up to `max_count` envelopes and hands them to `handler`.
    ///
    /// Returns `Ok(false)` when the server signalled that its queue is empty,
    /// `Ok(true)` when more may follow. Handler errors are passed through.
    fn read_batch(
        &self,
        timeout: Duration,
        max_count: usize,
        handler: &mut BatchHandler<'_>,
    ) -> Result<bool, ObserverError>;

    fn send_ack(&self, envelope: &ReceivedEnvelope) -> Result<(), SocketError>;

    /// A fresh subscription to low-level connection state changes.
    fn subscribe_state(&self) -> flume::Receiver<WebSocketConnectionState>;
}
