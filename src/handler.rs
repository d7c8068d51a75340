use crate::socket::Socket;

/// What the endpoint should do with a connection after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Re-arm read interest and return the socket to the poller.
    Open,
    /// Close the socket.
    Closed,
    /// Leave the socket parked; the handler owns the re-arm timing.
    Long,
}

/// The processing boundary of the endpoint.
///
/// Implementations are shared across worker threads and must synchronize any
/// internal state themselves. The socket handed in is non-blocking; a read
/// returning `WouldBlock` means the readiness that triggered the call has
/// been drained.
pub trait Handler: Send + Sync {
    /// Called for normal readiness on a connection.
    fn process(&self, socket: &Socket) -> SocketState;

    /// Called for long-poll readiness. `error` is true when the delivery
    /// arose from cancellation or failure (idle timeout, socket error)
    /// rather than data arriving.
    fn event(&self, socket: &Socket, error: bool) -> SocketState {
        let _ = (socket, error);
        SocketState::Closed
    }
}
