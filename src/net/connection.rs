//! Connection lifecycle state machine.
//!
//! A connection moves strictly forward through
//! `Idle -> Connecting -> Open -> Closing -> Closed`, with two error exits:
//! a failed connect jumps `Connecting -> Closed`, and an I/O failure on an
//! open connection enters `Open -> Closing`. No state is ever revisited; a
//! `Closed` connection cannot be reopened, callers construct a new one.

use crate::net::Endpoint;
use mio::net::TcpStream;

/// Current lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, no socket activity yet.
    Idle,
    /// Non-blocking connect issued, handshake in flight.
    Connecting,
    /// Established; sends and receive notifications are possible.
    Open,
    /// Close initiated (locally, by the peer, or by an I/O failure).
    Closing,
    /// Terminal; resources released.
    Closed,
}

impl ConnState {
    /// Whether the lifecycle DAG permits moving from `self` to `next`.
    pub fn can_advance_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnState::Closed
    }
}

/// One client-side or server-side connection: the peer it talks to, the
/// non-blocking stream, and where it sits in the lifecycle.
///
/// Owned exclusively by the session or accept path that created it; never
/// shared across threads.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    stream: TcpStream,
    state: ConnState,
}

impl Connection {
    /// A client-initiated connection with the handshake still in flight.
    pub fn connecting(endpoint: Endpoint, stream: TcpStream) -> Self {
        Self {
            endpoint,
            stream,
            state: ConnState::Connecting,
        }
    }

    /// An accepted connection, already established.
    pub fn accepted(endpoint: Endpoint, stream: TcpStream) -> Self {
        Self {
            endpoint,
            stream,
            state: ConnState::Open,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Handshake completed.
    pub fn established(&mut self) {
        self.advance(ConnState::Open);
    }

    /// Connect failed; terminal.
    pub fn connect_failed(&mut self) {
        self.advance(ConnState::Closed);
    }

    /// Close initiated, locally or by an I/O failure.
    pub fn begin_close(&mut self) {
        self.advance(ConnState::Closing);
    }

    /// Resources released; terminal.
    pub fn closed(&mut self) {
        self.advance(ConnState::Closed);
    }

    fn advance(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal connection transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_is_forward_only() {
        use ConnState::*;
        assert!(Idle.can_advance_to(Connecting));
        assert!(Connecting.can_advance_to(Open));
        assert!(Open.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));

        // Error exits
        assert!(Connecting.can_advance_to(Closed));

        // No state is ever revisited
        assert!(!Open.can_advance_to(Connecting));
        assert!(!Closing.can_advance_to(Open));
        assert!(!Closed.can_advance_to(Idle));
        assert!(!Closed.can_advance_to(Connecting));
        assert!(!Closed.can_advance_to(Open));
    }

    #[test]
    fn test_closed_is_terminal() {
        use ConnState::*;
        assert!(Closed.is_terminal());
        for state in [Idle, Connecting, Open, Closing] {
            assert!(!state.is_terminal());
            assert!(!Closed.can_advance_to(state));
        }
    }

    #[test]
    fn test_open_cannot_jump_straight_to_closed() {
        // An open connection always passes through Closing first.
        assert!(!ConnState::Open.can_advance_to(ConnState::Closed));
    }
}
