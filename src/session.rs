//! Client-side sessions.
//!
//! A [`ClientSession`] is one connect, one message, one disconnect, then
//! terminal. There is no retry anywhere: a caller that wants another attempt
//! runs a new session. [`Client`] is the long-lived variant a hosting
//! process keeps around, with the idempotent `disconnect` its teardown hook
//! calls.

use crate::codec::TextCodec;
use crate::error::Result;
use crate::net::{ConnId, DriverHandle, Endpoint};
use tracing::debug;

/// One connect -> send -> disconnect cycle. Single-use.
pub struct ClientSession {
    handle: DriverHandle,
}

impl ClientSession {
    pub fn new(handle: DriverHandle) -> Self {
        Self { handle }
    }

    /// Open a fresh connection, send the message once it is open, close once
    /// the send has flushed, and return after the close.
    ///
    /// Close is attempted on the way out even when the send failed, so the
    /// transport resources never leak; the send error wins.
    pub fn run(self, endpoint: &Endpoint, text: &str) -> Result<()> {
        let conn = self.handle.connect(endpoint)?;
        debug!(conn, endpoint = %endpoint, "session connected");

        let sent = self.handle.send(conn, TextCodec::encode(text));
        let closed = self.handle.close(conn);

        sent?;
        closed?;
        debug!(conn, "session finished");
        Ok(())
    }
}

/// Trigger entry point for an external layer (e.g. an HTTP endpoint):
/// construct one session and run it.
pub fn send_once(handle: &DriverHandle, endpoint: &Endpoint, text: &str) -> Result<()> {
    ClientSession::new(handle.clone()).run(endpoint, text)
}

/// A long-lived client owning at most one open connection.
pub struct Client {
    handle: DriverHandle,
    endpoint: Endpoint,
    conn: Option<ConnId>,
}

impl Client {
    pub fn new(handle: DriverHandle, endpoint: Endpoint) -> Self {
        Self {
            handle,
            endpoint,
            conn: None,
        }
    }

    /// Establish the connection if none is open.
    pub fn connect(&mut self) -> Result<()> {
        if self.conn.is_none() {
            self.conn = Some(self.handle.connect(&self.endpoint)?);
        }
        Ok(())
    }

    /// Connect, send, disconnect, as one operation.
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        self.connect()?;
        let conn = self.conn.expect("connect just succeeded");
        let sent = self.handle.send(conn, TextCodec::encode(text));
        let closed = self.disconnect();
        sent?;
        closed
    }

    /// Close the live connection, if any. Idempotent: calling this with no
    /// open connection (or twice in a row) succeeds and releases nothing
    /// twice. Hosting processes call this once at teardown.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.handle.close(conn),
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, LogHandler, OverflowPolicy};
    use crate::net::IoDriver;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_driver() -> (IoDriver, Dispatcher) {
        let dispatcher = Dispatcher::new(1, 16, OverflowPolicy::Block, Arc::new(LogHandler));
        let driver = IoDriver::start(4096, Duration::from_secs(2), dispatcher.handle())
            .expect("driver start");
        (driver, dispatcher)
    }

    /// Accept one connection and return everything read from it until EOF.
    fn accepting_peer() -> (Endpoint, mpsc::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut data = Vec::new();
                let _ = stream.read_to_end(&mut data);
                let _ = tx.send(data);
            }
        });
        (endpoint, rx)
    }

    #[test]
    fn test_session_delivers_payload_then_closes() {
        let (driver, _dispatcher) = test_driver();
        let (endpoint, rx) = accepting_peer();

        ClientSession::new(driver.handle())
            .run(&endpoint, "My message 1")
            .unwrap();

        // read_to_end returning means the session really closed the socket.
        let data = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(data, b"My message 1");
    }

    #[test]
    fn test_session_connect_refused() {
        let (driver, _dispatcher) = test_driver();
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = ClientSession::new(driver.handle())
            .run(&Endpoint::new("127.0.0.1", port), "nope")
            .unwrap_err();
        assert!(err.is_connect(), "expected connect error, got {err}");
    }

    #[test]
    fn test_send_once_trigger() {
        let (driver, _dispatcher) = test_driver();
        let (endpoint, rx) = accepting_peer();

        send_once(&driver.handle(), &endpoint, "triggered").unwrap();
        let data = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(data, b"triggered");
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (driver, _dispatcher) = test_driver();
        let (endpoint, _rx) = accepting_peer();

        let mut client = Client::new(driver.handle(), endpoint);
        client.connect().unwrap();
        assert!(client.is_connected());

        client.disconnect().unwrap();
        assert!(!client.is_connected());
        // Second call has nothing to release and still succeeds.
        client.disconnect().unwrap();
    }

    #[test]
    fn test_disconnect_with_no_connection_is_ok() {
        let (driver, _dispatcher) = test_driver();
        let mut client = Client::new(driver.handle(), Endpoint::new("127.0.0.1", 1));
        client.disconnect().unwrap();
    }
}
