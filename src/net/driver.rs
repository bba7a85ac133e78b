//! Client-side I/O driver.
//!
//! One thread owns a mio `Poll` and multiplexes every client connection over
//! it. Sessions talk to the driver through a cloneable [`DriverHandle`]:
//! each operation (connect, send, close) goes over a command channel, the
//! poll is woken, and the caller blocks on a per-operation reply channel
//! with the configured timeout. Blocked callers are bounded by the batch
//! worker pool, not by the number of sessions.
//!
//! Within one connection the driver replies to `send` only once the payload
//! is fully flushed to the socket, so a session's send-then-close ordering
//! holds. Across connections there is no ordering.

use crate::codec::TextCodec;
use crate::dispatcher::DispatcherHandle;
use crate::error::{Error, Result};
use crate::net::{ConnState, Connection, Endpoint};
use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Identifier of a live client connection inside the driver.
pub type ConnId = usize;

enum Command {
    Connect {
        endpoint: Endpoint,
        reply: Sender<Result<ConnId>>,
    },
    Send {
        conn: ConnId,
        bytes: Bytes,
        reply: Sender<Result<()>>,
    },
    Close {
        conn: ConnId,
        reply: Sender<Result<()>>,
    },
    Shutdown,
}

/// Cloneable front door to the driver thread.
#[derive(Clone)]
pub struct DriverHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
    io_timeout: Duration,
}

impl DriverHandle {
    /// Open a connection and block until it is established or fails.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<ConnId> {
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(
            Command::Connect {
                endpoint: endpoint.clone(),
                reply: reply_tx,
            },
            reply_rx,
            "connect",
        )
    }

    /// Send a payload and block until it is flushed to the socket.
    pub fn send(&self, conn: ConnId, bytes: Bytes) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(
            Command::Send {
                conn,
                bytes,
                reply: reply_tx,
            },
            reply_rx,
            "send",
        )
    }

    /// Close a connection. Idempotent: closing an unknown or already-closed
    /// connection succeeds.
    pub fn close(&self, conn: ConnId) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.submit(Command::Close { conn, reply: reply_tx }, reply_rx, "close")
    }

    fn submit<T>(&self, command: Command, reply_rx: Receiver<Result<T>>, op: &'static str) -> Result<T> {
        self.tx.send(command).map_err(|_| Error::Closed)?;
        self.waker.wake().map_err(|_| Error::Closed)?;
        match reply_rx.recv_timeout(self.io_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                op,
                millis: self.io_timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }
}

/// The driver thread plus its handle.
pub struct IoDriver {
    handle: DriverHandle,
    thread: Option<JoinHandle<()>>,
}

impl IoDriver {
    /// Spawn the driver thread.
    pub fn start(
        buffer_size: usize,
        io_timeout: Duration,
        dispatcher: DispatcherHandle,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = unbounded();

        let thread = std::thread::Builder::new()
            .name("client-io".to_string())
            .spawn(move || {
                let mut loop_state = DriverLoop::new(poll, rx, dispatcher, buffer_size);
                if let Err(e) = loop_state.run() {
                    error!(error = %e, "client I/O driver failed");
                }
            })?;

        Ok(Self {
            handle: DriverHandle {
                tx,
                waker,
                io_timeout,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    /// Stop the driver thread, failing any in-flight operations.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(Command::Shutdown);
            let _ = self.handle.waker.wake();
            let _ = thread.join();
        }
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PendingWrite {
    bytes: Bytes,
    written: usize,
    reply: Sender<Result<()>>,
}

struct ClientConn {
    conn: Connection,
    /// Reply slot for an in-flight connect, consumed on establishment.
    connect_reply: Option<Sender<Result<ConnId>>>,
    /// At most one write is ever in flight per connection.
    pending_write: Option<PendingWrite>,
}

struct DriverLoop {
    poll: Poll,
    rx: Receiver<Command>,
    dispatcher: DispatcherHandle,
    connections: Slab<ClientConn>,
    read_buf: Vec<u8>,
}

impl DriverLoop {
    fn new(poll: Poll, rx: Receiver<Command>, dispatcher: DispatcherHandle, buffer_size: usize) -> Self {
        Self {
            poll,
            rx,
            dispatcher,
            connections: Slab::new(),
            read_buf: vec![0u8; buffer_size],
        }
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            self.poll.poll(&mut events, None)?;

            if !self.drain_commands() {
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(id) => self.handle_event(id, event.is_readable(), event.is_writable()),
                }
            }
        }

        self.fail_all_pending();
        debug!("client I/O driver stopped");
        Ok(())
    }

    /// Returns false once a shutdown command is seen.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Connect { endpoint, reply } => self.start_connect(endpoint, reply),
                Command::Send { conn, bytes, reply } => self.start_send(conn, bytes, reply),
                Command::Close { conn, reply } => {
                    self.close_conn(conn);
                    let _ = reply.send(Ok(()));
                }
                Command::Shutdown => return false,
            }
        }
        true
    }

    fn start_connect(&mut self, endpoint: Endpoint, reply: Sender<Result<ConnId>>) {
        let addr = match endpoint.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = reply.send(Err(Error::Connect {
                    endpoint: endpoint.to_string(),
                    source: e,
                }));
                return;
            }
        };

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        // The writable event tells us the handshake finished (or failed).
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(conn_id), Interest::WRITABLE)
        {
            let _ = reply.send(Err(Error::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            }));
            return;
        }
        entry.insert(ClientConn {
            conn: Connection::connecting(endpoint, stream),
            connect_reply: Some(reply),
            pending_write: None,
        });
        trace!(conn_id, "connect in flight");
    }

    fn start_send(&mut self, conn_id: ConnId, bytes: Bytes, reply: Sender<Result<()>>) {
        let Some(client) = self.connections.get_mut(conn_id) else {
            let _ = reply.send(Err(Error::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is gone",
            ))));
            return;
        };

        if client.conn.state() != ConnState::Open {
            let _ = reply.send(Err(Error::Write(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not open",
            ))));
            return;
        }

        debug_assert!(client.pending_write.is_none(), "one write in flight per connection");
        client.pending_write = Some(PendingWrite {
            bytes,
            written: 0,
            reply,
        });
        self.flush_pending(conn_id);
    }

    /// Write until done or WouldBlock. Completes the pending reply when the
    /// whole payload has reached the socket.
    fn flush_pending(&mut self, conn_id: ConnId) {
        let Some(client) = self.connections.get_mut(conn_id) else {
            return;
        };
        let Some(pending) = client.pending_write.as_mut() else {
            return;
        };

        loop {
            if pending.written == pending.bytes.len() {
                let pending = client.pending_write.take().expect("pending write present");
                let _ = pending.reply.send(Ok(()));
                // Back to read-only interest; nothing left to flush.
                if let Err(e) = self.poll.registry().reregister(
                    client.conn.stream_mut(),
                    Token(conn_id),
                    Interest::READABLE,
                ) {
                    warn!(conn_id, error = %e, "reregister after flush failed");
                }
                trace!(conn_id, "send flushed");
                return;
            }

            match client.conn.stream_mut().write(&pending.bytes[pending.written..]) {
                Ok(0) => {
                    let pending = client.pending_write.take().expect("pending write present");
                    let _ = pending.reply.send(Err(Error::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ))));
                    self.teardown_conn(conn_id);
                    return;
                }
                Ok(n) => pending.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Wait for the next writable event; keep reading too so
                    // a peer close is still observed.
                    if let Err(e) = self.poll.registry().reregister(
                        client.conn.stream_mut(),
                        Token(conn_id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(conn_id, error = %e, "reregister for write failed");
                    }
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let pending = client.pending_write.take().expect("pending write present");
                    let _ = pending.reply.send(Err(Error::Write(e)));
                    self.teardown_conn(conn_id);
                    return;
                }
            }
        }
    }

    fn handle_event(&mut self, conn_id: usize, readable: bool, writable: bool) {
        if !self.connections.contains(conn_id) {
            return;
        }

        if writable {
            let state = self.connections[conn_id].conn.state();
            match state {
                ConnState::Connecting => self.finish_connect(conn_id),
                ConnState::Open => self.flush_pending(conn_id),
                _ => {}
            }
        }

        if readable && self.connections.contains(conn_id) {
            self.handle_readable(conn_id);
        }
    }

    /// First writable event after a non-blocking connect: `take_error`
    /// distinguishes an established connection from a refused one.
    fn finish_connect(&mut self, conn_id: ConnId) {
        let client = &mut self.connections[conn_id];
        match client.conn.stream_mut().take_error() {
            Ok(None) => {
                client.conn.established();
                let endpoint = client.conn.endpoint().clone();
                let delivered = match client.connect_reply.take() {
                    Some(reply) => reply.send(Ok(conn_id)).is_ok(),
                    None => false,
                };
                if !delivered {
                    // The caller timed out and is gone; nobody owns this
                    // connection, so release it.
                    debug!(conn_id, endpoint = %endpoint, "connect completed with no waiter");
                    self.close_conn(conn_id);
                    return;
                }
                if let Err(e) = self.poll.registry().reregister(
                    client.conn.stream_mut(),
                    Token(conn_id),
                    Interest::READABLE,
                ) {
                    warn!(conn_id, error = %e, "reregister after connect failed");
                }
                debug!(conn_id, endpoint = %endpoint, "connection established");
            }
            Ok(Some(e)) | Err(e) => {
                let endpoint = client.conn.endpoint().to_string();
                debug!(conn_id, endpoint = %endpoint, error = %e, "connect failed");
                client.conn.connect_failed();
                let reply = client.connect_reply.take();
                self.remove_conn(conn_id);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::Connect { endpoint, source: e }));
                }
            }
        }
    }

    fn handle_readable(&mut self, conn_id: ConnId) {
        loop {
            let client = match self.connections.get_mut(conn_id) {
                Some(c) if c.conn.state() == ConnState::Open => c,
                _ => return,
            };

            match client.conn.stream_mut().read(&mut self.read_buf) {
                Ok(0) => {
                    trace!(conn_id, "peer closed connection");
                    self.teardown_conn(conn_id);
                    return;
                }
                Ok(n) => {
                    // The bytes of one read are one message; no reassembly.
                    let message = TextCodec::decode(&self.read_buf[..n]);
                    self.dispatcher.submit(conn_id, message);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "read failed");
                    self.teardown_conn(conn_id);
                    return;
                }
            }
        }
    }

    /// Local close requested. Succeeds whether or not the connection exists.
    fn close_conn(&mut self, conn_id: ConnId) {
        if !self.connections.contains(conn_id) {
            return;
        }
        let client = &mut self.connections[conn_id];
        if client.conn.state() == ConnState::Open {
            client.conn.begin_close();
        }
        if let Some(pending) = client.pending_write.take() {
            let _ = pending.reply.send(Err(Error::Closed));
        }
        self.remove_conn(conn_id);
        debug!(conn_id, "connection closed");
    }

    /// Close after an I/O failure or peer close; fails any pending write.
    fn teardown_conn(&mut self, conn_id: ConnId) {
        let Some(client) = self.connections.get_mut(conn_id) else {
            return;
        };
        if client.conn.state() == ConnState::Open {
            client.conn.begin_close();
        }
        if let Some(pending) = client.pending_write.take() {
            let _ = pending.reply.send(Err(Error::Write(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection lost",
            ))));
        }
        self.remove_conn(conn_id);
    }

    /// Deregister and drop the stream, releasing per-connection resources.
    fn remove_conn(&mut self, conn_id: ConnId) {
        if !self.connections.contains(conn_id) {
            return;
        }
        let mut client = self.connections.remove(conn_id);
        if client.conn.state() == ConnState::Closing {
            client.conn.closed();
        }
        let _ = self.poll.registry().deregister(client.conn.stream_mut());
    }

    fn fail_all_pending(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            let client = &mut self.connections[id];
            if let Some(reply) = client.connect_reply.take() {
                let _ = reply.send(Err(Error::Closed));
            }
            if let Some(pending) = client.pending_write.take() {
                let _ = pending.reply.send(Err(Error::Closed));
            }
            self.remove_conn(id);
        }
    }
}
