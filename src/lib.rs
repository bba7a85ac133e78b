//! burstwire: a minimal TCP message-exchange pair.
//!
//! A client opens a one-shot connection, sends a single text message, and
//! closes; a server accepts connections and logs whatever text arrives. The
//! interesting part is the orchestration around that: an event-driven
//! transport multiplexing many connection lifecycles over a few threads, a
//! dispatcher pool keeping application handling off the I/O threads, and a
//! completion barrier that lets a driver run N concurrent sessions and block
//! until all N finish.
//!
//! There is deliberately no wire protocol: raw UTF-8 bytes, one message per
//! connection, no framing (see [`codec`]).

pub mod batch;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod net;
pub mod server;
pub mod session;

pub use batch::{BatchCoordinator, BatchReport, CompletionBarrier};
pub use codec::{Message, TextCodec};
pub use config::Config;
pub use dispatcher::{Dispatcher, LogHandler, MessageHandler, OverflowPolicy};
pub use error::{Error, Result};
pub use net::{ConnId, ConnState, DriverHandle, Endpoint, IoDriver};
pub use server::ServerListener;
pub use session::{send_once, Client, ClientSession};
