//! Error types for the client, server, and batch layers.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by sessions, the server, and the batch coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection could not be established (refused, unreachable, bad address).
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Send failed on an open connection (e.g. peer reset).
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// Listener could not acquire its port. Fatal to server startup.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A bounded wait on connect, send, close, or batch completion expired.
    #[error("{op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u64 },

    /// An application callback failed while processing a received message.
    /// Caught and logged at the dispatcher boundary, never propagated to
    /// the connection that delivered the message.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// The I/O driver has shut down; no further operations are possible.
    #[error("I/O driver is closed")]
    Closed,

    /// Configuration could not be loaded.
    #[error("failed to read config file '{}': {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration could not be parsed.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    /// True for connection-establishment failures.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }

    /// True for expired bounded waits.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
