//! Server endpoint identification.

use crate::error::Error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// A server to connect to or bind to. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address, taking the first resolution result.
    /// Resolution failure is a connect failure as far as callers care.
    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Connect {
                endpoint: self.to_string(),
                source: e,
            })?;
        addrs.next().ok_or_else(|| Error::Connect {
            endpoint: self.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}
