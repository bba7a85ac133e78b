//! Non-blocking transport: endpoints, the connection lifecycle, and the
//! client-side I/O driver that multiplexes connections over one poll.

mod connection;
mod driver;
mod endpoint;

pub use connection::{ConnState, Connection};
pub use driver::{ConnId, DriverHandle, IoDriver};
pub use endpoint::Endpoint;
