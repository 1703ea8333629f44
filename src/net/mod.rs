//! Sockets, the per-connection frame multiplexer and per-host pools.

pub mod connection;
pub mod pool;
pub mod socket;

pub use connection::Connection;
pub use pool::{ConnectionFactory, Pool};
pub use socket::{Socket, TlsContext};
