//! An asynchronous client for the Cassandra CQL native binary protocol
//! (versions 3 and 4).
//!
//! The client multiplexes many in-flight requests over a small number of
//! TCP (or TLS) connections using the protocol's 16-bit stream ids,
//! keeps a bounded connection pool per cluster node, discovers cluster
//! topology through a distinguished control connection, reacts to server
//! push events, probes down hosts with exponential backoff, and retries
//! failed requests according to a configurable policy.
//!
//! ```no_run
//! use cql_io::{Client, ClientSettings};
//! use cql_io::frame::request::QueryParams;
//!
//! # async fn example() -> cql_io::Result<()> {
//! let settings = ClientSettings::new(vec!["127.0.0.1".into()]);
//! let client = Client::init(settings).await?;
//! let response = client.query("SELECT cql_version FROM system.local", QueryParams::default()).await?;
//! println!("{response:?}");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! CQL value serialization is out of scope: query parameters are
//! pre-serialized cells and result rows pass through as raw bytes.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod error;
pub mod frame;
pub mod net;
pub mod policy;
pub mod prepared;
pub mod settings;
pub mod sync;
pub mod test_utils;
pub mod timeouts;

pub use client::Client;
pub use cluster::host::{Host, HostEvent, InetAddr};
pub use error::{Error, Result};
pub use frame::{Compression, Consistency, Version};
pub use policy::LoadBalancingPolicy;
pub use prepared::PreparedQuery;
pub use settings::{
    ClientSettings, ConnectionSettings, PoolSettings, PrepareStrategy, RetrySettings,
};
