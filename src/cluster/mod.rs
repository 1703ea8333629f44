//! Cluster membership: hosts, control connection, background jobs and
//! down-host monitoring.

pub mod control;
pub mod host;
pub mod jobs;
pub mod monitor;

pub use control::{Control, ControlState};
pub use host::{Host, HostEvent, InetAddr};
pub use jobs::Jobs;
