//! Host identity and cluster membership events.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Socket address of a cluster node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        InetAddr(SocketAddr::new(ip, port))
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        InetAddr(addr)
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A known cluster node with its placement metadata, discovered from
/// `system.local` / `system.peers` or a topology event.
///
/// Equality, ordering and hashing are by address alone; datacentre and
/// rack are informational.
#[derive(Debug, Clone)]
pub struct Host {
    addr: InetAddr,
    data_centre: String,
    rack: String,
}

impl Host {
    pub fn new(addr: InetAddr, data_centre: impl Into<String>, rack: impl Into<String>) -> Self {
        Host {
            addr,
            data_centre: data_centre.into(),
            rack: rack.into(),
        }
    }

    pub fn addr(&self) -> InetAddr {
        self.addr
    }

    pub fn data_centre(&self) -> &str {
        &self.data_centre
    }

    pub fn rack(&self) -> &str {
        &self.rack
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Host {}

impl PartialOrd for Host {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Host {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}/{}", self.addr, self.data_centre, self.rack)
    }
}

/// Cluster membership change as delivered to load-balancing policies.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A node joined the cluster.
    New(Host),
    /// A node left the cluster.
    Gone(InetAddr),
    /// A known node answered a probe or was reported up.
    Up(InetAddr),
    /// A known node was reported down.
    Down(InetAddr),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(last: u8, port: u16) -> InetAddr {
        InetAddr::new(IpAddr::from([10, 0, 0, last]), port)
    }

    #[test]
    fn host_identity_is_address_only() {
        let a = Host::new(addr(1, 9042), "dc1", "r1");
        let b = Host::new(addr(1, 9042), "dc2", "r9");
        let c = Host::new(addr(2, 9042), "dc1", "r1");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn hosts_order_by_address() {
        let mut hosts = vec![
            Host::new(addr(9, 9042), "dc1", "r1"),
            Host::new(addr(1, 9042), "dc1", "r1"),
        ];
        hosts.sort();
        assert_eq!(hosts[0].addr(), addr(1, 9042));
    }
}
