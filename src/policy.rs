//! Pluggable host selection strategies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::cluster::host::{Host, HostEvent, InetAddr};

/// Host selection strategy fed cluster membership events.
///
/// `select` runs on every request and `on_event` inside event-signal
/// handlers, so implementations must be internally synchronized and
/// must never block.
pub trait LoadBalancingPolicy: fmt::Display + Send + Sync {
    /// Installs the initial host sets discovered by the controller.
    fn setup(&self, up: Vec<Host>, down: Vec<Host>);

    /// Feeds one membership change.
    fn on_event(&self, event: &HostEvent);

    /// Picks a host for one request; `None` when nothing is selectable.
    fn select(&self) -> Option<Host>;

    /// Whether a newly discovered host may be used at all. Checked by
    /// the controller before a pool is created.
    fn acceptable(&self, host: &Host) -> bool;

    /// Number of currently selectable hosts; bounds the per-request
    /// host-selection loop.
    fn host_count(&self) -> usize;

    /// Snapshot of all currently selectable hosts.
    fn current(&self) -> Vec<Host>;
}

/// Up/down bookkeeping shared by the built-in policies.
#[derive(Default)]
struct HostSets {
    up: Vec<Host>,
    down: Vec<Host>,
}

impl HostSets {
    fn insert_up(&mut self, host: Host) {
        self.down.retain(|h| h != &host);
        if !self.up.contains(&host) {
            self.up.push(host);
        }
    }

    fn mark_up(&mut self, addr: InetAddr) {
        if let Some(i) = self.down.iter().position(|h| h.addr() == addr) {
            let host = self.down.remove(i);
            self.insert_up(host);
        }
    }

    fn mark_down(&mut self, addr: InetAddr) {
        if let Some(i) = self.up.iter().position(|h| h.addr() == addr) {
            let host = self.up.remove(i);
            if !self.down.contains(&host) {
                self.down.push(host);
            }
        }
    }

    fn remove(&mut self, addr: InetAddr) {
        self.up.retain(|h| h.addr() != addr);
        self.down.retain(|h| h.addr() != addr);
    }
}

fn apply_event(sets: &Mutex<HostSets>, event: &HostEvent, accept: impl Fn(&Host) -> bool) {
    let mut sets = sets.lock().unwrap();
    match event {
        HostEvent::New(host) => {
            if accept(host) {
                sets.insert_up(host.clone());
            }
        }
        HostEvent::Up(addr) => sets.mark_up(*addr),
        HostEvent::Down(addr) => sets.mark_down(*addr),
        HostEvent::Gone(addr) => sets.remove(*addr),
    }
}

/// Cycles through all up hosts in discovery order.
pub struct RoundRobinPolicy {
    hosts: Mutex<HostSets>,
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy {
            hosts: Mutex::new(HostSets::default()),
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        RoundRobinPolicy::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn setup(&self, up: Vec<Host>, down: Vec<Host>) {
        *self.hosts.lock().unwrap() = HostSets { up, down };
    }

    fn on_event(&self, event: &HostEvent) {
        apply_event(&self.hosts, event, |h| self.acceptable(h));
    }

    fn select(&self) -> Option<Host> {
        let sets = self.hosts.lock().unwrap();
        if sets.up.is_empty() {
            return None;
        }
        let i = self.counter.fetch_add(1, Ordering::Relaxed) % sets.up.len();
        Some(sets.up[i].clone())
    }

    fn acceptable(&self, _host: &Host) -> bool {
        true
    }

    fn host_count(&self) -> usize {
        self.hosts.lock().unwrap().up.len()
    }

    fn current(&self) -> Vec<Host> {
        self.hosts.lock().unwrap().up.clone()
    }
}

impl fmt::Display for RoundRobinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("round-robin")
    }
}

/// Round robin over hosts of a single datacentre; everything else is
/// rejected at discovery.
pub struct DcRoundRobinPolicy {
    data_centre: String,
    inner: RoundRobinPolicy,
}

impl DcRoundRobinPolicy {
    pub fn new(data_centre: impl Into<String>) -> Self {
        DcRoundRobinPolicy {
            data_centre: data_centre.into(),
            inner: RoundRobinPolicy::new(),
        }
    }
}

impl LoadBalancingPolicy for DcRoundRobinPolicy {
    fn setup(&self, up: Vec<Host>, down: Vec<Host>) {
        let up = up.into_iter().filter(|h| self.acceptable(h)).collect();
        let down = down.into_iter().filter(|h| self.acceptable(h)).collect();
        self.inner.setup(up, down);
    }

    fn on_event(&self, event: &HostEvent) {
        apply_event(&self.inner.hosts, event, |h| self.acceptable(h));
    }

    fn select(&self) -> Option<Host> {
        self.inner.select()
    }

    fn acceptable(&self, host: &Host) -> bool {
        host.data_centre() == self.data_centre
    }

    fn host_count(&self) -> usize {
        self.inner.host_count()
    }

    fn current(&self) -> Vec<Host> {
        self.inner.current()
    }
}

impl fmt::Display for DcRoundRobinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc-round-robin({})", self.data_centre)
    }
}

/// Uniformly random selection over all up hosts.
pub struct RandomPolicy {
    hosts: Mutex<HostSets>,
}

impl RandomPolicy {
    pub fn new() -> Self {
        RandomPolicy {
            hosts: Mutex::new(HostSets::default()),
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        RandomPolicy::new()
    }
}

impl LoadBalancingPolicy for RandomPolicy {
    fn setup(&self, up: Vec<Host>, down: Vec<Host>) {
        *self.hosts.lock().unwrap() = HostSets { up, down };
    }

    fn on_event(&self, event: &HostEvent) {
        apply_event(&self.hosts, event, |h| self.acceptable(h));
    }

    fn select(&self) -> Option<Host> {
        let sets = self.hosts.lock().unwrap();
        if sets.up.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..sets.up.len());
        Some(sets.up[i].clone())
    }

    fn acceptable(&self, _host: &Host) -> bool {
        true
    }

    fn host_count(&self) -> usize {
        self.hosts.lock().unwrap().up.len()
    }

    fn current(&self) -> Vec<Host> {
        self.hosts.lock().unwrap().up.clone()
    }
}

impl fmt::Display for RandomPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("random")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last: u8, dc: &str) -> Host {
        Host::new(InetAddr::new([10, 0, 0, last].into(), 9042), dc, "r1")
    }

    #[test]
    fn round_robin_cycles_over_up_hosts() {
        let policy = RoundRobinPolicy::new();
        policy.setup(vec![host(1, "dc1"), host(2, "dc1")], vec![]);

        let picks: Vec<_> = (0..4).map(|_| policy.select().unwrap().addr()).collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
        assert_eq!(policy.host_count(), 2);
    }

    #[test]
    fn down_and_up_events_move_hosts_between_sets() {
        let policy = RoundRobinPolicy::new();
        let a = host(1, "dc1");
        policy.setup(vec![a.clone(), host(2, "dc1")], vec![]);

        policy.on_event(&HostEvent::Down(a.addr()));
        assert_eq!(policy.host_count(), 1);
        assert!(policy.current().iter().all(|h| h.addr() != a.addr()));

        policy.on_event(&HostEvent::Up(a.addr()));
        assert_eq!(policy.host_count(), 2);
    }

    #[test]
    fn gone_hosts_are_forgotten() {
        let policy = RoundRobinPolicy::new();
        let a = host(1, "dc1");
        policy.setup(vec![a.clone()], vec![]);
        policy.on_event(&HostEvent::Gone(a.addr()));
        assert_eq!(policy.host_count(), 0);
        assert!(policy.select().is_none());

        // a later up event for the departed host must not resurrect it
        policy.on_event(&HostEvent::Up(a.addr()));
        assert_eq!(policy.host_count(), 0);
    }

    #[test]
    fn dc_policy_filters_foreign_datacentres() {
        let policy = DcRoundRobinPolicy::new("dc1");
        assert!(policy.acceptable(&host(1, "dc1")));
        assert!(!policy.acceptable(&host(2, "dc2")));

        policy.setup(vec![host(1, "dc1"), host(2, "dc2")], vec![]);
        assert_eq!(policy.host_count(), 1);

        policy.on_event(&HostEvent::New(host(3, "dc2")));
        assert_eq!(policy.host_count(), 1);
        policy.on_event(&HostEvent::New(host(4, "dc1")));
        assert_eq!(policy.host_count(), 2);
    }

    #[test]
    fn random_policy_only_picks_up_hosts() {
        let policy = RandomPolicy::new();
        let a = host(1, "dc1");
        policy.setup(vec![a.clone()], vec![host(2, "dc1")]);
        for _ in 0..16 {
            assert_eq!(policy.select().unwrap().addr(), a.addr());
        }
    }

    #[test]
    fn policies_name_themselves() {
        assert_eq!(RoundRobinPolicy::new().to_string(), "round-robin");
        assert_eq!(
            DcRoundRobinPolicy::new("dc9").to_string(),
            "dc-round-robin(dc9)"
        );
        assert_eq!(RandomPolicy::new().to_string(), "random");
    }
}
