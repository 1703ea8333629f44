//! Exponentially backed-off reachability probe for down hosts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::cluster::host::InetAddr;

/// Base unit of the probe backoff.
const PROBE_UNIT: Duration = Duration::from_millis(50);

/// Delay before the `n`th probe: `2^min(n, max) * 50ms`, where `max`
/// keeps the delay at or below `upper_bound`.
fn probe_delay(n: u32, upper_bound: Duration) -> Duration {
    let units = (upper_bound.as_millis() as u64 / PROBE_UNIT.as_millis() as u64).max(1);
    let max_n = units.ilog2();
    PROBE_UNIT * 2u32.pow(n.min(max_n))
}

/// Probes `addr` until it answers, then runs `on_up` and exits. Runs
/// under the jobs registry, so cancellation is external.
pub(crate) async fn run<P, Fut, U>(
    initial: Duration,
    upper_bound: Duration,
    addr: InetAddr,
    mut ping: P,
    on_up: U,
) where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    U: FnOnce(),
{
    sleep(initial).await;
    let mut n = 0u32;
    loop {
        sleep(probe_delay(n, upper_bound)).await;
        debug!(%addr, attempt = n, "probing host");
        if ping().await {
            info!(%addr, "host answered probe");
            on_up();
            return;
        }
        n += 1;
    }
}
