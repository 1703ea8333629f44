//! Bounded per-host pool of multiplexed connections.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::cluster::host::InetAddr;
use crate::error::{Error, Result};
use crate::frame::Version;
use crate::net::connection::Connection;
use crate::settings::{ConnectionSettings, PoolSettings};
use crate::timeouts::TimeoutManager;

/// Opens a fresh connection for the pool's host.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<Connection>>;
}

struct Idle {
    conn: Arc<Connection>,
    since: Instant,
}

/// Bounded pool with create-on-demand and idle eviction.
///
/// The semaphore caps in-use connections at `max_connections`;
/// acquisition waits at most `wait_queue_timeout` before the host
/// counts as busy. Idle connections past `idle_timeout` are closed at
/// checkout instead of reused.
pub struct Pool {
    host: InetAddr,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Idle>>,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(
        host: InetAddr,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_connections));
        Pool {
            host,
            settings,
            factory,
            slots,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Scoped acquisition: acquire a connection, run `action`, release
    /// on every exit path. A connection whose action failed is closed
    /// rather than returned to the idle queue.
    pub async fn with<F, Fut, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let permit = timeout(
            self.settings.wait_queue_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::HostsBusy)?
        .map_err(|_| Error::Shutdown)?;

        let conn = match self.checkout() {
            Some(conn) => conn,
            None => self.factory.open().await?,
        };

        let result = action(conn.clone()).await;
        match &result {
            Ok(_) => self.release(conn),
            Err(e) => {
                debug!(host = %self.host, error = %e, "closing connection after failed action");
                conn.close();
            }
        }
        drop(permit);
        result
    }

    fn checkout(&self) -> Option<Arc<Connection>> {
        let mut idle = self.idle.lock().unwrap();
        while let Some(entry) = idle.pop() {
            if entry.since.elapsed() > self.settings.idle_timeout {
                debug!(host = %self.host, "evicting idle connection");
                entry.conn.close();
                continue;
            }
            if !entry.conn.is_open() {
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn release(&self, conn: Arc<Connection>) {
        if self.closed.load(Ordering::Acquire) || !conn.is_open() {
            conn.close();
            return;
        }
        self.idle.lock().unwrap().push(Idle {
            conn,
            since: Instant::now(),
        });
    }

    /// Closes every pooled connection and fails future acquisitions.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        let drained: Vec<Idle> = std::mem::take(&mut *self.idle.lock().unwrap());
        debug!(host = %self.host, connections = drained.len(), "destroying pool");
        for entry in drained {
            entry.conn.close();
        }
    }
}

/// Reachability check: a short-lived throwaway connection with a tight
/// connect budget, closed again immediately.
pub(crate) async fn ping(
    mut settings: ConnectionSettings,
    tm: Arc<TimeoutManager>,
    version: Version,
    addr: InetAddr,
) -> bool {
    settings.connect_timeout = Duration::from_secs(5);
    settings.default_keyspace = None;
    match Connection::connect(settings, tm, version, addr).await {
        Ok(conn) => {
            conn.close();
            true
        }
        Err(e) => {
            debug!(%addr, error = %e, "ping failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Factory that refuses to open anything; pools under test run on
    /// the wait queue only.
    struct NoFactory(AtomicUsize);

    #[async_trait]
    impl ConnectionFactory for NoFactory {
        async fn open(&self) -> Result<Arc<Connection>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::NoHostAvailable)
        }
    }

    fn test_pool(max_connections: usize, wait: Duration) -> Pool {
        let settings = PoolSettings {
            max_connections,
            idle_timeout: Duration::from_secs(60),
            wait_queue_timeout: wait,
        };
        Pool::new(
            InetAddr::new([127, 0, 0, 1].into(), 9042),
            settings,
            Arc::new(NoFactory(AtomicUsize::new(0))),
        )
    }

    #[tokio::test]
    async fn factory_errors_propagate() {
        let pool = test_pool(1, Duration::from_millis(100));
        let res = pool
            .with(|_conn| async move { Ok::<_, Error>(()) })
            .await;
        assert!(matches!(res, Err(Error::NoHostAvailable)));
    }

    /// Factory that parks forever, pinning its caller's pool slot.
    struct StuckFactory;

    #[async_trait]
    impl ConnectionFactory for StuckFactory {
        async fn open(&self) -> Result<Arc<Connection>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn saturated_pool_times_out_with_hosts_busy() {
        let settings = PoolSettings {
            max_connections: 1,
            idle_timeout: Duration::from_secs(60),
            wait_queue_timeout: Duration::from_millis(50),
        };
        let pool = Arc::new(Pool::new(
            InetAddr::new([127, 0, 0, 1].into(), 9042),
            settings,
            Arc::new(StuckFactory),
        ));

        // occupy the only slot: the holder parks inside the factory
        // with the permit held
        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.with(|_conn| async move { Ok::<_, Error>(()) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let res = pool.with(|_conn| async move { Ok::<_, Error>(()) }).await;
        assert!(matches!(res, Err(Error::HostsBusy)));
        holder.abort();
    }

    #[tokio::test]
    async fn destroyed_pool_refuses_acquisition() {
        let pool = test_pool(1, Duration::from_millis(50));
        pool.destroy();
        let res = pool.with(|_conn| async move { Ok::<_, Error>(()) }).await;
        assert!(matches!(res, Err(Error::Shutdown)));
    }
}
