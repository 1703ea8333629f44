//! Client root: cluster controller and request dispatcher.
//!
//! The controller owns the control connection, discovers peers through
//! `system.local` / `system.peers`, reacts to server push events and
//! keeps per-host pools and monitors in step. The dispatcher selects a
//! host per request via the policy and drives the retry engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::lookup_host;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cluster::control::{self, Control, ControlState};
use crate::cluster::host::{Host, HostEvent, InetAddr};
use crate::cluster::jobs::Jobs;
use crate::cluster::monitor;
use crate::error::{Error, Result};
use crate::frame::request::{QueryId, QueryParams, Request};
use crate::frame::response::{
    DbErrorKind, Event, QueryResult, Response, StatusChange, TopologyChange,
};
use crate::frame::{EventType, Version};
use crate::net::connection::Connection;
use crate::net::pool::{self, ConnectionFactory, Pool};
use crate::policy::LoadBalancingPolicy;
use crate::prepared::{PreparedQueries, PreparedQuery};
use crate::settings::{
    ClientSettings, ConnectionSettings, PoolSettings, PrepareStrategy, RetrySettings,
};
use crate::sync::Signal;
use crate::timeouts::TimeoutManager;

/// Longest pause between reachability probes of a down host.
const MONITOR_UPPER_BOUND: Duration = Duration::from_secs(60);
/// Pause before a monitor's first probe.
const MONITOR_INITIAL: Duration = Duration::from_millis(50);
/// Backoff bounds for control connection recovery.
const RECOVERY_BASE: Duration = Duration::from_millis(5);
const RECOVERY_CAP: Duration = Duration::from_secs(5);

/// Handle to one initialized client. Cheap to clone; all clones share
/// the same cluster state.
#[derive(Clone)]
pub struct Client {
    state: Arc<ClientState>,
}

impl Client {
    /// Connects to the first reachable contact point, discovers the
    /// cluster, seeds the load-balancing policy and subscribes to
    /// server events.
    pub async fn init(settings: ClientSettings) -> Result<Client> {
        settings.validate()?;
        let tm = Arc::new(TimeoutManager::new());
        let policy = (settings.policy_maker)();

        let mut addrs = Vec::new();
        for contact in &settings.contacts {
            match lookup_host((contact.as_str(), settings.port)).await {
                Ok(resolved) => addrs.extend(resolved.map(InetAddr::from)),
                Err(e) => warn!(contact = %contact, error = %e, "contact did not resolve"),
            }
        }
        if addrs.is_empty() {
            tm.destroy();
            return Err(Error::NoHostAvailable);
        }

        let mut conn = None;
        let mut last_err = Error::NoHostAvailable;
        for addr in addrs {
            match Connection::connect(
                settings.connection.clone(),
                tm.clone(),
                settings.version,
                addr,
            )
            .await
            {
                Ok(c) => {
                    conn = Some(c);
                    break;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "contact unreachable");
                    last_err = e;
                }
            }
        }
        let conn = match conn {
            Some(c) => c,
            None => {
                tm.destroy();
                return Err(last_err);
            }
        };

        let state = Arc::new(ClientState {
            port: settings.port,
            conn_settings: settings.connection,
            pool_settings: settings.pool,
            retry: settings.retry,
            version: settings.version,
            prepare_strategy: settings.prepare_strategy,
            tm,
            policy: policy.clone(),
            prepared: PreparedQueries::new(settings.prepared_cache_size)?,
            control: StdMutex::new(Control {
                state: ControlState::Connected,
                connection: conn.clone(),
            }),
            pools: StdMutex::new(HashMap::new()),
            hosts: StdMutex::new(HashMap::new()),
            jobs: Jobs::new(),
            host_events: Signal::new(),
            shutdown: AtomicBool::new(false),
        });
        state
            .host_events
            .connect(move |event| policy.on_event(event));

        if let Err(e) = state.initialise(&conn).await {
            conn.close();
            state.tm.destroy();
            return Err(e);
        }
        info!(control = %conn.host(), policy = %state.policy, "client initialised");
        Ok(Client { state })
    }

    /// Executes one request with host selection and the configured
    /// retry policy.
    pub async fn request(&self, req: Request) -> Result<Response> {
        self.state.with_retries(req).await.map(|(_, resp)| resp)
    }

    /// One-shot QUERY through the dispatcher.
    pub async fn query(&self, cql: impl Into<String>, params: QueryParams) -> Result<Response> {
        self.request(Request::Query {
            text: cql.into(),
            params,
        })
        .await
    }

    /// Prepares `cql` according to the configured strategy and returns
    /// a reusable handle.
    pub async fn prepare(&self, cql: impl Into<String>) -> Result<PreparedQuery> {
        let query = PreparedQuery::new(cql);
        match self.state.prepare_strategy {
            PrepareStrategy::Lazy => {
                self.state.prepare_lazy(&query).await?;
            }
            PrepareStrategy::Eager => {
                self.state.prepare_eager(&query).await?;
            }
        }
        Ok(query)
    }

    /// Executes a prepared statement, re-preparing it transparently on
    /// a host that reports the id as unknown.
    pub async fn execute(&self, query: &PreparedQuery, params: QueryParams) -> Result<Response> {
        self.state.execute(query, params).await
    }

    /// Addresses with a live background job (monitors, mostly).
    /// Diagnostic.
    pub fn jobs(&self) -> Vec<InetAddr> {
        self.state.jobs.show_jobs()
    }

    /// Stops background machinery, closes the control connection and
    /// drains all per-host pools. Requests issued afterwards fail.
    pub async fn shutdown(&self) {
        if self.state.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down client");
        self.state.tm.destroy();
        self.state.jobs.destroy();
        let control = {
            let mut control = self.state.control.lock().unwrap();
            control.state = ControlState::Disconnected;
            control.connection.clone()
        };
        control.close();
        let pools: Vec<Arc<Pool>> = {
            let mut pools = self.state.pools.lock().unwrap();
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.destroy();
        }
    }
}

struct ClientState {
    port: u16,
    conn_settings: ConnectionSettings,
    pool_settings: PoolSettings,
    retry: RetrySettings,
    version: Version,
    prepare_strategy: PrepareStrategy,
    tm: Arc<TimeoutManager>,
    policy: Arc<dyn LoadBalancingPolicy>,
    prepared: PreparedQueries,
    control: StdMutex<Control>,
    pools: StdMutex<HashMap<InetAddr, Arc<Pool>>>,
    hosts: StdMutex<HashMap<InetAddr, Host>>,
    jobs: Jobs,
    host_events: Signal<HostEvent>,
    shutdown: AtomicBool,
}

/// Opens connections for one host's pool.
struct HostConnectionFactory {
    settings: ConnectionSettings,
    tm: Arc<TimeoutManager>,
    version: Version,
    addr: InetAddr,
}

#[async_trait]
impl ConnectionFactory for HostConnectionFactory {
    async fn open(&self) -> Result<Arc<Connection>> {
        Connection::connect(self.settings.clone(), self.tm.clone(), self.version, self.addr).await
    }
}

impl ClientState {
    /// Discovery and event wiring against a (new) control connection:
    /// query the local node and its peers, subscribe to server events,
    /// ping every acceptable host and seed the policy.
    async fn initialise(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<()> {
        let local = control::local_host(conn, conn.host()).await?;
        let peers = control::discover_peers(conn, self.port).await?;

        let weak = Arc::downgrade(self);
        conn.register(
            &[
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
            move |event| {
                if let Some(state) = weak.upgrade() {
                    state.on_server_event(event);
                }
            },
        )
        .await?;

        let mut discovered: HashMap<InetAddr, Host> = HashMap::new();
        discovered.insert(local.addr(), local);
        for peer in peers {
            discovered.entry(peer.addr()).or_insert(peer);
        }
        let accepted: Vec<Host> = discovered
            .into_values()
            .filter(|h| self.policy.acceptable(h))
            .collect();

        let probes = accepted.iter().map(|host| {
            let state = self.clone();
            let addr = host.addr();
            async move { state.ping(addr).await }
        });
        let alive = join_all(probes).await;

        let mut up = Vec::new();
        let mut down = Vec::new();
        for (host, alive) in accepted.into_iter().zip(alive) {
            self.hosts.lock().unwrap().insert(host.addr(), host.clone());
            self.pool_for(&host);
            if alive {
                up.push(host);
            } else {
                debug!(host = %host.addr(), "discovered host is down; scheduling monitor");
                self.schedule_monitor(host.addr(), false);
                down.push(host);
            }
        }
        info!(up = up.len(), down = down.len(), "cluster discovered");
        self.policy.setup(up, down);
        Ok(())
    }

    /// Server push event handler. Runs synchronously on the control
    /// connection's reader task; anything slow is spawned.
    fn on_server_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::Status {
                change: StatusChange::Down,
                addr,
            } => {
                // events advertise the gossip address; hosts are keyed
                // by the native port
                let addr = InetAddr::new(addr.ip(), self.port);
                debug!(%addr, "server reports host down");
                self.host_events.emit(&HostEvent::Down(addr));
                self.schedule_monitor(addr, true);
            }
            Event::Status {
                change: StatusChange::Up,
                addr,
            } => {
                let addr = InetAddr::new(addr.ip(), self.port);
                if self.hosts.lock().unwrap().contains_key(&addr) {
                    // verify before trusting gossip: probe, then warm
                    // the prepared statements on the returning host
                    debug!(%addr, "server reports host up; verifying");
                    self.schedule_monitor(addr, false);
                }
            }
            Event::Topology {
                change: TopologyChange::NewNode,
                addr,
            } => {
                let addr = InetAddr::new(addr.ip(), self.port);
                let state = self.clone();
                tokio::spawn(async move {
                    state.handle_new_node(addr).await;
                });
            }
            Event::Topology {
                change: TopologyChange::RemovedNode,
                addr,
            } => {
                let addr = InetAddr::new(addr.ip(), self.port);
                self.remove_host(addr);
            }
            Event::Topology {
                change: TopologyChange::MovedNode,
                ..
            }
            | Event::Schema => {}
        }
    }

    /// NewNode handling: re-discover peers through the control
    /// connection and adopt the address if it shows up.
    async fn handle_new_node(self: &Arc<Self>, addr: InetAddr) {
        let conn = {
            let control = self.control.lock().unwrap();
            if control.state != ControlState::Connected {
                return;
            }
            control.connection.clone()
        };
        match control::discover_peers(&conn, self.port).await {
            Ok(peers) => {
                let host = match peers.into_iter().find(|h| h.addr() == addr) {
                    Some(h) => h,
                    None => {
                        debug!(%addr, "new node not yet in system.peers");
                        return;
                    }
                };
                if !self.policy.acceptable(&host) {
                    return;
                }
                info!(host = %host, "node joined the cluster");
                self.hosts.lock().unwrap().insert(addr, host.clone());
                self.pool_for(&host);
                self.host_events.emit(&HostEvent::New(host.clone()));
                self.prepare_all(&host).await;
            }
            Err(e) => warn!(%addr, error = %e, "peer re-discovery failed"),
        }
    }

    fn remove_host(&self, addr: InetAddr) {
        info!(%addr, "node left the cluster");
        self.hosts.lock().unwrap().remove(&addr);
        if let Some(pool) = self.pools.lock().unwrap().remove(&addr) {
            pool.destroy();
        }
        self.jobs.cancel(addr);
        self.host_events.emit(&HostEvent::Gone(addr));
    }

    /// Registers (or replaces) the reachability probe for `addr`. The
    /// probe emits `HostEvent::Up` once the host answers and then warms
    /// its prepared statements.
    fn schedule_monitor(self: &Arc<Self>, addr: InetAddr, replace: bool) {
        let weak = Arc::downgrade(self);
        self.jobs.add(addr, replace, async move {
            let ping = {
                let weak = weak.clone();
                move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(state) => state.ping(addr).await,
                            None => false,
                        }
                    }
                }
            };
            let on_up = move || {
                if let Some(state) = weak.upgrade() {
                    state.host_events.emit(&HostEvent::Up(addr));
                    tokio::spawn(async move {
                        let host = state.hosts.lock().unwrap().get(&addr).cloned();
                        if let Some(host) = host {
                            state.prepare_all(&host).await;
                        }
                    });
                }
            };
            monitor::run(MONITOR_INITIAL, MONITOR_UPPER_BOUND, addr, ping, on_up).await;
        });
    }

    async fn ping(&self, addr: InetAddr) -> bool {
        pool::ping(
            self.conn_settings.clone(),
            self.tm.clone(),
            self.version,
            addr,
        )
        .await
    }

    /// The pool for `host`, created on first need. Create-on-demand is
    /// race-safe under the map lock.
    fn pool_for(&self, host: &Host) -> Arc<Pool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(host.addr())
            .or_insert_with(|| {
                debug!(host = %host.addr(), "creating connection pool");
                Arc::new(Pool::new(
                    host.addr(),
                    self.pool_settings.clone(),
                    Arc::new(HostConnectionFactory {
                        settings: self.conn_settings.clone(),
                        tm: self.tm.clone(),
                        version: self.version,
                        addr: host.addr(),
                    }),
                ))
            })
            .clone()
    }

    // ---- dispatcher / retry engine -------------------------------------

    /// Drives the retry loop for one request. Returns the serving host
    /// together with the response; a retryable server error surviving
    /// all attempts is handed back as a response, never an error.
    async fn with_retries(self: &Arc<Self>, req: Request) -> Result<(Host, Response)> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let policy_cfg = self.retry.policy;
        let mut attempt: u32 = 0;
        let mut errored_host: Option<Host> = None;
        loop {
            let mut attempt_req = req.clone();
            if attempt > 0 {
                if let Some(reduced) = self.retry.reduced_consistency {
                    if let Some(consistency) = attempt_req.consistency_mut() {
                        *consistency = reduced;
                    }
                }
            }
            let send_t = shifted_timeout(
                self.conn_settings.send_timeout,
                self.retry.send_timeout_change_ms,
                attempt,
            );
            let recv_t = shifted_timeout(
                self.conn_settings.response_timeout,
                self.retry.recv_timeout_change_ms,
                attempt,
            );

            let n = self.policy.host_count().max(1);
            match self
                .request_n(n, &attempt_req, send_t, recv_t, &mut errored_host)
                .await
            {
                Ok(ok) => return Ok(ok),
                Err(e) => {
                    let engage = match &e {
                        Error::Server(db) => db.is_retryable(),
                        other => other.is_connection_error(),
                    };
                    attempt += 1;
                    if !engage
                        || attempt >= policy_cfg.attempts
                        || self.shutdown.load(Ordering::Acquire)
                    {
                        return match e {
                            // server error responses never escape as
                            // exceptions
                            Error::Server(db) => match errored_host {
                                Some(host) => Ok((host, Response::Error(db))),
                                None => {
                                    Err(Error::Internal("server error without a host".into()))
                                }
                            },
                            other => Err(other),
                        };
                    }
                    let delay = policy_cfg.backoff.delay(attempt);
                    debug!(attempt, ?delay, error = %e, "retrying request");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    /// One attempt: select a host, try it, and fall through to the
    /// next selection when the host's pool is saturated, at most `n`
    /// times.
    async fn request_n(
        self: &Arc<Self>,
        n: usize,
        req: &Request,
        send_t: Duration,
        recv_t: Duration,
        errored_host: &mut Option<Host>,
    ) -> Result<(Host, Response)> {
        let mut remaining = n;
        while remaining > 0 {
            let host = self.policy.select().ok_or(Error::NoHostAvailable)?;
            match self.request_one(&host, req, send_t, recv_t).await {
                Ok(Some(response)) => return Ok((host, response)),
                Ok(None) => remaining -= 1,
                Err(e) => {
                    *errored_host = Some(host);
                    return Err(e);
                }
            }
        }
        Err(Error::HostsBusy)
    }

    /// One attempt against one host. `Ok(None)` means the host's pool
    /// had no connection to spare. Retryable server errors become
    /// `Error::Server` so the retry engine sees them; all other server
    /// errors stay inside the response.
    async fn request_one(
        self: &Arc<Self>,
        host: &Host,
        req: &Request,
        send_t: Duration,
        recv_t: Duration,
    ) -> Result<Option<Response>> {
        let pool = self.pool_for(host);
        let attempt_req = req.clone();
        let outcome = pool
            .with(move |conn| async move { conn.request_with(&attempt_req, send_t, recv_t).await })
            .await;
        match outcome {
            Err(Error::HostsBusy) => Ok(None),
            Err(e) => {
                if e.is_connection_error() {
                    self.on_connection_error(host.addr(), &e);
                }
                Err(e)
            }
            Ok(Response::Error(db)) if db.is_retryable() => Err(Error::Server(db)),
            Ok(response) => Ok(Some(response)),
        }
    }

    /// Connection-error hook: a failure against the control host trips
    /// recovery.
    fn on_connection_error(self: &Arc<Self>, addr: InetAddr, err: &Error) {
        let is_control = {
            let control = self.control.lock().unwrap();
            control.state == ControlState::Connected && control.connection.host() == addr
        };
        if is_control {
            warn!(%addr, error = %err, "control connection failure");
            let state = self.clone();
            tokio::spawn(async move {
                state.recover_control().await;
            });
        }
    }

    /// Connected → Reconnecting → (Connected | Disconnected): close the
    /// failed control connection, then try every known host in order
    /// with capped exponential backoff between attempts.
    async fn recover_control(self: &Arc<Self>) {
        let old = {
            let mut control = self.control.lock().unwrap();
            if control.state != ControlState::Connected {
                return;
            }
            control.state = ControlState::Reconnecting;
            control.connection.clone()
        };
        let old_addr = old.host();
        warn!(%old_addr, "reconnecting control connection");
        old.close();
        self.host_events.emit(&HostEvent::Down(old_addr));

        let mut candidates: Vec<InetAddr> = self.hosts.lock().unwrap().keys().copied().collect();
        candidates.sort();
        let mut delay = RECOVERY_BASE;
        for addr in candidates {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.replace_control(addr).await {
                Ok(()) => {
                    info!(%addr, "control connection re-established");
                    return;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "control candidate failed");
                    sleep(delay).await;
                    delay = (delay * 2).min(RECOVERY_CAP);
                }
            }
        }
        self.control.lock().unwrap().state = ControlState::Disconnected;
        error!("no host reachable; control connection abandoned");
    }

    async fn replace_control(self: &Arc<Self>, addr: InetAddr) -> Result<()> {
        let conn = Connection::connect(
            self.conn_settings.clone(),
            self.tm.clone(),
            self.version,
            addr,
        )
        .await?;
        if let Err(e) = self.initialise(&conn).await {
            conn.close();
            return Err(e);
        }
        let mut control = self.control.lock().unwrap();
        control.state = ControlState::Connected;
        control.connection = conn;
        Ok(())
    }

    // ---- prepared statements -------------------------------------------

    async fn execute(self: &Arc<Self>, query: &PreparedQuery, params: QueryParams) -> Result<Response> {
        let id = match self.prepared.lookup(query)? {
            Some(id) => id,
            None => self.prepare_lazy(query).await?,
        };
        let (host, response) = self
            .with_retries(Request::Execute {
                id,
                params: params.clone(),
            })
            .await?;

        if let Response::Error(db) = &response {
            if let DbErrorKind::Unprepared { id: stale } = &db.kind {
                debug!(host = %host.addr(), "host lost a prepared statement; re-preparing");
                let text = match self.prepared.text_for(stale) {
                    Some(text) => text,
                    None => return Ok(response),
                };
                let fresh = PreparedQuery::new(text);
                let new_id = self.prepare_on(&host, &fresh).await?;
                return self
                    .request_on_host(&host, &Request::Execute { id: new_id, params })
                    .await;
            }
        }
        Ok(response)
    }

    /// PREPARE against a single policy-selected host.
    async fn prepare_lazy(self: &Arc<Self>, query: &PreparedQuery) -> Result<QueryId> {
        let (host, response) = self
            .with_retries(Request::Prepare {
                text: query.text().into(),
            })
            .await?;
        match response {
            Response::Result(QueryResult::Prepared(p)) => {
                self.prepared.insert(query, p.id.clone())?;
                Ok(p.id)
            }
            Response::Error(db) => Err(Error::Server(db)),
            _ => Err(Error::UnexpectedResponse(host.addr())),
        }
    }

    /// PREPARE against every currently selectable host; the first
    /// success wins, no success at all is `NoHostAvailable`.
    async fn prepare_eager(self: &Arc<Self>, query: &PreparedQuery) -> Result<QueryId> {
        let hosts = self.policy.current();
        if hosts.is_empty() {
            return Err(Error::NoHostAvailable);
        }
        let attempts = hosts.into_iter().map(|host| {
            let state = self.clone();
            let query = query.clone();
            async move { state.prepare_on(&host, &query).await }
        });
        join_all(attempts)
            .await
            .into_iter()
            .find_map(|r| r.ok())
            .ok_or(Error::NoHostAvailable)
    }

    async fn prepare_on(self: &Arc<Self>, host: &Host, query: &PreparedQuery) -> Result<QueryId> {
        let response = self
            .request_on_host(
                host,
                &Request::Prepare {
                    text: query.text().into(),
                },
            )
            .await?;
        match response {
            Response::Result(QueryResult::Prepared(p)) => {
                self.prepared.insert(query, p.id.clone())?;
                Ok(p.id)
            }
            Response::Error(db) => Err(Error::Server(db)),
            _ => Err(Error::UnexpectedResponse(host.addr())),
        }
    }

    /// Re-prepares every cached statement on `host` (hosts returning
    /// from down, new nodes). Failures are logged, not fatal.
    async fn prepare_all(self: &Arc<Self>, host: &Host) {
        let texts = self.prepared.all_texts();
        if texts.is_empty() {
            return;
        }
        debug!(host = %host.addr(), statements = texts.len(), "warming prepared statements");
        for text in texts {
            let query = PreparedQuery::new(text);
            if let Err(e) = self.prepare_on(host, &query).await {
                debug!(host = %host.addr(), error = %e, "re-prepare failed");
            }
        }
    }

    /// Direct request against one specific host, outside the retry
    /// engine (unprepared recovery must stay on the raising host).
    async fn request_on_host(self: &Arc<Self>, host: &Host, req: &Request) -> Result<Response> {
        let pool = self.pool_for(host);
        let attempt_req = req.clone();
        let send_t = self.conn_settings.send_timeout;
        let recv_t = self.conn_settings.response_timeout;
        let outcome = pool
            .with(move |conn| async move { conn.request_with(&attempt_req, send_t, recv_t).await })
            .await;
        if let Err(e) = &outcome {
            if e.is_connection_error() {
                self.on_connection_error(host.addr(), e);
            }
        }
        outcome
    }
}

/// Applies the per-retry timeout delta: `base + change_ms * attempt`,
/// floored at one millisecond.
fn shifted_timeout(base: Duration, change_ms: i64, attempt: u32) -> Duration {
    if attempt == 0 || change_ms == 0 {
        return base;
    }
    let ms = base.as_millis() as i64 + change_ms * attempt as i64;
    Duration::from_millis(ms.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_shifts_apply_per_attempt_and_floor_at_one_ms() {
        let base = Duration::from_millis(100);
        assert_eq!(shifted_timeout(base, 50, 0), base);
        assert_eq!(shifted_timeout(base, 50, 1), Duration::from_millis(150));
        assert_eq!(shifted_timeout(base, 50, 2), Duration::from_millis(200));
        assert_eq!(shifted_timeout(base, -40, 1), Duration::from_millis(60));
        assert_eq!(shifted_timeout(base, -500, 2), Duration::from_millis(1));
        assert_eq!(shifted_timeout(base, 0, 5), base);
    }
}
