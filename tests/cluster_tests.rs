//! Controller and dispatcher scenarios against scripted nodes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cql_io::error::Error;
use cql_io::frame::request::QueryParams;
use cql_io::frame::response::{QueryResult, Response};
use cql_io::frame::Consistency;
use cql_io::policy::{LoadBalancingPolicy, RoundRobinPolicy};
use cql_io::settings::{Backoff, PrepareStrategy, RetryPolicy};
use cql_io::test_utils::{MockBehavior, MockNode, Reply};
use cql_io::{Client, ClientSettings, Host, HostEvent, InetAddr};

/// Round robin plus an event log, so tests can observe what the
/// controller feeds the policy.
struct RecordingPolicy {
    inner: RoundRobinPolicy,
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingPolicy {
    fn new() -> Self {
        RecordingPolicy {
            inner: RoundRobinPolicy::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LoadBalancingPolicy for RecordingPolicy {
    fn setup(&self, up: Vec<Host>, down: Vec<Host>) {
        self.inner.setup(up, down);
    }

    fn on_event(&self, event: &HostEvent) {
        self.events.lock().unwrap().push(event.clone());
        self.inner.on_event(event);
    }

    fn select(&self) -> Option<Host> {
        self.inner.select()
    }

    fn acceptable(&self, host: &Host) -> bool {
        self.inner.acceptable(host)
    }

    fn host_count(&self) -> usize {
        self.inner.host_count()
    }

    fn current(&self) -> Vec<Host> {
        self.inner.current()
    }
}

impl fmt::Display for RecordingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("recording")
    }
}

/// `RUST_LOG`-driven tracing for debugging test runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params() -> QueryParams {
    QueryParams::with_consistency(Consistency::Quorum)
}

fn fast_retry(attempts: u32, reduced: Option<Consistency>) -> cql_io::RetrySettings {
    cql_io::RetrySettings {
        policy: RetryPolicy {
            attempts,
            backoff: Backoff::Constant(Duration::from_millis(5)),
        },
        send_timeout_change_ms: 0,
        recv_timeout_change_ms: 0,
        reduced_consistency: reduced,
    }
}

#[tokio::test]
async fn init_skips_dead_contacts_and_binds_to_the_live_one() {
    init_tracing();
    let node = MockNode::start(MockBehavior::default()).await;

    // 127.0.0.2 has nothing listening on the node's port
    let settings =
        ClientSettings::new(vec!["127.0.0.2".into(), "127.0.0.1".into()]).with_port(node.port());
    let client = Client::init(settings).await.expect("init failed");

    let response = client.query("SELECT now() FROM x", params()).await.unwrap();
    assert!(matches!(response, Response::Result(QueryResult::Void)));

    // the sole (up) host needs no monitor
    assert!(client.jobs().is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn init_fails_when_every_contact_is_unreachable() {
    let probe = MockNode::start(MockBehavior::default()).await;
    let port = probe.port();
    drop(probe);

    let settings = ClientSettings::new(vec!["127.0.0.1".into(), "127.0.0.2".into()])
        .with_port(port);
    let res = Client::init(settings).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn retry_rewrites_consistency_and_returns_the_second_attempt() {
    let failures = Arc::new(AtomicUsize::new(0));
    let behavior = MockBehavior {
        script: Some(Box::new({
            let failures = failures.clone();
            move |req| {
                if req.text.as_deref() == Some("INSERT INTO t VALUES (1)")
                    && failures.fetch_add(1, Ordering::SeqCst) == 0
                {
                    Some(Reply::Error {
                        code: 0x1001,
                        message: "coordinator overloaded".into(),
                        extra: vec![],
                    })
                } else {
                    None
                }
            }
        })),
        ..Default::default()
    };
    let node = MockNode::start(behavior).await;

    let settings = ClientSettings::new(vec!["127.0.0.1".into()])
        .with_port(node.port())
        .with_retry(fast_retry(3, Some(Consistency::One)));
    let client = Client::init(settings).await.unwrap();

    let response = client
        .query("INSERT INTO t VALUES (1)", params())
        .await
        .unwrap();
    assert!(matches!(response, Response::Result(QueryResult::Void)));

    let attempts: Vec<u16> = node
        .seen_queries()
        .into_iter()
        .filter(|r| r.text.as_deref() == Some("INSERT INTO t VALUES (1)"))
        .map(|r| r.consistency.unwrap())
        .collect();
    assert_eq!(
        attempts,
        vec![Consistency::Quorum.to_u16(), Consistency::One.to_u16()]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_hand_back_the_server_error_as_a_response() {
    let behavior = MockBehavior {
        script: Some(Box::new(|req| {
            if req.text.as_deref() == Some("DOOMED") {
                Some(Reply::Error {
                    code: 0x1001,
                    message: "still overloaded".into(),
                    extra: vec![],
                })
            } else {
                None
            }
        })),
        ..Default::default()
    };
    let node = MockNode::start(behavior).await;

    let settings = ClientSettings::new(vec!["127.0.0.1".into()])
        .with_port(node.port())
        .with_retry(fast_retry(2, None));
    let client = Client::init(settings).await.unwrap();

    // not an Err: the final server error must come back as a response
    let response = client.query("DOOMED", params()).await.unwrap();
    match response {
        Response::Error(db) => assert_eq!(db.code, 0x1001),
        other => panic!("unexpected {other:?}"),
    }
    client.shutdown().await;
}

#[tokio::test]
async fn status_down_event_feeds_the_policy_and_schedules_a_monitor() {
    // two-node cluster: the control node plus a peer on the loopback
    // alias, sharing one port
    let control = MockNode::start(MockBehavior {
        peers: vec![("127.0.0.2".parse().unwrap(), "dc1".into(), "r1".into())],
        ..Default::default()
    })
    .await;
    let peer_bind: SocketAddr = format!("127.0.0.2:{}", control.port()).parse().unwrap();
    let peer = MockNode::start_at(peer_bind, MockBehavior::default()).await;
    let peer_addr = InetAddr::from(peer_bind);

    let recording = Arc::new(RecordingPolicy::new());
    let maker = {
        let recording = recording.clone();
        Box::new(move || recording.clone() as Arc<dyn LoadBalancingPolicy>)
    };
    let settings = ClientSettings::new(vec!["127.0.0.1".into()])
        .with_port(control.port())
        .with_policy_maker(maker);
    let client = Client::init(settings).await.unwrap();
    assert_eq!(recording.host_count(), 2);

    // take the peer down so the monitor cannot immediately succeed,
    // then let the server push the status change
    peer.stop();
    control.push_status_change(false, peer_bind);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(recording
        .events()
        .iter()
        .any(|e| matches!(e, HostEvent::Down(a) if *a == peer_addr)));
    assert_eq!(recording.host_count(), 1);
    assert!(client.jobs().contains(&peer_addr));

    client.shutdown().await;
    assert!(client.jobs().is_empty());
}

#[tokio::test]
async fn removed_node_event_forgets_the_host() {
    let control = MockNode::start(MockBehavior {
        peers: vec![("127.0.0.2".parse().unwrap(), "dc1".into(), "r1".into())],
        ..Default::default()
    })
    .await;
    let peer_bind: SocketAddr = format!("127.0.0.2:{}", control.port()).parse().unwrap();
    let _peer = MockNode::start_at(peer_bind, MockBehavior::default()).await;

    let recording = Arc::new(RecordingPolicy::new());
    let maker = {
        let recording = recording.clone();
        Box::new(move || recording.clone() as Arc<dyn LoadBalancingPolicy>)
    };
    let settings = ClientSettings::new(vec!["127.0.0.1".into()])
        .with_port(control.port())
        .with_policy_maker(maker);
    let client = Client::init(settings).await.unwrap();
    assert_eq!(recording.host_count(), 2);

    control.push_removed_node(peer_bind);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let peer_addr = InetAddr::from(peer_bind);
    assert!(recording
        .events()
        .iter()
        .any(|e| matches!(e, HostEvent::Gone(a) if *a == peer_addr)));
    assert_eq!(recording.host_count(), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn unprepared_execute_recovers_via_reprepare_on_the_same_host() {
    let executes = Arc::new(AtomicUsize::new(0));
    let behavior = MockBehavior {
        script: Some(Box::new({
            let executes = executes.clone();
            move |req| match req.opcode {
                cql_io::frame::OpCode::Prepare => Some(Reply::Prepared(vec![0xAB])),
                cql_io::frame::OpCode::Execute => {
                    if executes.fetch_add(1, Ordering::SeqCst) == 0 {
                        // the host has forgotten the statement
                        Some(Reply::Error {
                            code: 0x2500,
                            message: "unprepared".into(),
                            extra: vec![0x00, 0x01, 0xAB],
                        })
                    } else {
                        Some(Reply::Void)
                    }
                }
                _ => None,
            }
        })),
        ..Default::default()
    };
    let node = MockNode::start(behavior).await;

    let settings = ClientSettings::new(vec!["127.0.0.1".into()]).with_port(node.port());
    let client = Client::init(settings).await.unwrap();

    let prepared = client.prepare("SELECT v FROM t WHERE k = ?").await.unwrap();
    assert_eq!(node.seen_prepares().len(), 1);

    let response = client.execute(&prepared, params()).await.unwrap();
    assert!(matches!(response, Response::Result(QueryResult::Void)));
    // exactly one re-prepare, triggered by the unprepared error
    assert_eq!(node.seen_prepares().len(), 2);

    // the cache still resolves the query to the original id
    let response = client.execute(&prepared, params()).await.unwrap();
    assert!(matches!(response, Response::Result(QueryResult::Void)));
    assert_eq!(node.seen_prepares().len(), 2);
    let ids: Vec<Vec<u8>> = node
        .seen_executes()
        .into_iter()
        .map(|r| r.execute_id.unwrap())
        .collect();
    assert!(ids.iter().all(|id| id == &vec![0xAB]));

    client.shutdown().await;
}

#[tokio::test]
async fn eager_prepare_reaches_every_selectable_host() {
    let control = MockNode::start(MockBehavior {
        peers: vec![("127.0.0.2".parse().unwrap(), "dc1".into(), "r1".into())],
        ..Default::default()
    })
    .await;
    let peer_bind: SocketAddr = format!("127.0.0.2:{}", control.port()).parse().unwrap();
    let peer = MockNode::start_at(peer_bind, MockBehavior::default()).await;

    let settings = ClientSettings::new(vec!["127.0.0.1".into()])
        .with_port(control.port())
        .with_prepare_strategy(PrepareStrategy::Eager);
    let client = Client::init(settings).await.unwrap();

    client.prepare("SELECT v FROM t WHERE k = ?").await.unwrap();
    assert_eq!(control.seen_prepares().len() + peer.seen_prepares().len(), 2);
    assert_eq!(control.seen_prepares().len(), 1);
    assert_eq!(peer.seen_prepares().len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_later_requests_and_clears_jobs() {
    let node = MockNode::start(MockBehavior::default()).await;
    let settings = ClientSettings::new(vec!["127.0.0.1".into()]).with_port(node.port());
    let client = Client::init(settings).await.unwrap();

    client.shutdown().await;
    let res = client.query("SELECT 1", params()).await;
    assert!(matches!(
        res,
        Err(Error::Shutdown) | Err(Error::ConnectionClosed(_))
    ));
    assert!(client.jobs().is_empty());

    // shutdown is idempotent
    client.shutdown().await;
}
