//! Test support: a scripted in-process CQL node.
//!
//! `MockNode` binds a real TCP listener and answers just enough of the
//! native protocol for driver tests: handshake, the controller's
//! `system.local` / `system.peers` discovery queries, and scripted
//! replies for everything else. It records every request it sees and
//! can push server events to all connected clients.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::host::InetAddr;
use crate::frame::{Header, OpCode, HEADER_LEN};

const RESPONSE_VERSION: u8 = 0x84;

/// One client request as the mock observed it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub opcode: OpCode,
    pub stream: i16,
    /// Query or prepare text, when the request carries one.
    pub text: Option<String>,
    /// Consistency code of QUERY / EXECUTE requests.
    pub consistency: Option<u16>,
    /// Statement id of EXECUTE requests.
    pub execute_id: Option<Vec<u8>>,
}

/// Scripted reply to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ready,
    Void,
    Rows,
    SetKeyspace(String),
    Prepared(Vec<u8>),
    Error {
        code: i32,
        message: String,
        /// Raw bytes appended after the message (e.g. an unprepared id
        /// as `[short bytes]`).
        extra: Vec<u8>,
    },
    /// Reply after a pause, without blocking other streams.
    Delay(Duration, Box<Reply>),
    /// Never reply; the client's response timeout owns this stream.
    Silent,
    /// A pre-rendered body under an explicit opcode (handshake frames,
    /// discovery rows).
    Raw { opcode: OpCode, body: Vec<u8> },
}

type Script = dyn Fn(&SeenRequest) -> Option<Reply> + Send + Sync;

/// Behavior knobs for one mock node.
pub struct MockBehavior {
    pub data_centre: String,
    pub rack: String,
    /// Rows served from `system.peers`: address and placement.
    pub peers: Vec<(IpAddr, String, String)>,
    /// Mechanism demanded after STARTUP; any AUTH_RESPONSE succeeds.
    pub authenticate: Option<String>,
    /// Consulted for QUERY / PREPARE / EXECUTE / BATCH before the
    /// defaults; `None` falls through to Void / a fixed prepared id.
    pub script: Option<Box<Script>>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            data_centre: "dc1".into(),
            rack: "r1".into(),
            peers: Vec::new(),
            authenticate: None,
            script: None,
        }
    }
}

struct Inner {
    behavior: MockBehavior,
    seen: Mutex<Vec<SeenRequest>>,
    writers: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A single-node scripted CQL server on a loopback port.
pub struct MockNode {
    addr: InetAddr,
    inner: Arc<Inner>,
    accept_task: JoinHandle<()>,
}

impl MockNode {
    pub async fn start(behavior: MockBehavior) -> MockNode {
        Self::start_at("127.0.0.1:0".parse().unwrap(), behavior).await
    }

    /// Binds to a specific address (loopback aliases let tests model
    /// multi-node clusters sharing one port).
    pub async fn start_at(bind: SocketAddr, behavior: MockBehavior) -> MockNode {
        let listener = TcpListener::bind(bind).await.unwrap();
        let addr = InetAddr::from(listener.local_addr().unwrap());
        let inner = Arc::new(Inner {
            behavior,
            seen: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
            conn_tasks: Mutex::new(Vec::new()),
        });
        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let inner = accept_inner.clone();
                        let task =
                            tokio::spawn({ let inner = inner.clone(); async move { serve(stream, inner).await } });
                        inner.conn_tasks.lock().unwrap().push(task);
                    }
                    Err(_) => return,
                }
            }
        });
        MockNode {
            addr,
            inner,
            accept_task,
        }
    }

    pub fn addr(&self) -> InetAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every request observed so far, across all connections.
    pub fn seen(&self) -> Vec<SeenRequest> {
        self.inner.seen.lock().unwrap().clone()
    }

    /// Observed QUERY requests whose text is not a `system.` or `USE`
    /// query (i.e. the requests a test itself issued).
    pub fn seen_queries(&self) -> Vec<SeenRequest> {
        self.seen()
            .into_iter()
            .filter(|r| {
                r.opcode == OpCode::Query
                    && r.text.as_deref().map_or(false, |t| {
                        !t.contains("system.") && !t.starts_with("USE ")
                    })
            })
            .collect()
    }

    pub fn seen_executes(&self) -> Vec<SeenRequest> {
        self.seen()
            .into_iter()
            .filter(|r| r.opcode == OpCode::Execute)
            .collect()
    }

    pub fn seen_prepares(&self) -> Vec<SeenRequest> {
        self.seen()
            .into_iter()
            .filter(|r| r.opcode == OpCode::Prepare)
            .collect()
    }

    pub fn push_status_change(&self, up: bool, addr: SocketAddr) {
        self.push_event("STATUS_CHANGE", if up { "UP" } else { "DOWN" }, addr);
    }

    pub fn push_new_node(&self, addr: SocketAddr) {
        self.push_event("TOPOLOGY_CHANGE", "NEW_NODE", addr);
    }

    pub fn push_removed_node(&self, addr: SocketAddr) {
        self.push_event("TOPOLOGY_CHANGE", "REMOVED_NODE", addr);
    }

    fn push_event(&self, class: &str, change: &str, addr: SocketAddr) {
        let mut body = BytesMut::new();
        put_string(&mut body, class);
        put_string(&mut body, change);
        put_inet(&mut body, addr);
        let frame = frame(OpCode::Event, -1, &body);
        for writer in self.inner.writers.lock().unwrap().iter() {
            let _ = writer.send(frame.clone());
        }
    }

    /// Stops accepting and drops every open connection (the per-socket
    /// writer tasks exit once their senders are gone).
    pub fn stop(&self) {
        self.accept_task.abort();
        for task in self.inner.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.inner.writers.lock().unwrap().clear();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(stream: TcpStream, inner: Arc<Inner>) {
    stream.set_nodelay(true).ok();
    let (mut read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    inner.writers.lock().unwrap().push(tx.clone());
    tokio::spawn(write_loop(write_half, rx));

    let mut header_buf = [0u8; HEADER_LEN];
    loop {
        if read_half.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        let header = match Header::unpack(&header_buf) {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut body = vec![0u8; header.length as usize];
        if read_half.read_exact(&mut body).await.is_err() {
            return;
        }

        let request = parse_request(&header, &body);
        inner.seen.lock().unwrap().push(request.clone());

        let reply = decide(&inner.behavior, &request);
        send_reply(&tx, request.stream, reply);
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn send_reply(tx: &mpsc::UnboundedSender<Bytes>, stream: i16, reply: Reply) {
    match reply {
        Reply::Silent => {}
        Reply::Delay(pause, inner) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(pause).await;
                send_reply(&tx, stream, *inner);
            });
        }
        other => {
            let _ = tx.send(encode_reply(stream, &other));
        }
    }
}

fn decide(behavior: &MockBehavior, request: &SeenRequest) -> Reply {
    match request.opcode {
        OpCode::Startup => match &behavior.authenticate {
            Some(mechanism) => {
                let mut body = BytesMut::new();
                put_string(&mut body, mechanism);
                return raw_reply(OpCode::Authenticate, body);
            }
            None => Reply::Ready,
        },
        OpCode::AuthResponse => raw_reply(OpCode::AuthSuccess, {
            let mut body = BytesMut::new();
            body.put_i32(-1);
            body
        }),
        OpCode::Options => raw_reply(OpCode::Supported, supported_body()),
        OpCode::Register => Reply::Ready,
        OpCode::Query => {
            let text = request.text.as_deref().unwrap_or("");
            if text.contains("system.local") {
                return raw_reply(OpCode::Result, local_rows(behavior));
            }
            if text.contains("system.peers") {
                return raw_reply(OpCode::Result, peers_rows(behavior));
            }
            if let Some(keyspace) = text.strip_prefix("USE ") {
                return Reply::SetKeyspace(keyspace.trim_matches('"').to_string());
            }
            behavior
                .script
                .as_ref()
                .and_then(|s| s(request))
                .unwrap_or(Reply::Void)
        }
        OpCode::Prepare | OpCode::Execute | OpCode::Batch => behavior
            .script
            .as_ref()
            .and_then(|s| s(request))
            .unwrap_or_else(|| match request.opcode {
                OpCode::Prepare => Reply::Prepared(vec![0xCA, 0xFE]),
                _ => Reply::Void,
            }),
        _ => Reply::Void,
    }
}

fn raw_reply(opcode: OpCode, body: BytesMut) -> Reply {
    Reply::Raw {
        opcode,
        body: body.to_vec(),
    }
}

fn encode_reply(stream: i16, reply: &Reply) -> Bytes {
    match reply {
        Reply::Ready => frame(OpCode::Ready, stream, &BytesMut::new()),
        Reply::Void => {
            let mut body = BytesMut::new();
            body.put_i32(0x0001);
            frame(OpCode::Result, stream, &body)
        }
        Reply::Rows => {
            let mut body = BytesMut::new();
            body.put_i32(0x0002);
            body.put_i32(0); // flags: per-column specs
            body.put_i32(0); // no columns
            body.put_i32(0); // no rows
            frame(OpCode::Result, stream, &body)
        }
        Reply::SetKeyspace(keyspace) => {
            let mut body = BytesMut::new();
            body.put_i32(0x0003);
            put_string(&mut body, keyspace);
            frame(OpCode::Result, stream, &body)
        }
        Reply::Prepared(id) => {
            let mut body = BytesMut::new();
            body.put_i32(0x0004);
            body.put_u16(id.len() as u16);
            body.extend_from_slice(id);
            frame(OpCode::Result, stream, &body)
        }
        Reply::Raw { opcode, body } => {
            let mut out = BytesMut::new();
            out.extend_from_slice(body);
            frame(*opcode, stream, &out)
        }
        Reply::Error {
            code,
            message,
            extra,
        } => {
            let mut body = BytesMut::new();
            body.put_i32(*code);
            put_string(&mut body, message);
            body.extend_from_slice(extra);
            frame(OpCode::Error, stream, &body)
        }
        Reply::Delay(..) | Reply::Silent => unreachable!("handled in send_reply"),
    }
}

fn frame(opcode: OpCode, stream: i16, body: &BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    let header = Header {
        version: RESPONSE_VERSION,
        flags: 0,
        stream,
        opcode,
        length: body.len() as u32,
    };
    header.pack(&mut out);
    out.extend_from_slice(body);
    out.freeze()
}

fn supported_body() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u16(2);
    put_string(&mut body, "CQL_VERSION");
    body.put_u16(1);
    put_string(&mut body, "3.0.0");
    put_string(&mut body, "COMPRESSION");
    body.put_u16(2);
    put_string(&mut body, "lz4");
    put_string(&mut body, "snappy");
    body
}

fn local_rows(behavior: &MockBehavior) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(0x0002);
    body.put_i32(0x0001); // global table spec
    body.put_i32(2);
    put_string(&mut body, "system");
    put_string(&mut body, "local");
    put_string(&mut body, "data_center");
    body.put_u16(0x000D);
    put_string(&mut body, "rack");
    body.put_u16(0x000D);
    body.put_i32(1);
    put_bytes(&mut body, behavior.data_centre.as_bytes());
    put_bytes(&mut body, behavior.rack.as_bytes());
    body
}

fn peers_rows(behavior: &MockBehavior) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(0x0002);
    body.put_i32(0x0001);
    body.put_i32(4);
    put_string(&mut body, "system");
    put_string(&mut body, "peers");
    for (name, ty) in [
        ("peer", 0x0010u16),
        ("rpc_address", 0x0010),
        ("data_center", 0x000D),
        ("rack", 0x000D),
    ] {
        put_string(&mut body, name);
        body.put_u16(ty);
    }
    body.put_i32(behavior.peers.len() as i32);
    for (ip, dc, rack) in &behavior.peers {
        let raw = ip_bytes(*ip);
        put_bytes(&mut body, &raw);
        put_bytes(&mut body, &raw);
        put_bytes(&mut body, dc.as_bytes());
        put_bytes(&mut body, rack.as_bytes());
    }
    body
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn parse_request(header: &Header, body: &[u8]) -> SeenRequest {
    let mut request = SeenRequest {
        opcode: header.opcode,
        stream: header.stream,
        text: None,
        consistency: None,
        execute_id: None,
    };
    match header.opcode {
        OpCode::Query | OpCode::Prepare => {
            if body.len() >= 4 {
                let n = i32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                if body.len() >= 4 + n {
                    request.text =
                        Some(String::from_utf8_lossy(&body[4..4 + n]).into_owned());
                    if header.opcode == OpCode::Query && body.len() >= 4 + n + 2 {
                        request.consistency =
                            Some(u16::from_be_bytes([body[4 + n], body[4 + n + 1]]));
                    }
                }
            }
        }
        OpCode::Execute => {
            if body.len() >= 2 {
                let n = u16::from_be_bytes([body[0], body[1]]) as usize;
                if body.len() >= 2 + n {
                    request.execute_id = Some(body[2..2 + n].to_vec());
                    if body.len() >= 2 + n + 2 {
                        request.consistency =
                            Some(u16::from_be_bytes([body[2 + n], body[2 + n + 1]]));
                    }
                }
            }
        }
        _ => {}
    }
    request
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_i32(b.len() as i32);
    dst.extend_from_slice(b);
}

fn put_inet(dst: &mut BytesMut, addr: SocketAddr) {
    let raw = ip_bytes(addr.ip());
    dst.put_u8(raw.len() as u8);
    dst.extend_from_slice(&raw);
    dst.put_i32(addr.port() as i32);
}
