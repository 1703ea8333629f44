//! Per-connection frame multiplexer.
//!
//! One connection owns one socket and a dedicated reader task. Requests
//! borrow a stream id from a bounded ticket pool, park on a per-stream
//! rendezvous slot, and are matched to responses by id, so many callers
//! share the socket concurrently. The reader task is the only reader of
//! the socket; sends are serialized by a write lock.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::cluster::host::InetAddr;
use crate::error::{Error, Result};
use crate::frame::request::{QueryParams, Request};
use crate::frame::response::{Event, QueryResult, Response};
use crate::frame::{
    Compression, Consistency, EventType, FrameCodec, RawFrame, Version, EVENT_STREAM,
};
use crate::net::socket::Socket;
use crate::settings::ConnectionSettings;
use crate::sync::{Signal, Slot, TicketPool};
use crate::timeouts::TimeoutManager;

static CONN_IDS: AtomicU64 = AtomicU64::new(0);

/// State shared between the connection handle and its reader task.
struct Shared {
    streams: Vec<StdMutex<Option<Arc<Slot<RawFrame>>>>>,
    tickets: TicketPool,
    open: AtomicBool,
    events: Signal<Event>,
    writer: AsyncMutex<WriteHalf<Socket>>,
}

impl Shared {
    /// Idempotent teardown: swaps open→closed exactly once, then fails
    /// every id waiter and every parked requester before the socket is
    /// shut down on a separate task (the write half may be held by an
    /// in-flight sender).
    fn cleanup(self: &Arc<Self>, host: InetAddr, err: Error) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(%host, error = %err, "closing connection");
        self.tickets.close(err.clone());
        for entry in &self.streams {
            if let Some(slot) = entry.lock().unwrap().take() {
                slot.close(err.clone());
            }
        }
        let shared = self.clone();
        tokio::spawn(async move {
            let mut writer = shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(%host, error = %e, "socket shutdown failed");
            }
        });
    }

    /// Drops the slot registered under `id` (if it is still `slot`) and
    /// recycles the stream id.
    fn reclaim(&self, id: i16, slot: &Arc<Slot<RawFrame>>) {
        let mut entry = self.streams[id as usize].lock().unwrap();
        if entry
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, slot))
        {
            *entry = None;
        }
        drop(entry);
        self.tickets.release(id);
    }
}

/// One multiplexed connection to a cluster node.
///
/// Equality is by connection id. Connections must be closed explicitly
/// (pools and the controller do); dropping the handle alone leaves the
/// reader task to the peer's EOF.
pub struct Connection {
    id: u64,
    host: InetAddr,
    version: Version,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    tm: Arc<TimeoutManager>,
}

impl Connection {
    /// Opens a socket to `host`, spawns the reader task and performs
    /// the protocol handshake: compression validation through OPTIONS,
    /// STARTUP, the authentication exchange if demanded, and `USE` of
    /// the default keyspace. The connection is closed again on any
    /// failure past the socket open.
    pub async fn connect(
        settings: ConnectionSettings,
        tm: Arc<TimeoutManager>,
        version: Version,
        host: InetAddr,
    ) -> Result<Arc<Connection>> {
        let socket = Socket::connect(host, settings.connect_timeout, settings.tls.as_ref()).await?;
        let (read_half, write_half) = tokio::io::split(socket);

        let shared = Arc::new(Shared {
            streams: (0..settings.max_streams)
                .map(|_| StdMutex::new(None))
                .collect(),
            tickets: TicketPool::new(settings.max_streams),
            open: AtomicBool::new(true),
            events: Signal::new(),
            writer: AsyncMutex::new(write_half),
        });

        let codec = FrameCodec::new(version, settings.compression, settings.max_recv_buffer);
        let reader = tokio::spawn(read_loop(read_half, codec, shared.clone(), host));

        let conn = Arc::new(Connection {
            id: CONN_IDS.fetch_add(1, Ordering::Relaxed),
            host,
            version,
            settings,
            shared,
            reader: StdMutex::new(Some(reader)),
            tm,
        });

        match conn.handshake().await {
            Ok(()) => {
                debug!(conn = conn.id, host = %host, "connection established");
                Ok(conn)
            }
            Err(e) => {
                conn.close();
                Err(e)
            }
        }
    }

    pub fn host(&self) -> InetAddr {
        self.host
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Sends `req` and awaits its response under the connection's
    /// configured timeouts.
    pub async fn request(&self, req: &Request) -> Result<Response> {
        self.request_with(req, self.settings.send_timeout, self.settings.response_timeout)
            .await
    }

    /// Sends `req` with explicit timeouts (the retry engine shifts them
    /// between attempts).
    ///
    /// A send failure closes the connection. A response timeout kills
    /// only this request's slot; its stream id is recycled as soon as
    /// the late response arrives (or immediately, if the response lost
    /// the race to the deadline).
    pub async fn request_with(
        &self,
        req: &Request,
        send_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Response> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.host));
        }

        let id = self.shared.tickets.acquire().await?;
        let slot = Arc::new(Slot::new());
        *self.shared.streams[id as usize].lock().unwrap() = Some(slot.clone());

        let frame = req.encode(self.version, self.settings.compression, id)?;

        {
            let mut writer = self.shared.writer.lock().await;
            // the write lock also guards the open check: cleanup cannot
            // have closed our slot after this point without also
            // failing the pending get below
            if !self.is_open() {
                self.shared.reclaim(id, &slot);
                return Err(Error::ConnectionClosed(self.host));
            }
            let send = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            match timeout(send_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    drop(writer);
                    self.close_with(Error::ConnectionClosed(self.host));
                    return Err(e.into());
                }
                Err(_) => {
                    drop(writer);
                    self.close_with(Error::ConnectionClosed(self.host));
                    return Err(Error::Io(Arc::new(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "send timeout",
                    ))));
                }
            }
        }

        let deadline = {
            let shared = self.shared.clone();
            let slot = slot.clone();
            let host = self.host;
            self.tm.schedule(response_timeout, move || {
                if slot.kill(Error::ResponseTimeout(host)).is_some() {
                    // the response arrived but was never consumed; the
                    // stream is quiet and the id safe to reuse
                    shared.reclaim(id, &slot);
                }
            })
        };

        let outcome = slot.get().await;
        deadline.cancel();

        match outcome {
            Ok(frame) => {
                self.shared.reclaim(id, &slot);
                Response::parse(frame.header.opcode, frame.body)
            }
            Err(e @ Error::ResponseTimeout(_)) => {
                // id deliberately not recycled here: the reader returns
                // it when the overdue response eventually shows up
                Err(e)
            }
            Err(e) => {
                self.shared.reclaim(id, &slot);
                Err(e)
            }
        }
    }

    /// Subscribes to server push events: issues REGISTER and connects
    /// `handler` to the connection's event signal. Duplicate handlers
    /// are kept.
    pub async fn register<F>(&self, events: &[EventType], handler: F) -> Result<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let req = Request::Register {
            events: events.to_vec(),
        };
        match self.request(&req).await? {
            Response::Ready => {
                self.shared.events.connect(handler);
                Ok(())
            }
            Response::Error(e) => Err(Error::Server(e)),
            _ => Err(Error::UnexpectedResponse(self.host)),
        }
    }

    /// Cancels the reader task and tears the connection down. Safe to
    /// invoke any number of times; requests issued afterwards fail with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.close_with(Error::ConnectionClosed(self.host));
    }

    fn close_with(&self, err: Error) {
        self.shared.cleanup(self.host, err);
    }

    async fn handshake(&self) -> Result<()> {
        if self.settings.compression != Compression::None {
            self.validate_compression().await?;
        }

        let startup = Request::Startup {
            compression: self.settings.compression,
        };
        match self.request(&startup).await? {
            Response::Ready => {
                if !self.settings.authenticators.is_empty() {
                    warn!(host = %self.host, "authenticators configured but none required");
                }
            }
            Response::Authenticate { mechanism } => self.authenticate(&mechanism).await?,
            Response::Error(e) => return Err(Error::Server(e)),
            _ => return Err(Error::UnexpectedResponse(self.host)),
        }

        if let Some(keyspace) = self.settings.default_keyspace.clone() {
            self.use_keyspace(&keyspace).await?;
        }
        Ok(())
    }

    async fn validate_compression(&self) -> Result<()> {
        let supported = match self.request(&Request::Options).await? {
            Response::Supported { options } => options,
            Response::Error(e) => return Err(Error::Server(e)),
            _ => return Err(Error::UnexpectedResponse(self.host)),
        };
        let algorithms = supported.get("COMPRESSION").cloned().unwrap_or_default();
        let wanted = self.settings.compression.name().unwrap_or("");
        if !algorithms.iter().any(|a| a == wanted) {
            return Err(Error::UnsupportedCompression {
                supported: algorithms,
            });
        }
        Ok(())
    }

    async fn authenticate(&self, mechanism: &str) -> Result<()> {
        let auth = self
            .settings
            .authenticators
            .iter()
            .find(|a| a.mechanism() == mechanism)
            .cloned();
        let auth = match auth {
            Some(a) => a,
            None if self.settings.authenticators.is_empty() => {
                return Err(Error::AuthenticationRequired(mechanism.into()))
            }
            None => {
                return Err(Error::AuthenticationMechanismUnsupported(mechanism.into()))
            }
        };

        let mut token = auth.on_request();
        loop {
            let req = Request::AuthResponse { token };
            match self.request(&req).await? {
                Response::AuthSuccess { .. } => return Ok(()),
                Response::AuthChallenge { token: challenge } => {
                    match auth.on_challenge(challenge.as_ref()) {
                        Some(answer) => token = answer,
                        None => {
                            return Err(Error::UnexpectedAuthenticationChallenge(
                                mechanism.into(),
                            ))
                        }
                    }
                }
                Response::Error(e) => return Err(Error::Server(e)),
                _ => return Err(Error::UnexpectedResponse(self.host)),
            }
        }
    }

    async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        // embedded double quotes are escaped by doubling
        let text = format!("USE \"{}\"", keyspace.replace('"', "\"\""));
        let req = Request::Query {
            text,
            params: QueryParams::with_consistency(Consistency::One),
        };
        match self.request(&req).await? {
            Response::Result(QueryResult::SetKeyspace(_)) => Ok(()),
            Response::Error(e) => Err(Error::Server(e)),
            _ => Err(Error::UnexpectedResponse(self.host)),
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection {} to {}", self.id, self.host)
    }
}

/// The reader task: the sole reader of the socket. Event frames fan out
/// on the event signal; everything else is deposited into its stream's
/// slot. Deposits refused because the requester timed out recycle the
/// stream id.
async fn read_loop(
    read_half: ReadHalf<Socket>,
    codec: FrameCodec,
    shared: Arc<Shared>,
    host: InetAddr,
) {
    let mut frames = FramedRead::new(read_half, codec);
    loop {
        match frames.next().await {
            Some(Ok(frame)) => dispatch(&shared, host, frame),
            Some(Err(e)) => {
                debug!(%host, error = %e, "read failed");
                shared.cleanup(host, Error::ConnectionClosed(host));
                return;
            }
            None => {
                debug!(%host, "peer closed the connection");
                shared.cleanup(host, Error::ConnectionClosed(host));
                return;
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, host: InetAddr, frame: RawFrame) {
    let stream = frame.header.stream;
    if stream == EVENT_STREAM {
        match Response::parse(frame.header.opcode, frame.body) {
            Ok(Response::Event(event)) => shared.events.emit(&event),
            Ok(other) => warn!(%host, response = ?other, "non-event frame on the event stream"),
            Err(e) => warn!(%host, error = %e, "undecodable event frame"),
        }
        return;
    }
    if stream < 0 || stream as usize >= shared.streams.len() {
        debug!(%host, stream, "frame for out-of-range stream");
        return;
    }

    let entry = shared.streams[stream as usize].lock().unwrap().clone();
    match entry {
        Some(slot) => {
            if !slot.put(frame) {
                // requester gave up on this stream; recycle the id
                shared.reclaim(stream, &slot);
            }
        }
        None => debug!(%host, stream, "frame for idle stream"),
    }
}
