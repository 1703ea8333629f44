//! Uniform stream-oriented byte pipe over TCP or TLS.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cluster::host::InetAddr;
use crate::error::{Error, Result};

/// TLS material for encrypted connections: a caller-supplied rustls
/// client config and an optional server-name override. The peer's IP
/// address is used for SNI/verification otherwise.
#[derive(Clone)]
pub struct TlsContext {
    pub config: Arc<ClientConfig>,
    pub server_name: Option<ServerName<'static>>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// A connected byte pipe, plain TCP or TLS layered over it.
pub enum Socket {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    /// Opens a socket to `addr` within `connect_timeout`, layering TLS
    /// when a context is provided. The handshake shares the same
    /// timeout budget.
    pub async fn connect(
        addr: InetAddr,
        connect_timeout: Duration,
        tls: Option<&TlsContext>,
    ) -> Result<Socket> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr.addr()))
            .await
            .map_err(|_| Error::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;

        match tls {
            None => {
                debug!(%addr, "tcp socket connected");
                Ok(Socket::Tcp(stream))
            }
            Some(ctx) => {
                let name = match &ctx.server_name {
                    Some(name) => name.clone(),
                    None => ServerName::IpAddress(addr.ip().into()),
                };
                let connector = TlsConnector::from(ctx.config.clone());
                let tls_stream = timeout(connect_timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| Error::ConnectTimeout(addr))?
                    .map_err(tls_error)?;
                debug!(%addr, "tls socket connected");
                Ok(Socket::Tls(Box::new(tls_stream)))
            }
        }
    }
}

fn tls_error(e: io::Error) -> Error {
    match e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>())
    {
        Some(tls) => Error::Tls(Arc::new(tls.clone())),
        None => Error::Io(Arc::new(e)),
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[tokio::test]
    async fn connect_timeout_is_reported_as_such() {
        // 198.51.100.0/24 (TEST-NET-2) never answers
        let addr = InetAddr::new(IpAddr::from([198, 51, 100, 1]), 9042);
        let res = Socket::connect(addr, Duration::from_millis(50), None).await;
        assert!(matches!(res, Err(Error::ConnectTimeout(a)) if a == addr));
    }

    #[tokio::test]
    async fn refused_connection_surfaces_io_error() {
        // bind a port, then close the listener so connects are refused
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: InetAddr = listener.local_addr().unwrap().into();
        drop(listener);

        let res = Socket::connect(addr, Duration::from_secs(1), None).await;
        assert!(matches!(res, Err(Error::Io(_)) | Err(Error::ConnectTimeout(_))));
    }
}
