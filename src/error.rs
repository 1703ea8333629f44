//! Error kinds shared across the client.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::cluster::host::InetAddr;
use crate::frame::response::DbError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classified client errors. User-visible renderings carry the
/// `cql-io: ` prefix so driver failures are attributable in embedding
/// logs.
///
/// The enum is `Clone` because connection teardown fans a single error
/// out to every waiter parked on the connection; non-clonable causes
/// are shared through `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The configured compression algorithm is not offered by the
    /// server.
    #[error("cql-io: unsupported compression, server offers {supported:?}")]
    UnsupportedCompression { supported: Vec<String> },

    /// The prepared-query cache was configured with a capacity of zero.
    #[error("cql-io: invalid prepared-query cache size")]
    InvalidCacheSize,

    /// A settings value is out of range or inconsistent.
    #[error("cql-io: invalid settings: {0}")]
    InvalidSettings(String),

    /// The connection was closed, locally or by the peer.
    #[error("cql-io: connection closed ({0})")]
    ConnectionClosed(InetAddr),

    /// The TCP (or TLS) handshake did not finish in time.
    #[error("cql-io: connect timeout ({0})")]
    ConnectTimeout(InetAddr),

    /// No response arrived for a request within the response timeout.
    #[error("cql-io: response timeout ({0})")]
    ResponseTimeout(InetAddr),

    /// The load-balancing policy had no host to offer.
    #[error("cql-io: no host available")]
    NoHostAvailable,

    /// Every candidate host's pool was saturated.
    #[error("cql-io: hosts busy")]
    HostsBusy,

    /// A frame could not be decoded.
    #[error("cql-io: parse error: {0}")]
    Parse(String),

    /// The server answered with a frame the protocol does not allow at
    /// this point of the exchange.
    #[error("cql-io: unexpected response from {0}")]
    UnexpectedResponse(InetAddr),

    /// An invariant the client relies on was violated.
    #[error("cql-io: internal error: {0}")]
    Internal(String),

    /// Two distinct query texts mapped to the same logical
    /// prepared-query key.
    #[error("cql-io: hash collision between {0:?} and {1:?}")]
    HashCollision(String, String),

    /// The server demands authentication but no matching authenticator
    /// is configured.
    #[error("cql-io: authentication required: {0}")]
    AuthenticationRequired(String),

    /// None of the configured authenticators answers for the mechanism
    /// the server announced.
    #[error("cql-io: authentication mechanism not supported: {0}")]
    AuthenticationMechanismUnsupported(String),

    /// The server issued a challenge the mechanism does not expect.
    #[error("cql-io: unexpected authentication challenge for {0}")]
    UnexpectedAuthenticationChallenge(String),

    /// Transport-level I/O failure.
    #[error("cql-io: i/o error: {0}")]
    Io(Arc<io::Error>),

    /// TLS-level failure.
    #[error("cql-io: tls error: {0}")]
    Tls(Arc<tokio_rustls::rustls::Error>),

    /// A retryable server error travelling through the retry engine.
    /// Server errors surfacing to callers are carried inside a normal
    /// `Response` instead.
    #[error("cql-io: server error: {0}")]
    Server(DbError),

    /// The client has been shut down; no further requests are served.
    #[error("cql-io: client has been shut down")]
    Shutdown,
}

impl Error {
    /// True for transport-level failures that must trip the
    /// dispatcher's connection-error hook (and with it, control
    /// connection recovery).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed(_)
                | Error::ConnectTimeout(_)
                | Error::ResponseTimeout(_)
                | Error::Io(_)
                | Error::Tls(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Error::Tls(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_visible_errors_carry_prefix() {
        let errors: Vec<Error> = vec![
            Error::NoHostAvailable,
            Error::HostsBusy,
            Error::InvalidCacheSize,
            Error::Parse("bad header".into()),
            Error::Shutdown,
            Error::AuthenticationRequired("mech".into()),
        ];
        for e in errors {
            assert!(e.to_string().starts_with("cql-io: "), "{e}");
        }
    }

    #[test]
    fn connection_error_classification() {
        let addr = InetAddr::new([127, 0, 0, 1].into(), 9042);
        assert!(Error::ConnectionClosed(addr).is_connection_error());
        assert!(Error::ResponseTimeout(addr).is_connection_error());
        assert!(!Error::NoHostAvailable.is_connection_error());
        assert!(!Error::Shutdown.is_connection_error());
    }
}
