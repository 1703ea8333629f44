//! Pluggable SASL authentication for the connection handshake.

use bytes::{BufMut, Bytes, BytesMut};

/// Answers the server's authentication exchange for one mechanism.
///
/// Implementations must be cheap: hooks run inline during connection
/// setup.
pub trait Authenticator: Send + Sync {
    /// Fully qualified mechanism this authenticator answers for, as the
    /// server announces it in AUTHENTICATE.
    fn mechanism(&self) -> &str;

    /// Initial SASL token sent in the first AUTH_RESPONSE.
    fn on_request(&self) -> Bytes;

    /// Answer to an AUTH_CHALLENGE token. `None` means the mechanism
    /// does not expect challenges and the exchange is broken.
    fn on_challenge(&self, _token: Option<&Bytes>) -> Option<Bytes> {
        None
    }
}

/// SASL PLAIN, the exchange Cassandra's `PasswordAuthenticator` speaks:
/// a single `\0user\0password` token and no challenges.
pub struct PlainTextAuthenticator {
    user: String,
    pass: String,
}

impl PlainTextAuthenticator {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn mechanism(&self) -> &str {
        "org.apache.cassandra.auth.PasswordAuthenticator"
    }

    fn on_request(&self) -> Bytes {
        let mut token = BytesMut::with_capacity(2 + self.user.len() + self.pass.len());
        token.put_u8(0);
        token.extend_from_slice(self.user.as_bytes());
        token.put_u8(0);
        token.extend_from_slice(self.pass.as_bytes());
        token.freeze()
    }
}
