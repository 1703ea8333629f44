//! Client configuration surface.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::frame::{Compression, Consistency, Version};
use crate::net::socket::TlsContext;
use crate::policy::{LoadBalancingPolicy, RoundRobinPolicy};

/// Factory producing the load-balancing policy a client will use.
pub type PolicyMaker = Box<dyn Fn() -> Arc<dyn LoadBalancingPolicy> + Send + Sync>;

/// How `Client::prepare` distributes PREPARE requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareStrategy {
    /// Prepare against a single policy-selected host; other hosts pick
    /// the statement up through unprepared-error recovery.
    #[default]
    Lazy,
    /// Prepare against every currently selectable host up front.
    Eager,
}

/// Per-connection behavior.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub response_timeout: Duration,
    /// Stream-id space per connection; bounds concurrent in-flight
    /// requests on one socket.
    pub max_streams: usize,
    /// Largest response frame body accepted.
    pub max_recv_buffer: usize,
    pub compression: Compression,
    pub tls: Option<TlsContext>,
    /// Keyspace selected with `USE` right after the handshake.
    pub default_keyspace: Option<String>,
    pub authenticators: Vec<Arc<dyn Authenticator>>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(10),
            max_streams: 128,
            max_recv_buffer: 16 * 1024 * 1024,
            compression: Compression::None,
            tls: None,
            default_keyspace: None,
            authenticators: Vec::new(),
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("connect_timeout", &self.connect_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("max_streams", &self.max_streams)
            .field("max_recv_buffer", &self.max_recv_buffer)
            .field("compression", &self.compression)
            .field("tls", &self.tls.is_some())
            .field("default_keyspace", &self.default_keyspace)
            .field("authenticators", &self.authenticators.len())
            .finish()
    }
}

/// Per-host connection pool behavior.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// How long an acquisition waits for a free connection before the
    /// host counts as busy.
    pub wait_queue_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_connections: 4,
            idle_timeout: Duration::from_secs(60),
            wait_queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Constant(Duration),
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before retry attempt `attempt` (first retry is 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Constant(d) => d,
            Backoff::Exponential { base, cap } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(20);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Attempt bound and pacing of the retry engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(50),
                cap: Duration::from_secs(5),
            },
        }
    }
}

/// Retry behavior of the request dispatcher.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub policy: RetryPolicy,
    /// Millisecond shift applied to the send timeout on each retry;
    /// may be negative.
    pub send_timeout_change_ms: i64,
    /// Millisecond shift applied to the response timeout on each retry.
    pub recv_timeout_change_ms: i64,
    /// Consistency rewritten into QUERY/EXECUTE/BATCH on retries.
    pub reduced_consistency: Option<Consistency>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            policy: RetryPolicy::default(),
            send_timeout_change_ms: 0,
            recv_timeout_change_ms: 0,
            reduced_consistency: None,
        }
    }
}

/// Root configuration handed to [`Client::init`](crate::Client::init).
pub struct ClientSettings {
    /// Hostnames or addresses tried in order for the first control
    /// connection.
    pub contacts: Vec<String>,
    pub port: u16,
    pub connection: ConnectionSettings,
    pub pool: PoolSettings,
    pub retry: RetrySettings,
    pub version: Version,
    pub prepare_strategy: PrepareStrategy,
    pub prepared_cache_size: usize,
    pub policy_maker: PolicyMaker,
}

impl ClientSettings {
    pub fn new(contacts: Vec<String>) -> Self {
        ClientSettings {
            contacts,
            port: 9042,
            connection: ConnectionSettings::default(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            version: Version::default(),
            prepare_strategy: PrepareStrategy::default(),
            prepared_cache_size: 1024,
            policy_maker: Box::new(|| Arc::new(RoundRobinPolicy::new())),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_prepare_strategy(mut self, strategy: PrepareStrategy) -> Self {
        self.prepare_strategy = strategy;
        self
    }

    pub fn with_policy_maker(mut self, maker: PolicyMaker) -> Self {
        self.policy_maker = maker;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.contacts.is_empty() {
            return Err(Error::InvalidSettings("no contact points".into()));
        }
        if self.prepared_cache_size == 0 {
            return Err(Error::InvalidCacheSize);
        }
        let ceiling = self.version.max_streams_ceiling();
        if self.connection.max_streams == 0 || self.connection.max_streams > ceiling {
            return Err(Error::InvalidSettings(format!(
                "max_streams must be within 1..={ceiling}"
            )));
        }
        if self.connection.max_recv_buffer < crate::frame::HEADER_LEN {
            return Err(Error::InvalidSettings("max_recv_buffer too small".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("contacts", &self.contacts)
            .field("port", &self.port)
            .field("connection", &self.connection)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("version", &self.version)
            .field("prepare_strategy", &self.prepare_strategy)
            .field("prepared_cache_size", &self.prepared_cache_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(300),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(300));
        assert_eq!(backoff.delay(10), Duration::from_millis(300));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let empty = ClientSettings::new(vec![]);
        assert!(matches!(
            empty.validate(),
            Err(Error::InvalidSettings(_))
        ));

        let mut zero_cache = ClientSettings::new(vec!["localhost".into()]);
        zero_cache.prepared_cache_size = 0;
        assert!(matches!(zero_cache.validate(), Err(Error::InvalidCacheSize)));

        let mut too_many_streams = ClientSettings::new(vec!["localhost".into()]);
        too_many_streams.connection.max_streams = 40_000;
        assert!(matches!(
            too_many_streams.validate(),
            Err(Error::InvalidSettings(_))
        ));

        assert!(ClientSettings::new(vec!["localhost".into()])
            .validate()
            .is_ok());
    }
}
