//! Configuration structures for the packet sockets and stream layers.
//!
//! Every config starts from a constructor carrying the protocol defaults and
//! is adjusted with chained `with_*` methods. Secrets such as cookies and the
//! cshirt2 replay cache are passed in explicitly; nothing is process-global.
//!
//! # Example
//!
//! A UDP bridge and a client that knows its cookie:
//! ```
//! use std::time::Duration;
//! use roamwire::{Cookie, E2eConfig, ObfsConfig};
//!
//! let cookie = Cookie::from_entropy();
//!
//! let bridge_obfs = ObfsConfig::server(cookie.clone())
//!     .with_tunnel_ttl(Duration::from_secs(1800));
//! let bridge_e2e = E2eConfig::server();
//!
//! let client_obfs = ObfsConfig::client().with_hello_padding_max(256);
//! let client_e2e = E2eConfig::client().with_queue_capacity(4096);
//! ```
//!
//! A TCP bridge sharing one replay cache between two listeners:
//! ```
//! use std::sync::Arc;
//! use roamwire::{Cookie, Cshirt2Config, ReplayCache};
//!
//! let replay = Arc::new(ReplayCache::default());
//! let a = Cshirt2Config::new(Cookie::from_entropy()).with_replay_cache(replay.clone());
//! let b = Cshirt2Config::new(Cookie::from_entropy()).with_replay_cache(replay);
//! ```
use std::{sync::Arc, time::Duration};

use crate::{
    crypto::Cookie,
    replay_cache::ReplayCache,
    specification::{COOKIE_SKEW_BUCKETS, HELLO_PADDING_MAX_LEN},
};

/// Configuration for an [`ObfsSocket`].
///
/// A socket with a cookie acts as a server: it answers Hellos from unknown
/// peers. A socket without one only talks to peers registered with
/// [`ObfsSocket::register_peer`].
///
/// [`ObfsSocket`]: crate::obfs::ObfsSocket
/// [`ObfsSocket::register_peer`]: crate::obfs::ObfsSocket::register_peer
#[derive(Clone, Debug)]
pub struct ObfsConfig {
    pub(crate) cookie: Option<Cookie>,
    pub(crate) skew_buckets: i64,
    pub(crate) hello_padding_max: usize,
    pub(crate) tunnel_ttl: Duration,
    pub(crate) pending_ttl: Duration,
    pub(crate) table_capacity: usize,
    pub(crate) queue_capacity: usize,
}

impl ObfsConfig {
    /// A client socket: initiates handshakes, never answers unknown peers.
    pub fn client() -> Self {
        Self {
            cookie: None,
            skew_buckets: COOKIE_SKEW_BUCKETS,
            hello_padding_max: HELLO_PADDING_MAX_LEN,
            tunnel_ttl: Duration::from_secs(3600),
            pending_ttl: Duration::from_secs(60),
            table_capacity: 100_000,
            queue_capacity: 1024,
        }
    }

    /// A server socket listening with `cookie`.
    pub fn server(cookie: Cookie) -> Self {
        Self {
            cookie: Some(cookie),
            ..Self::client()
        }
    }

    /// Number of 30-second buckets accepted on each side of the current one.
    pub fn with_skew_buckets(mut self, buckets: u8) -> Self {
        self.skew_buckets = buckets as i64;
        self
    }

    /// Upper bound for the random padding appended to a Hello.
    ///
    /// ## Panic
    /// Panics if `max` is greater than 999.
    pub fn with_hello_padding_max(mut self, max: usize) -> Self {
        assert!(max <= HELLO_PADDING_MAX_LEN);
        self.hello_padding_max = max;
        self
    }

    /// How long an idle tunnel is kept. Every packet slides the expiry.
    pub fn with_tunnel_ttl(mut self, ttl: Duration) -> Self {
        self.tunnel_ttl = ttl;
        self
    }

    /// How long an unanswered Hello is kept.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Maximum number of tunnels.
    pub fn with_table_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity;
        self
    }

    /// Inbound datagrams buffered between the receive task and the reader.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Configuration for an [`E2eSocket`].
///
/// [`E2eSocket`]: crate::e2e::E2eSocket
#[derive(Clone, Debug)]
pub struct E2eConfig {
    pub(crate) auto_create: bool,
    pub(crate) queue_capacity: usize,
    pub(crate) session_ttl: Duration,
    pub(crate) session_capacity: usize,
    pub(crate) dup_rate_per_sec: f64,
    pub(crate) dup_burst: u32,
    pub(crate) reselect_interval: Duration,
}

impl E2eConfig {
    /// Client side: packets for unknown sessions are dropped.
    pub fn client() -> Self {
        Self {
            auto_create: false,
            queue_capacity: 1024,
            session_ttl: Duration::from_secs(3600),
            session_capacity: 100_000,
            dup_rate_per_sec: 10.0,
            dup_burst: 10,
            reselect_interval: Duration::from_millis(500),
        }
    }

    /// Server side: the first packet of an unknown session creates it.
    pub fn server() -> Self {
        Self {
            auto_create: true,
            ..Self::client()
        }
    }

    /// Overrides whether unknown sessions are created on receipt.
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    /// Bound of the application read queue. Overflow drops the newest packet.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// How long an idle session is kept.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Most sessions kept at once. Beyond that, the session closest to
    /// expiry is evicted.
    pub fn with_session_capacity(mut self, capacity: usize) -> Self {
        self.session_capacity = capacity.max(1);
        self
    }

    /// Token bucket controlling how often a send is duplicated on every path.
    pub fn with_duplication(mut self, rate_per_sec: f64, burst: u32) -> Self {
        self.dup_rate_per_sec = rate_per_sec;
        self.dup_burst = burst;
        self
    }

    /// Minimum time between two path reselections.
    pub fn with_reselect_interval(mut self, interval: Duration) -> Self {
        self.reselect_interval = interval;
        self
    }
}

/// Configuration for the client path [`Wrapper`].
///
/// [`Wrapper`]: crate::Wrapper
#[derive(Clone, Debug)]
pub struct WrapperConfig {
    pub(crate) rotate_base: Duration,
    pub(crate) rotate_mean: Duration,
    pub(crate) drain: Duration,
    pub(crate) queue_capacity: usize,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            rotate_base: Duration::from_secs(30),
            rotate_mean: Duration::from_secs(30),
            drain: Duration::from_secs(10),
            queue_capacity: 1024,
        }
    }
}

impl WrapperConfig {
    /// Socket lifetime is `base + Exp(mean)`.
    pub fn with_rotation(mut self, base: Duration, mean: Duration) -> Self {
        self.rotate_base = base;
        self.rotate_mean = mean;
        self
    }

    /// How long a replaced socket keeps receiving before it is closed.
    pub fn with_drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    /// Inbound datagrams buffered across all per-destination sockets.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Configuration for cshirt2 clients and listeners.
#[derive(Clone, Debug)]
pub struct Cshirt2Config {
    pub(crate) cookie: Cookie,
    pub(crate) epoch_tolerance: i64,
    pub(crate) max_delay_before_shutdown: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) replay_cache: Arc<ReplayCache>,
}

impl Cshirt2Config {
    /// Uses `cookie` with a fresh replay cache.
    pub fn new(cookie: Cookie) -> Self {
        Self {
            cookie,
            epoch_tolerance: 10,
            max_delay_before_shutdown: Duration::from_millis(5000),
            handshake_timeout: Duration::from_secs(30),
            replay_cache: Arc::new(ReplayCache::default()),
        }
    }

    /// Number of 60-second epochs the server accepts on each side.
    pub fn with_epoch_tolerance(mut self, epochs: u8) -> Self {
        self.epoch_tolerance = epochs as i64;
        self
    }

    /// Sets the maximum delay before closing the connection after a failed
    /// handshake. The default is 5000 milliseconds.
    ///
    /// The delay is sampled from a uniform distribution within
    /// `[0, max_delay]`.
    pub fn with_max_delay_before_shutdown(mut self, max_delay: Duration) -> Self {
        self.max_delay_before_shutdown = max_delay;
        self
    }

    /// How long a listener waits for a client to finish its handshake. A
    /// connection that takes longer is treated like a failed handshake. The
    /// default is 30 seconds.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Shares a replay cache, typically between listeners of one process.
    pub fn with_replay_cache(mut self, cache: Arc<ReplayCache>) -> Self {
        self.replay_cache = cache;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let obfs = ObfsConfig::client();
        assert!(obfs.cookie.is_none());
        assert_eq!(obfs.skew_buckets, 3);
        assert_eq!(obfs.hello_padding_max, 999);

        let e2e = E2eConfig::server();
        assert!(e2e.auto_create);
        assert_eq!(e2e.queue_capacity, 1024);
        assert_eq!(e2e.dup_burst, 10);
        assert_eq!(e2e.reselect_interval, Duration::from_millis(500));
        assert_eq!(e2e.session_capacity, 100_000);
        assert!(!E2eConfig::client().auto_create);

        let wrapper = WrapperConfig::default();
        assert_eq!(wrapper.drain, Duration::from_secs(10));

        let cshirt2 = Cshirt2Config::new(Cookie::from([0u8; 32]));
        assert_eq!(cshirt2.epoch_tolerance, 10);
        assert_eq!(cshirt2.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_session_capacity_is_at_least_one() {
        let e2e = E2eConfig::client().with_session_capacity(0);
        assert_eq!(e2e.session_capacity, 1);
    }

    #[test]
    #[should_panic]
    fn test_hello_padding_bound() {
        let _ = ObfsConfig::client().with_hello_padding_max(1000);
    }
}
