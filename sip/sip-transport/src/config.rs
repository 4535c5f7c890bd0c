//! Configuration of the transport bootstrap and of the endpoints owning chains.

use std::collections::BTreeMap;
use std::time::Duration;

/// Transport specific option map (TCP, UDP or TLS options) as handed out by configuration
/// management. The transport core does not interpret the values, it only compares them
/// to detect configuration changes and forwards them as channel properties.
pub type Options = BTreeMap<String, String>;

/// Settings of the [`Bootstrap`](crate::Bootstrap).
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Enable SO_KEEPALIVE on accepted TCP connections
    pub tcp_keep_alive: bool,
    /// Enable TCP_NODELAY on accepted TCP connections
    pub tcp_nodelay: bool,
    /// Timeout for outbound TCP connects created from a listening connection
    pub connect_timeout: Duration,
    /// Upper bound for the graceful drain in [`Bootstrap::shutdown`](crate::Bootstrap::shutdown)
    pub shutdown_timeout: Duration,
    /// Largest datagram read from a UDP socket
    pub max_datagram_size: usize,
    /// Datagrams shorter than this are silently dropped
    pub min_datagram_size: usize,
    /// Number of idle message buffers kept by the pool
    pub pool_capacity: usize,
    /// Initial capacity of a freshly allocated message buffer
    pub buffer_capacity: usize,
    /// Retry policy of binds performed on the startup path
    pub bind_retry: RetryPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            tcp_keep_alive: true,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
            max_datagram_size: u16::MAX as usize,
            min_datagram_size: 20,
            pool_capacity: 1024,
            buffer_capacity: 4096,
            bind_retry: RetryPolicy::default(),
        }
    }
}

impl BootstrapConfig {
    pub fn with_bind_retry(mut self, bind_retry: RetryPolicy) -> Self {
        self.bind_retry = bind_retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_tcp_keep_alive(mut self, keep_alive: bool) -> Self {
        self.tcp_keep_alive = keep_alive;
        self
    }
}

/// Exponential backoff used when a listener fails to bind on the startup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failed one
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Give up after the first failure
    pub fn none() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (starting at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);

        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Endpoint level settings shared by all chains of an endpoint.
///
/// A port of `None` means the port is not configured, which makes the configuration
/// of the corresponding chain invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointOptions {
    pub id: String,
    pub host: String,
    pub tcp_port: Option<u16>,
    pub tls_port: Option<u16>,
    pub udp_port: Option<u16>,
}

impl EndpointOptions {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    pub fn with_tls_port(mut self, port: u16) -> Self {
        self.tls_port = Some(port);
        self
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }
}
