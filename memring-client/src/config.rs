//! Configuration for the cache client.
//!
//! Every knob has a documented default; `ClientConfig::new` plus the
//! `with_*` builders cover the common cases.

use std::time::Duration;

use memring_proto::DEFAULT_MAX_VALUE_SIZE;

use crate::error::{Error, Result};

/// One configured server: `host:port` plus a relative ring weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Address in `host:port` form; hostnames are resolved at connect time.
    pub addr: String,
    /// Relative weight; a node with weight 2 owns twice the ring arc.
    pub weight: u32,
}

impl ServerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        ServerAddr {
            addr: addr.into(),
            weight: 1,
        }
    }

    pub fn with_weight(addr: impl Into<String>, weight: u32) -> Self {
        ServerAddr {
            addr: addr.into(),
            weight,
        }
    }
}

/// Per-node connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum connections per node, idle plus in-use. Default 16.
    pub max_total: usize,
    /// Idle connections kept open regardless of age. Default 2.
    pub min_idle: usize,
    /// How long `acquire` blocks when the pool is saturated. Default 1s.
    pub acquire_timeout: Duration,
    /// Idle age beyond which surplus connections are closed. Default 60s.
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_total: 16,
            min_idle: 2,
            acquire_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry-with-backoff settings for transient failures.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt. Default 2.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt. Default 50ms.
    pub base_backoff: Duration,
    /// Upper bound on any single backoff. Default 2s.
    pub max_backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_retries: 2,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Per-node circuit breaker settings.
#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Consecutive failures before the node is suspended. Default 5.
    pub failure_threshold: u32,
    /// How long a suspended node is skipped before a single probe. Default 30s.
    pub cooldown: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        BreakerOptions {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Main configuration for the cache client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Cache nodes. At least one is required.
    pub servers: Vec<ServerAddr>,
    /// Per-node pool settings.
    pub pool: PoolOptions,
    /// TCP connect timeout. Default 1s.
    pub connect_timeout: Duration,
    /// TCP read timeout; bounds every response wait. Default 3s.
    pub read_timeout: Duration,
    /// TCP write timeout. Default 3s.
    pub write_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryOptions,
    /// Circuit breaker thresholds.
    pub breaker: BreakerOptions,
    /// Ring positions per unit of node weight. Default 160.
    pub vnodes_per_node: usize,
    /// Largest value accepted for storage and decoding. Default 1 MiB.
    pub max_value_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            pool: PoolOptions::default(),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            retry: RetryOptions::default(),
            breaker: BreakerOptions::default(),
            vnodes_per_node: 160,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given unweighted server addresses.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(ServerAddr::new).collect(),
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerOptions) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Validates construction-time invariants.
    ///
    /// These are the only fatal errors in the crate; everything at runtime is
    /// a recoverable result value.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("server list is empty".to_string()));
        }
        for server in &self.servers {
            if !server.addr.contains(':') {
                return Err(Error::Config(format!(
                    "server address {:?} is missing a port",
                    server.addr
                )));
            }
            if server.weight == 0 {
                return Err(Error::Config(format!(
                    "server {:?} has zero weight",
                    server.addr
                )));
            }
        }
        if self.pool.max_total == 0 {
            return Err(Error::Config("pool max_total must be at least 1".to_string()));
        }
        if self.pool.min_idle > self.pool.max_total {
            return Err(Error::Config("pool min_idle exceeds max_total".to_string()));
        }
        if self.vnodes_per_node == 0 {
            return Err(Error::Config("vnodes_per_node must be at least 1".to_string()));
        }
        if self.max_value_size == 0 {
            return Err(Error::Config("max_value_size must be at least 1".to_string()));
        }
        Ok(())
    }
}
