//! Typed configuration for every subsystem, constructed explicitly via
//! the client's `setup_*` calls rather than discovered ambiently.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Https => 443,
            Protocol::Http => 8069,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }
}

/// Top-level client configuration (§6 "Configuration").
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub pool: PoolConfig,
}

impl ClientConfig {
    /// Parses `host_or_url`, which may be a bare host or a full URL with
    /// scheme and optional port, applying the documented protocol/port
    /// defaults (https -> 443, http -> 8069).
    pub fn new(host_or_url: impl AsRef<str>) -> Self {
        let raw = host_or_url.as_ref();
        let (protocol, rest) = if let Some(stripped) = raw.strip_prefix("https://") {
            (Protocol::Https, stripped)
        } else if let Some(stripped) = raw.strip_prefix("http://") {
            (Protocol::Http, stripped)
        } else {
            (Protocol::Https, raw)
        };

        let (host, port) = match rest.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()),
            None => (rest.trim_end_matches('/').to_string(), None),
        };

        let port = port.unwrap_or_else(|| protocol.default_port());

        ClientConfig {
            host,
            port,
            protocol,
            timeout: Duration::from_secs(30),
            verify_ssl: true,
            pool: PoolConfig::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self.port = protocol.default_port();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Connection pool configuration (§4.1).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub max_connections: usize,
    pub connection_ttl: Duration,
    pub health_check_interval: Duration,
    pub max_error_rate: f64,
    pub acquire_wait: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 10,
            max_connections: 20,
            connection_ttl: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            max_error_rate: 10.0,
            acquire_wait: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker configuration (§4.1).
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }
}

/// Transaction manager configuration (§6).
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    pub max_active_transactions: usize,
    pub default_timeout: Duration,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        TransactionManagerConfig {
            max_active_transactions: 100,
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Cache manager configuration (§6).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub url: Option<String>,
    pub enable_fallback: bool,
    pub circuit_breaker_threshold: u32,
    pub max_size: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            backend: CacheBackendKind::Memory,
            url: None,
            enable_fallback: true,
            circuit_breaker_threshold: 5,
            max_size: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Memory,
    Remote,
}

/// Batch manager configuration (§6).
#[derive(Debug, Clone)]
pub struct BatchManagerConfig {
    pub max_chunk_size: usize,
    pub max_concurrency: usize,
    pub timeout: Option<Duration>,
    pub retry_attempts: u32,
}

impl Default for BatchManagerConfig {
    fn default() -> Self {
        BatchManagerConfig {
            max_chunk_size: 100,
            max_concurrency: 5,
            timeout: None,
            retry_attempts: 3,
        }
    }
}
