// config.rs - Process-level defaults handed to the session orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default PLC host used when neither the caller nor the environment
/// supplies one.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Standard EtherNet/IP explicit-messaging TCP port.
pub const DEFAULT_PORT: u16 = 44818;

/// Default number of pooled connections per PLC endpoint.
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Identity of one PLC endpoint. Pools are keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration struct consumed by [`crate::SessionManager::new`].
///
/// The external bootstrap reads these values from the environment and hands
/// them over as one struct; the core keeps no process-wide singletons.
/// `auth_token` belongs to the external HTTP surface and is only stored
/// here so the bootstrap has a single place to put it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Default PLC host for sessions opened without an override.
    pub host: String,
    /// Default PLC TCP port.
    pub port: u16,
    /// Connections kept per endpoint pool.
    pub pool_size: usize,
    /// Bearer token for the external HTTP surface. Unused by the core.
    pub auth_token: String,
    /// Opaque keep-alive payload sent as ENIP NOP data and reported in
    /// diagnostics as `pattern_hex`. Never parsed.
    pub keep_alive_pattern: Vec<u8>,
    /// Interval between keep-alive probes.
    pub heartbeat_interval: Duration,
    /// Transport-level timeout for a single socket read or write.
    pub read_timeout: Duration,
    /// Overall deadline for one external operation, pool wait included.
    pub operation_deadline: Duration,
    /// Re-establishment attempts after the heartbeat declares a connection
    /// dead, before the session is closed.
    pub reconnect_retries: u32,
    /// First re-establishment backoff; doubles per attempt, capped at 16x.
    pub reconnect_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pool_size: DEFAULT_POOL_SIZE,
            auth_token: String::new(),
            keep_alive_pattern: vec![0u8; 8],
            heartbeat_interval: Duration::from_millis(1000),
            read_timeout: Duration::from_secs(2),
            operation_deadline: Duration::from_secs(5),
            reconnect_retries: 5,
            reconnect_backoff: Duration::from_millis(200),
        }
    }
}

impl LinkConfig {
    /// Endpoint formed from the configured defaults.
    pub fn default_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Endpoint with per-call host/port overrides applied.
    pub fn resolve_endpoint(&self, host: Option<&str>, port: Option<u16>) -> Endpoint {
        Endpoint::new(
            host.unwrap_or(&self.host).to_string(),
            port.unwrap_or(self.port),
        )
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_keep_alive_pattern(mut self, pattern: Vec<u8>) -> Self {
        self.keep_alive_pattern = pattern;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LinkConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 44818);
        assert_eq!(config.pool_size, 2);
        assert!(config.auth_token.is_empty());
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.reconnect_retries, 5);
    }

    #[test]
    fn endpoint_resolution_prefers_overrides() {
        let config = LinkConfig::default().with_host("10.0.0.5").with_port(2222);
        assert_eq!(config.resolve_endpoint(None, None), Endpoint::new("10.0.0.5", 2222));
        assert_eq!(
            config.resolve_endpoint(Some("192.168.1.10"), Some(44818)),
            Endpoint::new("192.168.1.10", 44818)
        );
    }
}
