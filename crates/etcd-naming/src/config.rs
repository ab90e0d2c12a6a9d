//! Naming Configuration
//!
//! Store connection and lease settings with environment variable overrides.

use std::time::Duration;

/// Connection and lease settings shared by the registrar and resolver
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub endpoints: Vec<String>,

    /// Timeout for establishing the store connection (env: ETCD_DIAL_TIMEOUT_MS)
    pub dial_timeout: Duration,

    /// TTL for registration leases in seconds (env: NAMING_LEASE_TTL)
    pub lease_ttl: i64,

    /// Interval between keep-alive heartbeats (env: NAMING_KEEPALIVE_INTERVAL_MS).
    /// `None` uses a third of the lease TTL.
    pub keepalive_interval: Option<Duration>,

    // Connect backoff settings
    /// Initial interval for connection retry
    pub backoff_initial: Duration,

    /// Maximum interval for connection retry
    pub backoff_max: Duration,

    /// Multiplier for connection backoff
    pub backoff_multiplier: f64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout: Duration::from_secs(3),
            lease_ttl: 10,
            keepalive_interval: None,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl NamingConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.endpoints = parse_endpoints(&endpoints);
        }

        if let Ok(ms) = std::env::var("ETCD_DIAL_TIMEOUT_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.dial_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(ttl) = std::env::var("NAMING_LEASE_TTL") {
            if let Ok(parsed) = ttl.parse::<i64>() {
                config.lease_ttl = parsed;
            }
        }

        if let Ok(ms) = std::env::var("NAMING_KEEPALIVE_INTERVAL_MS") {
            if let Ok(parsed) = ms.parse::<u64>() {
                config.keepalive_interval = Some(Duration::from_millis(parsed));
            }
        }

        config
    }

    /// Replace the endpoint list with a comma-separated store target.
    pub fn with_target(mut self, target: &str) -> Self {
        self.endpoints = parse_endpoints(target);
        self
    }
}

/// Split a comma-separated store target into endpoints, dropping blanks.
pub fn parse_endpoints(target: &str) -> Vec<String> {
    target
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Heartbeat interval for a lease: a third of the TTL, so even a 1s lease is
/// renewed well before its deadline.
pub fn default_keepalive_interval(ttl_secs: i64) -> Duration {
    Duration::from_secs(ttl_secs.max(1) as u64) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("etcd-0:2379, etcd-1:2379,,"),
            vec!["etcd-0:2379".to_string(), "etcd-1:2379".to_string()]
        );
        assert!(parse_endpoints("").is_empty());
    }

    #[test]
    fn test_default_keepalive_interval() {
        assert_eq!(default_keepalive_interval(9), Duration::from_secs(3));
        assert_eq!(default_keepalive_interval(10), Duration::from_secs(10) / 3);
        // Shortest lease still gets renewed before it expires
        assert!(default_keepalive_interval(1) < Duration::from_secs(1));
        assert_eq!(default_keepalive_interval(0), Duration::from_secs(1) / 3);
    }

    #[test]
    fn test_with_target() {
        let config = NamingConfig::default().with_target("store:2379");
        assert_eq!(config.endpoints, vec!["store:2379".to_string()]);
        assert_eq!(config.lease_ttl, 10);
    }
}
