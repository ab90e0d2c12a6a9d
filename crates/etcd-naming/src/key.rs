//! Key schema
//!
//! Every instance lives at `/<PREFIX>/<service>/<host:port>` and stores its own
//! `host:port` as the value, so a watch event is usable without a second read.

use std::fmt;
use std::net::IpAddr;

/// Namespace all service keys live under.
pub const PREFIX: &str = "etcd3_naming";

/// Format `host:port`, bracketing IPv6 literals.
pub fn instance_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// The key prefix shared by every instance of `service`.
pub fn service_prefix(service: &str) -> String {
    format!("/{}/{}/", PREFIX, service)
}

/// Recover the instance address from a full key under `prefix`.
pub fn address_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|addr| !addr.is_empty())
}

/// Key identifying one registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    service: String,
    address: String,
}

impl ServiceKey {
    pub fn new(service: impl Into<String>, host: &str, port: u16) -> Self {
        Self {
            service: service.into(),
            address: instance_address(host, port),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The `host:port` value stored under this key.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", service_prefix(&self.service), self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = ServiceKey::new("pay", "10.0.0.5", 9000);
        assert_eq!(key.to_string(), "/etcd3_naming/pay/10.0.0.5:9000");
        assert_eq!(key.address(), "10.0.0.5:9000");
        assert_eq!(key.service(), "pay");
    }

    #[test]
    fn test_ipv6_is_bracketed() {
        assert_eq!(instance_address("::1", 50051), "[::1]:50051");
        assert_eq!(instance_address("payments.internal", 80), "payments.internal:80");
    }

    #[test]
    fn test_address_from_key() {
        let prefix = service_prefix("pay");
        assert_eq!(
            address_from_key(&prefix, "/etcd3_naming/pay/10.0.0.5:9000"),
            Some("10.0.0.5:9000")
        );
        assert_eq!(address_from_key(&prefix, "/etcd3_naming/pay/"), None);
        assert_eq!(address_from_key(&prefix, "/etcd3_naming/billing/10.0.0.5:9000"), None);
    }

    #[test]
    fn test_prefix_does_not_match_sibling_service() {
        // "pay/" must not match "payroll/"
        let key = ServiceKey::new("payroll", "10.0.0.1", 1);
        assert!(!key.to_string().starts_with(&service_prefix("pay")));
    }
}
