//! Error types
//!
//! `StoreError` is what a coordination-store backend reports. `NamingError`
//! classifies it by the step that failed, so callers can tell an unreachable
//! store apart from a rejected lease or a broken watch.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`NamingStore`](crate::store::NamingStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("store unreachable within {0:?}")]
    DialTimeout(Duration),

    #[error("store connection closed")]
    Closed,

    #[error("watch stream ended")]
    StreamEnded,

    #[error("watch canceled by store: {0}")]
    WatchCanceled(String),

    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 { field: &'static str },
}

/// Errors returned by the registrar, resolver and watcher.
#[derive(Debug, Error)]
pub enum NamingError {
    /// Store unreachable or misconfigured
    #[error("connection error: {0}")]
    Connection(#[source] StoreError),

    /// Lease grant, keep-alive or revoke rejected by the store
    #[error("lease error: {0}")]
    Lease(#[source] StoreError),

    /// Key publication failed
    #[error("write error: {0}")]
    Write(#[source] StoreError),

    /// Listing or watch failed
    #[error("read error: {0}")]
    Read(#[source] StoreError),

    /// Invalid input
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl NamingError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True when the error means the store connection itself is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Connection(StoreError::Closed)
                | Self::Lease(StoreError::Closed)
                | Self::Write(StoreError::Closed)
                | Self::Read(StoreError::Closed)
        )
    }
}

pub type Result<T, E = NamingError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_source() {
        let err = NamingError::Lease(StoreError::LeaseNotFound(42));
        assert_eq!(err.to_string(), "lease error: lease 42 not found");
    }

    #[test]
    fn test_is_closed() {
        assert!(NamingError::Read(StoreError::Closed).is_closed());
        assert!(!NamingError::Read(StoreError::WatchCanceled("compacted".into())).is_closed());
        assert!(!NamingError::config("empty service name").is_closed());
    }
}
