//! Coordination Store
//!
//! The registrar and watcher only see the store through [`NamingStore`]:
//! - `etcd`: the production backend over `etcd-client`
//! - `memory`: an in-process store with real lease expiry, for tests and local runs

mod etcd;
pub mod memory;

use crate::error::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

/// A key and its value as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Keys under a prefix as of one store revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One key change delivered by a watch.
///
/// For deletes `value` is the last value the key held, when the backend knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    /// Store revision that made this change
    pub mod_revision: i64,
}

/// Events delivered together by one watch response.
///
/// `revision` is the store revision the batch brings the watcher up to: the
/// last event's revision, or the response revision when there are no events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// Batches in the order the store emitted them
pub type EventStream = BoxStream<'static, Result<WatchBatch, StoreError>>;

/// Keep-alive acknowledgements; each item carries the lease's renewed TTL in seconds
pub type RenewalStream = BoxStream<'static, Result<i64, StoreError>>;

/// Sends keep-alive heartbeats for one lease.
#[async_trait]
pub trait LeaseRenewer: Send {
    async fn renew(&mut self) -> Result<(), StoreError>;
}

/// Operations the naming layer needs from a coordination store.
#[async_trait]
pub trait NamingStore: Clone + Send + Sync + 'static {
    async fn grant(&mut self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    async fn put(&mut self, key: &str, value: &str, lease: LeaseId) -> Result<(), StoreError>;

    async fn keep_alive(
        &mut self,
        lease: LeaseId,
    ) -> Result<(Box<dyn LeaseRenewer>, RenewalStream), StoreError>;

    async fn revoke(&mut self, lease: LeaseId) -> Result<(), StoreError>;

    async fn list(&mut self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Watch `prefix`, replaying changes from `start_revision` when given.
    async fn watch(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<EventStream, StoreError>;

    /// Fires once the connection is torn down.
    fn cancellation(&self) -> CancellationToken;

    /// Tear down the connection. Idempotent.
    fn close(&self) {
        self.cancellation().cancel();
    }
}
