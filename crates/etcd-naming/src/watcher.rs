//! Membership Watcher
//!
//! Turns a service's key prefix into batches of add/remove updates. The first
//! call lists the prefix and returns the current members as one batch; every
//! later call waits on a prefix watch and returns the next batch of changes.

use crate::error::{NamingError, Result, StoreError};
use crate::key::{address_from_key, service_prefix};
use crate::metrics;
use crate::store::{EventKind, EventStream, NamingStore, WatchEvent};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Remove => "remove",
        }
    }
}

/// One change to the live address set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MembershipUpdate {
    pub op: Operation,
    pub address: String,
}

impl MembershipUpdate {
    pub fn add(address: impl Into<String>) -> Self {
        Self {
            op: Operation::Add,
            address: address.into(),
        }
    }

    pub fn remove(address: impl Into<String>) -> Self {
        Self {
            op: Operation::Remove,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// No snapshot taken yet
    SnapshotPending,
    /// Snapshot delivered (or empty); deltas come from the watch
    Streaming,
}

/// Watches one service's membership.
///
/// Not meant to be shared between consumers: [`next`](Self::next) takes `&mut self`.
/// Calling `next` after [`close`](Self::close) returns a read error.
pub struct Watcher<S: NamingStore> {
    service: String,
    prefix: String,
    store: S,
    mode: Mode,
    subscription: Option<EventStream>,
    /// First revision the next watch must replay from
    resume_revision: Option<i64>,
}

impl<S: NamingStore> std::fmt::Debug for Watcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("service", &self.service)
            .field("mode", &self.mode)
            .field("subscribed", &self.subscription.is_some())
            .field("resume_revision", &self.resume_revision)
            .finish()
    }
}

impl<S: NamingStore> Watcher<S> {
    pub(crate) fn new(service: String, store: S) -> Self {
        Self {
            prefix: service_prefix(&service),
            service,
            store,
            mode: Mode::SnapshotPending,
            subscription: None,
            resume_revision: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// True once the initial snapshot has been taken.
    pub fn is_initialized(&self) -> bool {
        self.mode == Mode::Streaming
    }

    /// Token that closes the store connection, unblocking a pending `next`.
    pub fn close_token(&self) -> CancellationToken {
        self.store.cancellation()
    }

    /// Next non-empty batch of membership updates.
    ///
    /// A failed snapshot read leaves the watcher uninitialized so the call can be
    /// retried. A failed or ended watch is dropped and reopened on the next call.
    pub async fn next(&mut self) -> Result<Vec<MembershipUpdate>> {
        if self.mode == Mode::SnapshotPending {
            let updates = self.snapshot().await?;
            self.mode = Mode::Streaming;
            if !updates.is_empty() {
                debug!(
                    service = %self.service,
                    count = updates.len(),
                    "Initial membership snapshot"
                );
                metrics::record_membership_update(
                    &self.service,
                    Operation::Add.as_str(),
                    updates.len(),
                );
                return Ok(updates);
            }
            debug!(service = %self.service, "Empty snapshot, watching for changes");
        }

        let events = match self.subscription.take() {
            Some(events) => events,
            None => self
                .store
                .watch(&self.prefix, self.resume_revision)
                .await
                .map_err(|e| self.read_error(e))?,
        };
        let events = self.subscription.insert(events);

        loop {
            let batch = match events.next().await {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    self.subscription = None;
                    if matches!(e, StoreError::WatchCanceled(_)) {
                        // Typically compaction; the old revision cannot be replayed
                        self.resume_revision = None;
                    }
                    return Err(self.read_error(e));
                }
                None => {
                    self.subscription = None;
                    let e = if self.store.cancellation().is_cancelled() {
                        StoreError::Closed
                    } else {
                        StoreError::StreamEnded
                    };
                    return Err(self.read_error(e));
                }
            };

            self.resume_revision = Some(batch.revision + 1);
            let updates = translate(&self.prefix, batch.events);
            if updates.is_empty() {
                continue;
            }
            for update in &updates {
                debug!(
                    service = %self.service,
                    op = update.op.as_str(),
                    address = %update.address,
                    "Membership changed"
                );
                metrics::record_membership_update(&self.service, update.op.as_str(), 1);
            }
            return Ok(updates);
        }
    }

    /// Drop the watch and close the store connection.
    pub fn close(&mut self) {
        self.subscription = None;
        self.store.close();
    }

    /// Adapt into a stream of batches that ends after the connection closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<MembershipUpdate>>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut watcher = state?;
            let result = watcher.next().await;
            let next_state = match &result {
                Err(e) if e.is_closed() => None,
                _ => Some(watcher),
            };
            Some((result, next_state))
        })
    }

    async fn snapshot(&mut self) -> Result<Vec<MembershipUpdate>> {
        let snapshot = self
            .store
            .list(&self.prefix)
            .await
            .map_err(|e| self.read_error(e))?;
        self.resume_revision = Some(snapshot.revision + 1);

        Ok(snapshot
            .kvs
            .into_iter()
            .filter_map(|kv| address_of(&self.prefix, &kv.key, kv.value))
            .map(MembershipUpdate::add)
            .collect())
    }

    fn read_error(&self, e: StoreError) -> NamingError {
        warn!(service = %self.service, error = %e, "Membership read failed");
        metrics::record_watch_error(&self.service);
        NamingError::Read(e)
    }
}

fn translate(prefix: &str, batch: Vec<WatchEvent>) -> Vec<MembershipUpdate> {
    batch
        .into_iter()
        .filter_map(|event| {
            let address = address_of(prefix, &event.key, event.value)?;
            Some(match event.kind {
                EventKind::Put => MembershipUpdate::add(address),
                EventKind::Delete => MembershipUpdate::remove(address),
            })
        })
        .collect()
}

/// The stored value, or the key suffix when the value is empty.
fn address_of(prefix: &str, key: &str, value: String) -> Option<String> {
    if !value.is_empty() {
        return Some(value);
    }
    match address_from_key(prefix, key) {
        Some(address) => Some(address.to_string()),
        None => {
            warn!(key = %key, "Ignoring key without an address");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        KeyValue, LeaseId, LeaseRenewer, MemoryStore, RenewalStream, Snapshot, WatchBatch,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Scripted store: `list` pops from `listings`, `watch` replays `batches`.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        listings: Arc<Mutex<Vec<Result<Snapshot, StoreError>>>>,
        batches: Arc<Mutex<Vec<Result<WatchBatch, StoreError>>>>,
        watch_starts: Arc<Mutex<Vec<Option<i64>>>>,
        cancel: CancellationToken,
    }

    impl ScriptedStore {
        fn listing(&self, revision: i64, kvs: Vec<KeyValue>) {
            self.listings
                .lock()
                .unwrap()
                .push(Ok(Snapshot { revision, kvs }));
        }

        fn batch(&self, revision: i64, events: Vec<WatchEvent>) {
            self.batches
                .lock()
                .unwrap()
                .push(Ok(WatchBatch { revision, events }));
        }

        fn watches_opened(&self) -> usize {
            self.watch_starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NamingStore for ScriptedStore {
        async fn grant(&mut self, _ttl_secs: i64) -> Result<LeaseId, StoreError> {
            Ok(1)
        }

        async fn put(&mut self, _key: &str, _value: &str, _lease: LeaseId) -> Result<(), StoreError> {
            Ok(())
        }

        async fn keep_alive(
            &mut self,
            lease: LeaseId,
        ) -> Result<(Box<dyn LeaseRenewer>, RenewalStream), StoreError> {
            Err(StoreError::LeaseNotFound(lease))
        }

        async fn revoke(&mut self, _lease: LeaseId) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list(&mut self, _prefix: &str) -> Result<Snapshot, StoreError> {
            self.listings.lock().unwrap().remove(0)
        }

        async fn watch(
            &mut self,
            _prefix: &str,
            start_revision: Option<i64>,
        ) -> Result<EventStream, StoreError> {
            self.watch_starts.lock().unwrap().push(start_revision);
            let batches: Vec<_> = self.batches.lock().unwrap().drain(..).collect();
            Ok(futures::stream::iter(batches).boxed())
        }

        fn cancellation(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }

    fn kv(addr: &str) -> KeyValue {
        KeyValue {
            key: format!("/etcd3_naming/pay/{}", addr),
            value: addr.to_string(),
        }
    }

    fn event(kind: EventKind, addr: &str, value: &str) -> WatchEvent {
        WatchEvent {
            kind,
            key: format!("/etcd3_naming/pay/{}", addr),
            value: value.to_string(),
            mod_revision: 0,
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_watch() {
        let store = ScriptedStore::default();
        store.listing(7, vec![kv("10.0.0.1:80"), kv("10.0.0.2:80")]);
        store.batch(9, vec![event(EventKind::Put, "10.0.0.3:80", "10.0.0.3:80")]);

        let mut watcher = Watcher::new("pay".to_string(), store.clone());
        assert!(!watcher.is_initialized());

        let first = watcher.next().await.unwrap();
        assert_eq!(
            first,
            vec![
                MembershipUpdate::add("10.0.0.1:80"),
                MembershipUpdate::add("10.0.0.2:80")
            ]
        );
        assert!(watcher.is_initialized());
        assert_eq!(store.watches_opened(), 0);

        let second = watcher.next().await.unwrap();
        assert_eq!(second, vec![MembershipUpdate::add("10.0.0.3:80")]);
        // The watch picks up right after the snapshot
        assert_eq!(*store.watch_starts.lock().unwrap(), vec![Some(8)]);
    }

    #[tokio::test]
    async fn test_failed_snapshot_stays_uninitialized() {
        let store = ScriptedStore::default();
        store.listings.lock().unwrap().push(Err(StoreError::Closed));
        store.listing(3, vec![kv("10.0.0.1:80")]);

        let mut watcher = Watcher::new("pay".to_string(), store);
        assert!(matches!(watcher.next().await, Err(NamingError::Read(_))));
        assert!(!watcher.is_initialized());

        let retry = watcher.next().await.unwrap();
        assert_eq!(retry, vec![MembershipUpdate::add("10.0.0.1:80")]);
    }

    #[tokio::test]
    async fn test_empty_snapshot_falls_through_to_watch() {
        let store = ScriptedStore::default();
        store.listing(1, vec![]);
        store.batch(2, vec![event(EventKind::Put, "10.0.0.9:80", "10.0.0.9:80")]);

        let mut watcher = Watcher::new("pay".to_string(), store);
        let first = watcher.next().await.unwrap();
        assert_eq!(first, vec![MembershipUpdate::add("10.0.0.9:80")]);
        assert!(watcher.is_initialized());
    }

    #[tokio::test]
    async fn test_batch_order_and_key_fallback() {
        let store = ScriptedStore::default();
        store.listing(1, vec![]);
        // Progress notification: no events, must not surface as an empty batch
        store.batch(1, vec![]);
        store.batch(
            3,
            vec![
                event(EventKind::Delete, "10.0.0.1:80", ""),
                event(EventKind::Put, "10.0.0.2:80", "10.0.0.2:80"),
            ],
        );

        let mut watcher = Watcher::new("pay".to_string(), store);
        let updates = watcher.next().await.unwrap();
        assert_eq!(
            updates,
            vec![
                MembershipUpdate::remove("10.0.0.1:80"),
                MembershipUpdate::add("10.0.0.2:80")
            ]
        );
    }

    #[tokio::test]
    async fn test_ended_stream_resumes_after_last_batch() {
        let store = ScriptedStore::default();
        store.listing(4, vec![]);
        store.batch(6, vec![event(EventKind::Put, "10.0.0.1:80", "10.0.0.1:80")]);

        let mut watcher = Watcher::new("pay".to_string(), store.clone());
        watcher.next().await.unwrap();
        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, NamingError::Read(StoreError::StreamEnded)));

        // The dead subscription is dropped and reopened from the next revision
        let _ = watcher.next().await;
        assert_eq!(*store.watch_starts.lock().unwrap(), vec![Some(5), Some(7)]);
    }

    #[tokio::test]
    async fn test_canceled_watch_restarts_from_head() {
        let store = ScriptedStore::default();
        store.listing(4, vec![]);
        store
            .batches
            .lock()
            .unwrap()
            .push(Err(StoreError::WatchCanceled("compacted".to_string())));

        let mut watcher = Watcher::new("pay".to_string(), store.clone());
        assert!(matches!(
            watcher.next().await,
            Err(NamingError::Read(StoreError::WatchCanceled(_)))
        ));

        let _ = watcher.next().await;
        assert_eq!(*store.watch_starts.lock().unwrap(), vec![Some(5), None]);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_next() {
        let store = MemoryStore::new();
        let mut watcher = Watcher::new("pay".to_string(), store.connect());
        let closer = watcher.close_token();

        let pending = tokio::spawn(async move { watcher.next().await });
        tokio::task::yield_now().await;
        closer.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ref e) if e.is_closed()));
    }

    #[tokio::test]
    async fn test_into_stream_ends_after_close() {
        let store = MemoryStore::new();
        let mut watcher = Watcher::new("pay".to_string(), store.connect());
        watcher.close();

        let items: Vec<_> = watcher.into_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_debug_skips_store() {
        let watcher = Watcher::new("pay".to_string(), ScriptedStore::default());
        let rendered = format!("{watcher:?}");
        assert!(rendered.contains("pay"));
        assert!(rendered.contains("SnapshotPending"));
    }

    #[test]
    fn test_update_serializes_lowercase() {
        let json = serde_json::to_string(&MembershipUpdate::remove("10.0.0.1:80")).unwrap();
        assert_eq!(json, r#"{"op":"remove","address":"10.0.0.1:80"}"#);
    }
}
