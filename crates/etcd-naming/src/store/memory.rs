//! In-memory Store
//!
//! A single-process stand-in for etcd with the lease semantics the naming layer
//! relies on: keys die with their lease, expiry and revoke emit delete events,
//! and keep-alive acknowledgements go through a bounded buffer. A heartbeat sent
//! while that buffer is full is dropped without refreshing the lease, which is
//! how an undrained etcd keep-alive channel behaves.
//!
//! Replay history is bounded ([`DEFAULT_HISTORY_LIMIT`] revisions); a watch
//! starting below the retained history is canceled like a compacted etcd watch.
//!
//! `MemoryStore::new()` creates the store and a first connection. Clones share
//! the connection; [`MemoryStore::connect`] opens another one against the same data.

use super::{
    EventKind, EventStream, KeyValue, LeaseId, LeaseRenewer, NamingStore, RenewalStream,
    Snapshot, WatchBatch, WatchEvent,
};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default capacity of a keep-alive acknowledgement buffer
pub const DEFAULT_ACK_CAPACITY: usize = 16;

/// Default number of revisions kept for watch replay
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Entry {
    value: String,
    lease: LeaseId,
}

type BatchSender = mpsc::UnboundedSender<Result<WatchBatch, StoreError>>;

#[derive(Default)]
struct Inner {
    next_lease: LeaseId,
    revision: i64,
    leases: HashMap<LeaseId, Lease>,
    kvs: BTreeMap<String, Entry>,
    /// Recent committed changes, one entry per revision
    history: VecDeque<WatchBatch>,
    history_limit: usize,
    /// Watches starting below this revision cannot be replayed
    compacted: i64,
    watchers: Vec<(String, BatchSender)>,
}

fn matching(batch: &WatchBatch, prefix: &str) -> Option<WatchBatch> {
    let events: Vec<WatchEvent> = batch
        .events
        .iter()
        .filter(|e| e.key.starts_with(prefix))
        .cloned()
        .collect();
    if events.is_empty() {
        return None;
    }
    Some(WatchBatch {
        revision: batch.revision,
        events,
    })
}

impl Inner {
    /// Commit a change at the next revision and fan it out to watchers.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        let events = events
            .into_iter()
            .map(|event| WatchEvent {
                mod_revision: revision,
                ..event
            })
            .collect();
        let batch = WatchBatch { revision, events };
        self.watchers.retain(|(prefix, tx)| match matching(&batch, prefix) {
            Some(batch) => tx.send(Ok(batch)).is_ok(),
            None => !tx.is_closed(),
        });

        self.history.push_back(batch);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision + 1;
            }
        }
    }

    fn compact(&mut self, revision: i64) {
        let revision = revision.min(self.revision + 1);
        while self
            .history
            .front()
            .is_some_and(|batch| batch.revision < revision)
        {
            self.history.pop_front();
        }
        self.compacted = self.compacted.max(revision);
    }

    /// Remove a lease and every key bound to it.
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            if let Some(entry) = self.kvs.remove(&key) {
                events.push(WatchEvent {
                    kind: EventKind::Delete,
                    key,
                    value: entry.value,
                    mod_revision: 0,
                });
            }
        }
        self.commit(events);
        true
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
    ack_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_ack_capacity(DEFAULT_ACK_CAPACITY)
    }

    pub fn with_ack_capacity(ack_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_lease: 1,
                revision: 1,
                history_limit: DEFAULT_HISTORY_LIMIT,
                ..Default::default()
            })),
            cancel: CancellationToken::new(),
            ack_capacity: ack_capacity.max(1),
        }
    }

    /// Keep at most `limit` revisions for watch replay; older ones are compacted away.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.lock().history_limit = limit.max(1);
        self
    }

    /// Discard history below `revision`. Watches asking to start earlier are
    /// canceled, as etcd cancels watches on compacted revisions.
    pub fn compact(&self, revision: i64) {
        self.lock().compact(revision);
    }

    /// Open a new connection to the same data.
    pub fn connect(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel: CancellationToken::new(),
            ack_capacity: self.ack_capacity,
        }
    }

    /// Current value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().kvs.get(key).map(|e| e.value.clone())
    }

    pub fn is_lease_alive(&self, lease: LeaseId) -> bool {
        self.lock().leases.contains_key(&lease)
    }

    /// End every open watch stream, as a lost server connection would.
    pub fn drop_watches(&self) {
        self.lock().watchers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic, so a poisoned lock still holds consistent data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn spawn_reaper(&self, id: LeaseId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    match guard.leases.get(&id) {
                        Some(lease) => lease.deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                let due = match guard.leases.get(&id) {
                    Some(lease) => lease.deadline <= Instant::now(),
                    None => return,
                };
                if due {
                    debug!(lease_id = id, "Lease expired");
                    guard.drop_lease(id);
                    return;
                }
            }
        });
    }
}

struct MemoryRenewer {
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
    lease: LeaseId,
    acks: mpsc::Sender<Result<i64, StoreError>>,
}

#[async_trait]
impl LeaseRenewer for MemoryRenewer {
    async fn renew(&mut self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        if self.acks.capacity() == 0 {
            trace!(lease_id = self.lease, "Ack buffer full, heartbeat dropped");
            return Ok(());
        }

        let ttl = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match guard.leases.get_mut(&self.lease) {
                Some(lease) => {
                    lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
                    lease.ttl
                }
                // etcd answers a heartbeat for an unknown lease with TTL 0
                None => 0,
            }
        };

        if self.acks.try_send(Ok(ttl)).is_err() {
            trace!(lease_id = self.lease, "Ack receiver gone");
        }
        Ok(())
    }
}

#[async_trait]
impl NamingStore for MemoryStore {
    async fn grant(&mut self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.ensure_open()?;
        let ttl = ttl_secs.max(1);
        let id = {
            let mut guard = self.lock();
            let id = guard.next_lease;
            guard.next_lease += 1;
            guard.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + Duration::from_secs(ttl as u64),
                    keys: HashSet::new(),
                },
            );
            id
        };
        self.spawn_reaper(id);
        Ok(id)
    }

    async fn put(&mut self, key: &str, value: &str, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut guard = self.lock();
        if !guard.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }

        let previous = guard.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        if let Some(previous) = previous {
            if previous.lease != lease {
                if let Some(old) = guard.leases.get_mut(&previous.lease) {
                    old.keys.remove(key);
                }
            }
        }
        if let Some(owner) = guard.leases.get_mut(&lease) {
            owner.keys.insert(key.to_string());
        }

        guard.commit(vec![WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: 0,
        }]);
        Ok(())
    }

    async fn keep_alive(
        &mut self,
        lease: LeaseId,
    ) -> Result<(Box<dyn LeaseRenewer>, RenewalStream), StoreError> {
        self.ensure_open()?;
        if !self.is_lease_alive(lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }

        let (tx, mut rx) = mpsc::channel(self.ack_capacity);
        let renewer = MemoryRenewer {
            inner: self.inner.clone(),
            cancel: self.cancel.clone(),
            lease,
            acks: tx,
        };
        let acks = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
            .take_until(self.cancel.clone().cancelled_owned())
            .boxed();
        Ok((Box::new(renewer), acks))
    }

    async fn revoke(&mut self, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.lock().drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn list(&mut self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.ensure_open()?;
        let guard = self.lock();
        let kvs = guard
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(Snapshot {
            revision: guard.revision,
            kvs,
        })
    }

    async fn watch(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<EventStream, StoreError> {
        self.ensure_open()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.lock();
            if let Some(start) = start_revision {
                if start < guard.compacted {
                    let reason = format!(
                        "required revision {} has been compacted at {}",
                        start, guard.compacted
                    );
                    let canceled = Err(StoreError::WatchCanceled(reason));
                    return Ok(futures::stream::iter([canceled]).boxed());
                }
                for batch in guard.history.iter().filter(|b| b.revision >= start) {
                    if let Some(batch) = matching(batch, prefix) {
                        let _ = tx.send(Ok(batch));
                    }
                }
            }
            guard.watchers.push((prefix.to_string(), tx));
        }

        let batches = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
            .take_until(self.cancel.clone().cancelled_owned())
            .boxed();
        Ok(batches)
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
