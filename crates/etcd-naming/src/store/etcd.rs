//! Etcd Backend
//!
//! Connection with bounded exponential backoff, lease management, and prefix
//! watches over `etcd-client`.

use super::{
    EventKind, EventStream, KeyValue, LeaseId, LeaseRenewer, NamingStore, RenewalStream,
    Snapshot, WatchBatch, WatchEvent,
};
use crate::config::NamingConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeeper, PutOptions, WatchOptions,
    WatchResponse,
};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Etcd-backed [`NamingStore`]. Clones share one connection.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    cancel: CancellationToken,
}

impl EtcdStore {
    /// Connect to etcd, retrying until an endpoint answers or `config.dial_timeout` elapses.
    pub async fn connect(config: &NamingConfig) -> Result<Self, StoreError> {
        let endpoints = &config.endpoints;
        let dial_timeout = config.dial_timeout;

        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(dial_timeout),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };

        let client = retry(backoff, || async move {
            let attempt = tokio::time::timeout(dial_timeout, dial(endpoints, dial_timeout)).await;
            dial_outcome(attempt, dial_timeout).map_err(|e| {
                warn!(error = %e, "etcd connection failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await?;
        debug!(endpoints = ?endpoints, "Connected to etcd");

        Ok(Self {
            client,
            cancel: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

async fn dial(endpoints: &[String], dial_timeout: Duration) -> Result<Client, etcd_client::Error> {
    let options = ConnectOptions::new()
        .with_connect_timeout(dial_timeout)
        .with_keep_alive(Duration::from_secs(10), dial_timeout);
    let mut client = Client::connect(endpoints, Some(options)).await?;
    // Channels are lazy; a status round-trip proves some endpoint answers
    client.status().await?;
    Ok(client)
}

fn dial_outcome<T>(
    attempt: Result<Result<T, etcd_client::Error>, Elapsed>,
    dial_timeout: Duration,
) -> Result<T, StoreError> {
    match attempt {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(StoreError::Etcd(e)),
        Err(_) => Err(StoreError::DialTimeout(dial_timeout)),
    }
}

struct EtcdRenewer {
    keeper: LeaseKeeper,
}

#[async_trait]
impl LeaseRenewer for EtcdRenewer {
    async fn renew(&mut self) -> Result<(), StoreError> {
        self.keeper.keep_alive().await?;
        Ok(())
    }
}

fn utf8<'a>(bytes: &'a [u8], field: &'static str) -> Result<&'a str, StoreError> {
    std::str::from_utf8(bytes).map_err(|_| StoreError::InvalidUtf8 { field })
}

/// Build a [`WatchEvent`]. Deletes take their value from the previous key-value.
fn map_event(
    kind: EventType,
    key: &[u8],
    value: &[u8],
    prev_value: Option<&[u8]>,
    mod_revision: i64,
) -> Result<WatchEvent, StoreError> {
    let (kind, value) = match kind {
        EventType::Put => (EventKind::Put, value),
        EventType::Delete => (EventKind::Delete, prev_value.unwrap_or_default()),
    };
    Ok(WatchEvent {
        kind,
        key: utf8(key, "key")?.to_string(),
        value: utf8(value, "value")?.to_string(),
        mod_revision,
    })
}

/// A catch-up response may be split, and its header then carries the store's
/// current revision, not the last one delivered.
fn batch_revision(header_revision: Option<i64>, events: &[WatchEvent]) -> i64 {
    events
        .last()
        .map(|e| e.mod_revision)
        .or(header_revision)
        .unwrap_or_default()
}

fn watch_canceled(reason: &str) -> StoreError {
    if reason.is_empty() {
        StoreError::WatchCanceled("canceled by server".to_string())
    } else {
        StoreError::WatchCanceled(reason.to_string())
    }
}

fn response_batch(resp: &WatchResponse) -> Result<WatchBatch, StoreError> {
    if resp.canceled() {
        return Err(watch_canceled(resp.cancel_reason()));
    }

    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        events.push(map_event(
            event.event_type(),
            kv.key(),
            kv.value(),
            event.prev_kv().map(|prev| prev.value()),
            kv.mod_revision(),
        )?);
    }
    let revision = batch_revision(resp.header().map(|h| h.revision()), &events);
    Ok(WatchBatch { revision, events })
}

#[async_trait]
impl NamingStore for EtcdStore {
    async fn grant(&mut self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.ensure_open()?;
        let resp = self.client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn put(&mut self, key: &str, value: &str, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        let options = PutOptions::new().with_lease(lease);
        self.client.put(key, value, Some(options)).await?;
        Ok(())
    }

    async fn keep_alive(
        &mut self,
        lease: LeaseId,
    ) -> Result<(Box<dyn LeaseRenewer>, RenewalStream), StoreError> {
        self.ensure_open()?;
        let (keeper, stream) = self.client.lease_keep_alive(lease).await?;

        let acks = futures::stream::unfold(stream, |mut stream| async move {
            match stream.message().await {
                Ok(Some(resp)) => Some((Ok(resp.ttl()), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(StoreError::from(e)), stream)),
            }
        })
        .take_until(self.cancel.clone().cancelled_owned())
        .boxed();

        Ok((Box::new(EtcdRenewer { keeper }), acks))
    }

    async fn revoke(&mut self, lease: LeaseId) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn list(&mut self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.ensure_open()?;
        let resp = self
            .client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            kvs.push(KeyValue {
                key: utf8(kv.key(), "key")?.to_string(),
                value: utf8(kv.value(), "value")?.to_string(),
            });
        }
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(Snapshot { revision, kvs })
    }

    async fn watch(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<EventStream, StoreError> {
        self.ensure_open()?;
        let mut options = WatchOptions::new().with_prefix().with_prev_key();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, stream) = self.client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, start_revision = ?start_revision, "Watch stream established");

        // The watcher handle lives as long as the stream so the watch stays registered
        let state = (watcher, stream);
        let batches = futures::stream::unfold(state, |(watcher, mut stream)| async move {
            let item = match stream.message().await {
                Ok(Some(resp)) => response_batch(&resp),
                Ok(None) => return None,
                Err(e) => Err(StoreError::from(e)),
            };
            Some((item, (watcher, stream)))
        })
        .take_until(self.cancel.clone().cancelled_owned())
        .boxed();

        Ok(batches)
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
