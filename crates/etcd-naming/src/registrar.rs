//! Service Registration
//!
//! Publishes `/<PREFIX>/<service>/<host:port>` bound to a lease and keeps the
//! lease alive from a background task until shutdown is requested.
//!
//! The task waits on four sources at once:
//! 1. Heartbeat tick: send one keep-alive request
//! 2. Acknowledgement: drain the renewal stream so its buffer never fills
//! 3. Shutdown request: revoke the lease and stop
//! 4. Connection cancellation: stop without revoking
//!
//! Process signals are not handled here. The embedding process decides when to
//! fire [`Registration::shutdown_token`].

use crate::config::{default_keepalive_interval, NamingConfig};
use crate::error::{NamingError, Result};
use crate::key::ServiceKey;
use crate::metrics;
use crate::store::{EtcdStore, LeaseId, LeaseRenewer, NamingStore, RenewalStream};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// What to register and how to keep it alive
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub service: String,
    pub host: String,
    pub port: u16,
    /// Lease TTL in seconds
    pub ttl_secs: i64,
    /// Heartbeat interval; `None` uses a third of the TTL
    pub keepalive_interval: Option<Duration>,
    /// Upper bound on the revoke issued at shutdown
    pub revoke_timeout: Duration,
}

impl RegistrationConfig {
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
            port,
            ttl_secs: 10,
            keepalive_interval: None,
            revoke_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn with_revoke_timeout(mut self, timeout: Duration) -> Self {
        self.revoke_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            return Err(NamingError::config("no service name provided"));
        }
        if self.host.is_empty() {
            return Err(NamingError::config("no host provided"));
        }
        if self.ttl_secs < 1 {
            return Err(NamingError::config(format!(
                "lease ttl must be at least 1s, got {}",
                self.ttl_secs
            )));
        }
        let interval = self.interval();
        if interval.is_zero() || interval >= Duration::from_secs(self.ttl_secs as u64) {
            return Err(NamingError::config(format!(
                "keep-alive interval {:?} must be non-zero and shorter than the {}s ttl",
                interval, self.ttl_secs
            )));
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.keepalive_interval
            .unwrap_or_else(|| default_keepalive_interval(self.ttl_secs))
    }
}

/// Why the keep-alive task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveExit {
    /// Shutdown was requested; `revoked` is false when the best-effort revoke failed
    Shutdown { revoked: bool },
    /// The store connection was torn down
    ConnectionClosed,
    /// Renewal failed or the store reported the lease gone
    LeaseLost,
}

/// Lifecycle handle for one live registration.
///
/// Dropping the handle leaves the keep-alive task running for the rest of the
/// process; call [`shutdown`](Self::shutdown) to revoke.
#[derive(Debug)]
pub struct Registration {
    key: ServiceKey,
    lease_id: LeaseId,
    shutdown: CancellationToken,
    task: JoinHandle<KeepAliveExit>,
}

impl Registration {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn address(&self) -> &str {
        self.key.address()
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Token that requests revoke-and-stop when cancelled.
    ///
    /// Hand this to a signal listener or another lifecycle manager.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown and wait for the revoke to finish.
    pub async fn shutdown(self) -> KeepAliveExit {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for the keep-alive task to stop on its own or via the shutdown token.
    pub async fn wait(self) -> KeepAliveExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(lease_id = self.lease_id, error = %e, "Keep-alive task failed");
                KeepAliveExit::LeaseLost
            }
        }
    }
}

/// Connect to etcd and register one instance.
pub async fn register(naming: &NamingConfig, config: RegistrationConfig) -> Result<Registration> {
    if naming.endpoints.is_empty() {
        return Err(NamingError::config("no store endpoints provided"));
    }
    config.validate()?;

    let store = EtcdStore::connect(naming).await.map_err(|e| {
        error!(error = %e, "Failed to create etcd client");
        NamingError::Connection(e)
    })?;
    register_with(store, config).await
}

/// Register one instance against an already-connected store.
///
/// The store handle is owned by the registration from here on.
pub async fn register_with<S: NamingStore>(
    mut store: S,
    config: RegistrationConfig,
) -> Result<Registration> {
    config.validate()?;
    let key = ServiceKey::new(config.service.clone(), &config.host, config.port);
    let key_str = key.to_string();

    let lease_id = store.grant(config.ttl_secs).await.map_err(|e| {
        error!(error = %e, ttl = config.ttl_secs, "Lease grant failed");
        NamingError::Lease(e)
    })?;
    debug!(lease_id = lease_id, ttl = config.ttl_secs, "Lease granted");

    // On failure the lease stays granted but unattached and expires on its own
    store
        .put(&key_str, key.address(), lease_id)
        .await
        .map_err(|e| {
            error!(key = %key_str, error = %e, "Failed to publish service key");
            NamingError::Write(e)
        })?;

    let (renewer, acks) = store.keep_alive(lease_id).await.map_err(|e| {
        error!(lease_id = lease_id, error = %e, "Failed to open keep-alive stream");
        NamingError::Lease(e)
    })?;

    metrics::record_registered(&config.service);
    info!(
        service = %config.service,
        key = %key_str,
        lease_id = lease_id,
        ttl = config.ttl_secs,
        "Service registered"
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(keepalive_loop(
        store,
        renewer,
        acks,
        KeepAliveParams {
            lease_id,
            service: config.service.clone(),
            interval: config.interval(),
            revoke_timeout: config.revoke_timeout,
        },
        shutdown.clone(),
    ));

    Ok(Registration {
        key,
        lease_id,
        shutdown,
        task,
    })
}

/// Revoke a lease, deleting every key bound to it.
///
/// Revoking an expired or already revoked lease returns a lease error.
pub async fn revoke<S: NamingStore>(store: &mut S, lease_id: LeaseId) -> Result<()> {
    store.revoke(lease_id).await.map_err(|e| {
        warn!(lease_id = lease_id, error = %e, "Revoke failed");
        NamingError::Lease(e)
    })?;
    debug!(lease_id = lease_id, "Lease revoked");
    Ok(())
}

struct KeepAliveParams {
    lease_id: LeaseId,
    service: String,
    interval: Duration,
    revoke_timeout: Duration,
}

async fn keepalive_loop<S: NamingStore>(
    mut store: S,
    mut renewer: Box<dyn LeaseRenewer>,
    mut acks: RenewalStream,
    params: KeepAliveParams,
    shutdown: CancellationToken,
) -> KeepAliveExit {
    let lease_id = params.lease_id;
    let closed = store.cancellation();

    let mut ticker = tokio::time::interval(params.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip first immediate tick

    let exit = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(lease_id = lease_id, "Shutdown requested, revoking lease");
                let revoked =
                    match tokio::time::timeout(params.revoke_timeout, revoke(&mut store, lease_id)).await {
                        Ok(result) => result.is_ok(),
                        Err(_) => {
                            warn!(lease_id = lease_id, "Revoke timed out");
                            false
                        }
                    };
                break KeepAliveExit::Shutdown { revoked };
            }

            _ = closed.cancelled() => {
                info!(lease_id = lease_id, "Store connection closed, keep-alive stopped");
                break KeepAliveExit::ConnectionClosed;
            }

            ack = acks.next() => match ack {
                Some(Ok(ttl)) if ttl > 0 => {
                    trace!(lease_id = lease_id, ttl = ttl, "Keep-alive OK");
                    metrics::record_keepalive_ack();
                }
                Some(Ok(_)) => {
                    error!(lease_id = lease_id, "Lease expired before renewal");
                    break KeepAliveExit::LeaseLost;
                }
                Some(Err(e)) => {
                    error!(lease_id = lease_id, error = %e, "Keep-alive failed");
                    break KeepAliveExit::LeaseLost;
                }
                None if closed.is_cancelled() => {
                    break KeepAliveExit::ConnectionClosed;
                }
                None => {
                    error!(lease_id = lease_id, "Keep-alive stream closed");
                    break KeepAliveExit::LeaseLost;
                }
            },

            _ = ticker.tick() => {
                if let Err(e) = renewer.renew().await {
                    if closed.is_cancelled() {
                        break KeepAliveExit::ConnectionClosed;
                    }
                    error!(lease_id = lease_id, error = %e, "Keep-alive send failed");
                    break KeepAliveExit::LeaseLost;
                }
            }
        }
    };

    metrics::record_lease_released();
    if exit == KeepAliveExit::LeaseLost {
        metrics::record_lease_lost(&params.service);
    }
    exit
}
