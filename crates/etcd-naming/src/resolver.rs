//! Service Resolver
//!
//! Builds a [`Watcher`] for one service name. Resolving only sets up the store
//! connection; the first read happens on `Watcher::next`.

use crate::config::NamingConfig;
use crate::error::{NamingError, Result};
use crate::store::{EtcdStore, NamingStore};
use crate::watcher::Watcher;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct Resolver {
    service: String,
    config: NamingConfig,
}

impl Resolver {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_config(service, NamingConfig::default())
    }

    pub fn with_config(service: impl Into<String>, config: NamingConfig) -> Self {
        Self {
            service: service.into(),
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Connect to the comma-separated etcd `target` and return a watcher.
    pub async fn resolve(&self, target: &str) -> Result<Watcher<EtcdStore>> {
        self.validate()?;
        let config = self.config.clone().with_target(target);
        let store = connect(&config).await?;
        Ok(self.watcher(store))
    }

    /// Return a watcher over an already-connected store.
    pub fn resolve_with<S: NamingStore>(&self, store: S) -> Result<Watcher<S>> {
        self.validate()?;
        Ok(self.watcher(store))
    }

    fn validate(&self) -> Result<()> {
        if self.service.is_empty() {
            return Err(NamingError::config("no service name provided"));
        }
        Ok(())
    }

    fn watcher<S: NamingStore>(&self, store: S) -> Watcher<S> {
        debug!(service = %self.service, "Resolved service watcher");
        Watcher::new(self.service.clone(), store)
    }
}

/// Connect an etcd store client for the configured endpoints.
pub async fn connect(config: &NamingConfig) -> Result<EtcdStore> {
    if config.endpoints.is_empty() {
        return Err(NamingError::config("no store endpoints provided"));
    }
    EtcdStore::connect(config).await.map_err(|e| {
        error!(error = %e, "Failed to create etcd client");
        NamingError::Connection(e)
    })
}
