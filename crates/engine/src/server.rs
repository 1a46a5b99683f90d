use std::sync::Arc;

use groupsync_core::{
    AccountDelegate, Authenticator, CloudStorage, PushNotificationService, ResolverRegistry, SyncConfig,
};
use groupsync_storage::SqliteStore;

use crate::envelope::Envelope;
use crate::error::SyncError;
use crate::metrics::Metrics;
use crate::transaction::{Endpoint, RequestHeader, RequestTransaction};
use crate::uploader::{PeriodicUploader, Uploader};

/// External collaborators the server drives.
#[derive(Clone)]
pub struct Services {
    pub cloud_storage: Arc<dyn CloudStorage>,
    pub authenticator: Arc<dyn Authenticator>,
    pub account_delegate: Arc<dyn AccountDelegate>,
    pub push: Arc<dyn PushNotificationService>,
}

/// Entry point for client requests. Holds no per-request state; each request
/// opens its own connection and transaction, so one server may be shared by
/// any number of threads.
pub struct SyncServer {
    config: SyncConfig,
    store: SqliteStore,
    services: Services,
    resolvers: Arc<ResolverRegistry>,
    metrics: Arc<Metrics>,
}

impl SyncServer {
    pub fn new(config: SyncConfig, store: SqliteStore, services: Services, resolvers: ResolverRegistry) -> Self {
        Self {
            config,
            store,
            services,
            resolvers: Arc::new(resolvers),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Opens the store named by `config` and builds a server on it.
    pub fn open(config: SyncConfig, services: Services, resolvers: ResolverRegistry) -> Result<Self, SyncError> {
        let store = SqliteStore::open(&config)?;
        Ok(Self::new(config, store, services, resolvers))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Runs `endpoint` inside a request transaction.
    pub fn handle<E: Endpoint>(&self, header: &RequestHeader, endpoint: &E) -> Result<E::Output, SyncError> {
        RequestTransaction::new(self).run(header, endpoint)
    }

    /// Like `handle`, wrapped in the response envelope.
    pub fn respond<E: Endpoint>(&self, header: &RequestHeader, endpoint: &E) -> Envelope<E::Output> {
        Envelope::from_result(self.handle(header, endpoint))
    }

    pub fn uploader(&self) -> Uploader {
        Uploader::new(
            self.store.clone(),
            self.services.cloud_storage.clone(),
            self.resolvers.clone(),
            self.metrics.clone(),
        )
        .with_retention(self.config.deferred_retention_secs)
    }

    /// Starts the background Uploader at the configured interval.
    pub fn spawn_uploader(&self) -> Result<PeriodicUploader, SyncError> {
        PeriodicUploader::spawn(self.uploader(), self.config.uploader_interval())
    }
}
