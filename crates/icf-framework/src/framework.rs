//! Framework service object
//!
//! [`ConnectorFramework`] is built once per process. It owns the connector
//! registry, the facade cache, the batch engine and the connector server,
//! runs the maintenance loop and tears everything down on shutdown.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use icf_connector::{ApiConfiguration, ConnectorError, ConnectorFactory, ConnectorResult};

use crate::batch::BatchEngine;
use crate::cache::FacadeCache;
use crate::config::{ConfigError, FrameworkConfig};
use crate::facade::LocalConnectorFacade;
use crate::registry::ConnectorRegistry;
use crate::remote::{ConnectorServer, OperationDispatcher};

/// What one maintenance pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted_facades: usize,
    pub evicted_instances: usize,
    pub expired_batches: usize,
    pub lost_requests: usize,
    pub closed_sessions: usize,
}

impl MaintenanceReport {
    /// Check if the pass changed anything.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The connector framework of one process.
pub struct ConnectorFramework {
    config: FrameworkConfig,
    registry: Arc<ConnectorRegistry>,
    engine: Arc<BatchEngine>,
    cache: Arc<FacadeCache>,
    server: Arc<ConnectorServer>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectorFramework {
    /// Build the framework from a validated configuration.
    pub fn new(config: FrameworkConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(ConnectorRegistry::new());
        let engine = Arc::new(BatchEngine::new(config.batch.clone()));
        let cache = Arc::new(FacadeCache::new(registry.clone(), engine.clone()));
        let dispatcher = Arc::new(OperationDispatcher::new(cache.clone()));
        let server = Arc::new(ConnectorServer::new(
            config.server.clone(),
            config.distributor.clone(),
            dispatcher,
            registry.clone(),
        ));

        Ok(Self {
            config,
            registry,
            engine,
            cache,
            server,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<FacadeCache> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<BatchEngine> {
        &self.engine
    }

    pub fn server(&self) -> &Arc<ConnectorServer> {
        &self.server
    }

    /// Install a connector.
    pub fn register(&self, factory: Arc<dyn ConnectorFactory>) {
        if let Some(previous) = self.registry.register(factory) {
            debug!(connector = %previous.key(), "Connector factory replaced");
        }
    }

    /// Get the shared local facade for `api`.
    pub async fn new_instance(
        &self,
        api: &ApiConfiguration,
    ) -> ConnectorResult<Arc<LocalConnectorFacade>> {
        self.cache.new_instance(api).await
    }

    /// Start serving remote clients. Returns the bound address.
    pub async fn start_server(&self) -> ConnectorResult<SocketAddr> {
        let listener = self.server.bind().await?;
        let addr = listener.local_addr().map_err(|e| {
            ConnectorError::connection_failed_with_source("listener has no local address", e)
        })?;
        let handle = tokio::spawn(self.server.clone().serve(listener));
        self.tasks.lock().push(handle);
        info!(addr = %addr, "Connector server started");
        Ok(addr)
    }

    /// Start the background maintenance loop.
    ///
    /// Runs every cache sweep interval, or every heartbeat when that is
    /// shorter, until [`shutdown`](Self::shutdown).
    pub fn start_maintenance(self: &Arc<Self>) {
        let period = self
            .config
            .cache
            .sweep_interval()
            .min(self.config.distributor.heartbeat());
        let this = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(framework) = this.upgrade() else {
                    break;
                };
                let report = framework.run_maintenance_once().await;
                if !report.is_empty() {
                    debug!(?report, "Maintenance pass");
                }
            }
        });
        self.tasks.lock().push(handle);
        info!(period_ms = period.as_millis() as u64, "Maintenance loop started");
    }

    /// Run one maintenance pass.
    ///
    /// Evicts idle facades and pooled instances, expires uncollected
    /// batches, reconciles requests with every session and closes sessions
    /// disconnected for two heartbeats.
    #[instrument(skip(self))]
    pub async fn run_maintenance_once(&self) -> MaintenanceReport {
        let evicted_facades = self
            .cache
            .evict_idle(self.config.cache.idle_timeout())
            .await;
        let evicted_instances = self.cache.evict_pools().await;
        let expired_batches = self.engine.expire();
        let sessions = self
            .server
            .maintain_sessions(self.config.distributor.heartbeat() * 2)
            .await;

        MaintenanceReport {
            evicted_facades,
            evicted_instances,
            expired_batches,
            lost_requests: sessions.lost_requests,
            closed_sessions: sessions.closed_sessions,
        }
    }

    /// Stop background work, close sessions and dispose every facade.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.server.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.engine.shutdown();
        self.cache.dispose().await;
        info!("Connector framework shut down");
    }
}

impl std::fmt::Debug for ConnectorFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorFramework")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("engine", &self.engine)
            .field("server", &self.server)
            .finish()
    }
}
