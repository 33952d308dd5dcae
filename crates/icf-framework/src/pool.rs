//! Connector instance pool
//!
//! Each facade owns one pool of connector instances built from the same
//! configuration. A checkout holds one instance exclusively until the
//! returned [`PooledConnector`] is dropped; the number of live instances is
//! bounded by a semaphore. Connectors whose factory reports
//! `concurrent_safe` share a single instance instead.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use icf_connector::{
    Configuration, Connector, ConnectorError, ConnectorFactory, ConnectorKey, ConnectorResult,
    PoolConfig,
};

struct IdleConnector {
    connector: Arc<dyn Connector>,
    since: Instant,
}

/// Pool usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatistics {
    /// Instances currently checked out.
    pub num_active: usize,
    /// Instances waiting in the idle queue.
    pub num_idle: usize,
}

/// Pool of connector instances for one configuration.
pub struct ConnectorPool {
    key: ConnectorKey,
    factory: Arc<dyn ConnectorFactory>,
    configuration: Configuration,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnector>>,
    shared: OnceCell<Arc<dyn Connector>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectorPool {
    /// Create an empty pool. Instances are built on first checkout.
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        configuration: Configuration,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: factory.key(),
            permits: Arc::new(Semaphore::new(config.max_objects.max(1))),
            factory,
            configuration,
            config,
            idle: Mutex::new(VecDeque::new()),
            shared: OnceCell::new(),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check if instances are shared instead of pooled.
    pub fn is_shared(&self) -> bool {
        self.factory.concurrent_safe()
    }

    /// Take an instance for exclusive use.
    ///
    /// Waits at most `max_wait` for a free slot. Idle instances are reused
    /// most recent first, after they pass `check_alive`; otherwise a new
    /// instance is built.
    pub async fn checkout(self: &Arc<Self>) -> ConnectorResult<PooledConnector> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectorError::internal("connector pool disposed"));
        }

        if self.is_shared() {
            let connector = self
                .shared
                .get_or_try_init(|| self.create_instance())
                .await?
                .clone();
            self.active.fetch_add(1, Ordering::AcqRel);
            return Ok(PooledConnector {
                connector,
                pool: self.clone(),
                _permit: None,
            });
        }

        let max_wait = self.config.max_wait();
        let permit = match tokio::time::timeout(max_wait, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ConnectorError::internal("connector pool disposed")),
            Err(_) => {
                warn!(
                    connector = %self.key,
                    max_objects = self.config.max_objects,
                    wait_ms = self.config.max_wait_ms,
                    "No connector instance available"
                );
                return Err(ConnectorError::TargetUnavailable {
                    message: format!(
                        "no connector instance available within {} ms",
                        self.config.max_wait_ms
                    ),
                });
            }
        };

        let connector = loop {
            let candidate = self.idle.lock().pop_back();
            match candidate {
                Some(idle) => match idle.connector.check_alive().await {
                    Ok(()) => break idle.connector,
                    Err(e) => {
                        debug!(connector = %self.key, error = %e, "Discarding dead instance");
                        idle.connector.dispose().await;
                    }
                },
                None => break self.create_instance().await?,
            }
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        trace!(connector = %self.key, "Instance checked out");
        Ok(PooledConnector {
            connector,
            pool: self.clone(),
            _permit: Some(permit),
        })
    }

    /// Current usage.
    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            num_active: self.active.load(Ordering::Acquire),
            num_idle: self.idle.lock().len(),
        }
    }

    /// Dispose idle instances unused for `min_evictable_idle`, keeping at
    /// least `min_idle` of them.
    ///
    /// Returns the number of instances disposed.
    pub async fn evict_idle(&self) -> usize {
        let threshold = self.config.min_evictable_idle();
        let evicted: Vec<IdleConnector> = {
            let mut idle = self.idle.lock();
            let mut evicted = Vec::new();
            while idle.len() > self.config.min_idle {
                match idle.front() {
                    Some(oldest) if oldest.since.elapsed() >= threshold => {
                        if let Some(entry) = idle.pop_front() {
                            evicted.push(entry);
                        }
                    }
                    _ => break,
                }
            }
            evicted
        };

        let count = evicted.len();
        for entry in evicted {
            entry.connector.dispose().await;
        }
        if count > 0 {
            debug!(connector = %self.key, evicted = count, "Evicted idle instances");
        }
        count
    }

    /// Dispose every idle instance and refuse further checkouts.
    ///
    /// Instances still checked out are disposed when returned.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle: Vec<IdleConnector> = self.idle.lock().drain(..).collect();
        for entry in idle {
            entry.connector.dispose().await;
        }
        if let Some(shared) = self.shared.get() {
            shared.dispose().await;
        }
        debug!(connector = %self.key, "Connector pool disposed");
    }

    async fn create_instance(&self) -> ConnectorResult<Arc<dyn Connector>> {
        let connector = self.factory.create(self.configuration.clone()).await?;
        debug!(connector = %self.key, "Connector instance created");
        Ok(connector)
    }

    fn checkin(&self, connector: Arc<dyn Connector>) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if self.is_shared() {
            return;
        }

        let rejected = {
            let mut idle = self.idle.lock();
            if self.closed.load(Ordering::Acquire) || idle.len() >= self.config.max_idle {
                Some(connector)
            } else {
                idle.push_back(IdleConnector {
                    connector,
                    since: Instant::now(),
                });
                None
            }
        };

        if let Some(connector) = rejected {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { connector.dispose().await });
                }
                Err(_) => debug!(connector = %self.key, "No runtime, instance dropped undisposed"),
            }
        }
    }
}

impl fmt::Debug for ConnectorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorPool")
            .field("connector", &self.key)
            .field("statistics", &self.statistics())
            .finish()
    }
}

/// A checked-out connector instance, returned to its pool on drop.
pub struct PooledConnector {
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectorPool>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnector {
    /// Handle on the instance for the duration of the checkout.
    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        self.pool.checkin(self.connector.clone());
    }
}

impl fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnector")
            .field("connector", &self.pool.key)
            .finish()
    }
}
