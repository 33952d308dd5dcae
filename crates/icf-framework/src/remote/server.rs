//! Connector server
//!
//! Accepts connections, checks the client's key during the handshake and
//! runs each client session in its own connection group, sharing one
//! [`OperationDispatcher`].

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use icf_connector::{ConnectorError, ConnectorResult};
use icf_rpc::{ConnectionContext, ConnectionGroup, Frame, JsonFrameConnection, OperationalState};

use crate::config::{DistributorConfig, ServerConfig};
use crate::registry::ConnectorRegistry;
use crate::remote::dispatcher::OperationDispatcher;
use crate::remote::messages::{HelloMessage, RemoteMessage};

type Session = Arc<ConnectionGroup<RemoteMessage>>;

/// Sessions found dead or idle by [`ConnectorServer::maintain_sessions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Requests dropped after the peer stopped tracking them.
    pub lost_requests: usize,
    /// Sessions closed for being disconnected too long.
    pub closed_sessions: usize,
}

/// Server side of the remote connector protocol.
pub struct ConnectorServer {
    config: ServerConfig,
    distributor_config: DistributorConfig,
    dispatcher: Arc<OperationDispatcher>,
    registry: Arc<ConnectorRegistry>,
    start_time: DateTime<Utc>,
    sessions: DashMap<Uuid, Session>,
    shutdown: CancellationToken,
}

impl ConnectorServer {
    pub fn new(
        config: ServerConfig,
        distributor_config: DistributorConfig,
        dispatcher: Arc<OperationDispatcher>,
        registry: Arc<ConnectorRegistry>,
    ) -> Self {
        Self {
            config,
            distributor_config,
            dispatcher,
            registry,
            start_time: Utc::now(),
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Number of known client sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the connection group of a session.
    pub fn session(&self, id: Uuid) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Run the handshake on a new connection and join it to its session.
    ///
    /// A connection presenting a wrong key is told so and closed.
    pub async fn accept_connection(
        &self,
        connection: Arc<dyn ConnectionContext<RemoteMessage>>,
    ) -> ConnectorResult<Uuid> {
        let limit = self.distributor_config.request_timeout();
        let first = tokio::time::timeout(limit, connection.read())
            .await
            .map_err(|_| ConnectorError::ConnectionTimeout {
                timeout_secs: limit.as_secs(),
            })??;

        let (key, session) = match first {
            Some(Frame::Hello {
                payload: RemoteMessage::Hello(HelloMessage::Request { key, session }),
            }) => (key, session),
            Some(other) => {
                warn!(connection = %connection.connection_id(), frame = other.kind(), "Connection did not start with a hello");
                connection.close().await;
                return Err(ConnectorError::connection_failed(format!(
                    "expected a hello, got {}",
                    other.kind()
                )));
            }
            None => {
                return Err(ConnectorError::connection_failed(
                    "connection closed before the handshake",
                ))
            }
        };

        if !self.config.verify_key(key.expose()) {
            warn!(connection = %connection.connection_id(), session = %session, "Client presented a wrong key");
            let rejected = HelloMessage::Rejected {
                reason: "invalid key".to_string(),
            };
            if let Err(e) = connection
                .write(&Frame::Hello {
                    payload: RemoteMessage::Hello(rejected),
                })
                .await
            {
                debug!(error = %e, "Rejection not delivered");
            }
            connection.close().await;
            return Err(ConnectorError::AuthenticationFailed);
        }

        let welcome = HelloMessage::Response {
            server_start_time: self.start_time,
            connectors: self.registry.infos(),
        };
        connection
            .write(&Frame::Hello {
                payload: RemoteMessage::Hello(welcome),
            })
            .await?;

        let group = self.session_group(session);
        group.attach(connection)?;
        debug!(session = %session, connections = group.connection_count(), "Connection joined session");
        Ok(session)
    }

    /// Get the live group of a session, replacing a closed one.
    fn session_group(&self, session: Uuid) -> Session {
        match self.sessions.entry(session) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() == OperationalState::Closed {
                    entry.insert(self.new_group(session));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                info!(session = %session, "Session opened");
                entry.insert(self.new_group(session)).clone()
            }
        }
    }

    fn new_group(&self, session: Uuid) -> Session {
        ConnectionGroup::new(
            format!("session-{session}"),
            self.distributor_config.group_config(),
            self.dispatcher.clone(),
        )
    }

    /// Accept connections from `listener` until [`shutdown`](Self::shutdown).
    #[instrument(skip_all, fields(port = self.config.port))]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if self.config.use_ssl {
            warn!("TLS requested but not available; serving plain TCP");
        }
        info!(connectors = self.registry.len(), "Connector server accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "TCP_NODELAY not set");
            }

            let server = self.clone();
            tokio::spawn(async move {
                let connection = Arc::new(JsonFrameConnection::<RemoteMessage>::new(stream));
                match server.accept_connection(connection).await {
                    Ok(session) => debug!(peer = %peer, session = %session, "Client connected"),
                    Err(e) => warn!(peer = %peer, error = %e, "Handshake failed"),
                }
            });
        }
        info!("Connector server stopped accepting connections");
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> ConnectorResult<TcpListener> {
        let addr = self.config.socket_addr();
        TcpListener::bind(addr).await.map_err(|e| {
            ConnectorError::connection_failed_with_source(format!("cannot listen on {addr}"), e)
        })
    }

    /// Reconcile pending requests with every peer and close sessions
    /// disconnected for longer than `idle`.
    pub async fn maintain_sessions(&self, idle: Duration) -> SessionReport {
        let sessions: Vec<(Uuid, Session)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut report = SessionReport::default();
        for (id, group) in sessions {
            report.lost_requests += group.check_requests();
            if group.is_operational() {
                if let Err(e) = group.check_is_active().await {
                    debug!(session = %id, error = %e, "Liveness check not sent");
                }
                continue;
            }

            let removed = self.sessions.remove_if(&id, |_, group| {
                group.state() == OperationalState::Closed || group.is_idle_for(idle)
            });
            if let Some((_, group)) = removed {
                group.close().await;
                info!(session = %id, "Idle session closed");
                report.closed_sessions += 1;
            }
        }
        report
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, group)) = self.sessions.remove(&id) {
                group.close().await;
            }
        }
        info!("Connector server shut down");
    }
}

impl std::fmt::Debug for ConnectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorServer")
            .field("port", &self.config.port)
            .field("sessions", &self.sessions.len())
            .field("start_time", &self.start_time)
            .finish()
    }
}
