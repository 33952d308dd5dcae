//! Remote connector protocol
//!
//! - [`messages`] - Wire payloads carried inside RPC frames
//! - [`dispatcher`] - Server-side execution of incoming operations
//! - [`server`] - Listener, handshake and per-session connection groups
//! - [`client`] - Client session and the remote facade

pub mod client;
pub mod dispatcher;
pub mod messages;
pub mod server;

pub use client::{RemoteBatchSubscription, RemoteConnectorClient, RemoteConnectorFacade};
pub use dispatcher::OperationDispatcher;
pub use messages::{GuardedString, HelloMessage, Operation, OperationRequest, OperationResponse, RemoteMessage};
pub use server::{ConnectorServer, SessionReport};
