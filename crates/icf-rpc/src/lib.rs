//! # Remote Connector RPC
//!
//! Multiplexed request/response core shared by the client and server sides
//! of the remote connector protocol.
//!
//! Many requests share one logical connection. Each carries a correlation
//! id; replies may arrive as any number of partial frames followed by one
//! terminal frame. Requests can be cancelled from either side, and waiting
//! callers can time out without affecting the peer.
//!
//! ## Architecture
//!
//! - [`ConnectionContext`] - One physical, framed connection (`read`/`write`)
//! - [`ConnectionGroup`] - Pending request maps, connections and operational state
//! - [`RequestDistributor`] - Id allocation, submission and frame routing
//! - [`LocalRequest`] / [`RemoteRequest`] - Lifecycle of one request on each side
//! - [`Observer`] / [`Promise`] - Push callbacks, and the awaitable slot built on them
//!
//! ## Example
//!
//! ```ignore
//! use icf_rpc::prelude::*;
//!
//! let group = ConnectionGroup::new("peer", GroupConfig::default(), handler);
//! group.attach(connection)?;
//!
//! let distributor = RequestDistributor::new(group.clone());
//! if let Some(request) = distributor.try_submit(EchoFactory::new("ping")).await {
//!     let reply = request.wait_timeout(Duration::from_secs(30)).await?;
//! }
//! ```

pub mod context;
pub mod distributor;
pub mod error;
pub mod frame;
pub mod group;
pub mod ids;
pub mod observer;
pub mod promise;
pub mod request;
pub mod transport;

pub use context::ConnectionContext;
pub use distributor::RequestDistributor;
pub use error::{RpcError, RpcResult};
pub use frame::{Frame, Outcome, Payload, RemoteFault};
pub use group::{ConnectionGroup, GroupConfig, OperationalState, RejectingHandler, RequestHandler};
pub use ids::{ConnectionId, RequestId};
pub use observer::{CollectingObserver, NoopObserver, Observer, Subscription, Termination};
pub use promise::Promise;
pub use request::{LocalRequest, RemoteRequest, RequestFactory, RequestState};
pub use transport::{duplex, JsonFrameConnection, MemoryConnection};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::ConnectionContext;
    pub use crate::distributor::RequestDistributor;
    pub use crate::error::{RpcError, RpcResult};
    pub use crate::frame::{Frame, Outcome, Payload, RemoteFault};
    pub use crate::group::{
        ConnectionGroup, GroupConfig, OperationalState, RejectingHandler, RequestHandler,
    };
    pub use crate::ids::{ConnectionId, RequestId};
    pub use crate::observer::{CollectingObserver, Observer, Subscription, Termination};
    pub use crate::promise::Promise;
    pub use crate::request::{LocalRequest, RemoteRequest, RequestFactory, RequestState};
    pub use crate::transport::{duplex, JsonFrameConnection, MemoryConnection};
}

// Re-export async_trait for handler implementors
pub use async_trait::async_trait;
