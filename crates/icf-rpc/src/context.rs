//! Physical connection contract
//!
//! A [`ConnectionContext`] owns the codec and session state of one socket.
//! The distributor only ever calls `read` and `write`.

use async_trait::async_trait;

use crate::error::RpcResult;
use crate::frame::{Frame, Payload};
use crate::ids::ConnectionId;

/// One framed, ordered, exactly-once message channel.
#[async_trait]
pub trait ConnectionContext<M: Payload>: Send + Sync + 'static {
    /// Get the identifier of this connection.
    fn connection_id(&self) -> ConnectionId;

    /// Send one frame.
    async fn write(&self, frame: &Frame<M>) -> RpcResult<()>;

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` at end of stream. A decode failure that leaves the
    /// stream usable is reported as [`RpcError::Decode`](crate::RpcError::Decode);
    /// any other error means the connection is unusable.
    async fn read(&self) -> RpcResult<Option<Frame<M>>>;

    /// Close the connection. Pending and future reads return end of stream.
    async fn close(&self);

    /// Check if the connection was closed locally.
    fn is_closed(&self) -> bool;
}
