//! In-process transport
//!
//! Two [`MemoryConnection`]s joined by unbounded channels. Frames are moved,
//! not serialized, so ordering and boundaries hold trivially.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::ConnectionContext;
use crate::error::{RpcError, RpcResult};
use crate::frame::{Frame, Payload};
use crate::ids::ConnectionId;

type Item<M> = RpcResult<Frame<M>>;

/// One end of an in-memory duplex connection.
pub struct MemoryConnection<M> {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::UnboundedSender<Item<M>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Item<M>>>,
    closed: CancellationToken,
}

/// Create a connected pair of in-memory connections.
pub fn duplex<M: Payload>() -> (Arc<MemoryConnection<M>>, Arc<MemoryConnection<M>>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryConnection::new(a_tx, a_rx)),
        Arc::new(MemoryConnection::new(b_tx, b_rx)),
    )
}

impl<M: Payload> MemoryConnection<M> {
    fn new(tx: mpsc::UnboundedSender<Item<M>>, rx: mpsc::UnboundedReceiver<Item<M>>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Push a raw read result to the peer, bypassing `write`.
    ///
    /// Lets tests deliver duplicate, late or undecodable frames.
    pub fn inject(&self, item: RpcResult<Frame<M>>) -> RpcResult<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| RpcError::connection_closed("memory connection closed"))?;
        tx.send(item)
            .map_err(|_| RpcError::connection_closed("peer dropped"))
    }
}

#[async_trait]
impl<M: Payload> ConnectionContext<M> for MemoryConnection<M> {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn write(&self, frame: &Frame<M>) -> RpcResult<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::connection_closed("memory connection closed"));
        }
        self.inject(Ok(frame.clone()))
    }

    async fn read(&self) -> RpcResult<Option<Frame<M>>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
