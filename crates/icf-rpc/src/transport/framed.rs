//! Length-prefixed JSON transport
//!
//! Each frame is a big-endian `u32` byte length followed by the JSON
//! encoding of a [`Frame`]. A body that is valid JSON but not a valid frame
//! is reported against its `id` when one can be recovered, and the stream
//! stays usable.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::ConnectionContext;
use crate::error::{RpcError, RpcResult};
use crate::frame::{Frame, Payload};
use crate::ids::{ConnectionId, RequestId};

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// JSON frames over a byte stream.
pub struct JsonFrameConnection<M> {
    id: ConnectionId,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    max_frame_len: usize,
    closed: CancellationToken,
    _payload: PhantomData<fn() -> M>,
}

impl<M> JsonFrameConnection<M> {
    /// Wrap a bidirectional stream such as a `TcpStream`.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer))
    }

    /// Build from separate read and write halves.
    pub fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            id: ConnectionId::new(),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            closed: CancellationToken::new(),
            _payload: PhantomData,
        }
    }

    /// Set the maximum accepted frame length.
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// Decode a frame body, recovering the request id on failure when possible.
pub fn decode_frame<M: DeserializeOwned>(body: &[u8]) -> RpcResult<Frame<M>> {
    serde_json::from_slice::<Frame<M>>(body).map_err(|e| {
        let envelope = serde_json::from_slice::<serde_json::Value>(body).ok();
        let request_id = envelope
            .as_ref()
            .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
            .map(RequestId::new);
        let request_frame = envelope
            .as_ref()
            .and_then(|v| v.get("type").and_then(serde_json::Value::as_str))
            == Some("request");
        RpcError::Decode {
            request_id,
            request_frame,
            message: e.to_string(),
        }
    })
}

/// Encode a frame body.
pub fn encode_frame<M: Serialize>(frame: &Frame<M>) -> RpcResult<Vec<u8>> {
    serde_json::to_vec(frame).map_err(|e| RpcError::protocol(format!("encode failed: {e}")))
}

async fn read_body(reader: &mut BoxedReader, max_frame_len: usize) -> RpcResult<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_len {
        return Err(RpcError::protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame_len}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[async_trait]
impl<M> ConnectionContext<M> for JsonFrameConnection<M>
where
    M: Payload + Serialize + DeserializeOwned,
{
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn write(&self, frame: &Frame<M>) -> RpcResult<()> {
        if self.closed.is_cancelled() {
            return Err(RpcError::connection_closed("connection closed"));
        }
        let body = encode_frame(frame)?;
        let len = u32::try_from(body.len())
            .map_err(|_| RpcError::protocol("frame too large to encode"))?;

        let mut writer = self.writer.lock().await;
        writer.write_u32(len).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read(&self) -> RpcResult<Option<Frame<M>>> {
        let mut reader = self.reader.lock().await;
        let body = tokio::select! {
            _ = self.closed.cancelled() => return Ok(None),
            body = read_body(&mut reader, self.max_frame_len) => body?,
        };
        match body {
            Some(body) => decode_frame(&body).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(connection = %self.id, error = %e, "Error shutting down connection");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
