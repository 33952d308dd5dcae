//! Integration test helpers for icf-rpc.
//!
//! Provides a scripted request handler, a request factory for it, and
//! helpers wiring two connection groups (or one group and a hand-driven
//! peer) over in-memory connections.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use icf_rpc::async_trait;
use icf_rpc::prelude::*;
use icf_rpc::transport::MemoryConnection;
use tokio::sync::Semaphore;

static INIT: Once = Once::new();

/// Upper bound for every wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Message type exchanged by the test peers.
#[derive(Debug, Clone, PartialEq)]
pub enum TestMessage {
    /// Run a scripted scenario.
    Call(u32),
    /// Echo the number back after a short, number-dependent delay.
    Echo(u64),
    /// A textual result.
    Text(String),
}

/// Scenario numbers understood by [`ScenarioHandler`].
pub mod case {
    /// Reply "OK".
    pub const SIMPLE: u32 = 0;
    /// Three parts, then "OK".
    pub const STREAMING: u32 = 1;
    /// Wait for cancellation, then try to answer anyway.
    pub const CANCELLABLE: u32 = 2;
    /// Wait until released, then reply "OK".
    pub const GATED: u32 = 4;
    /// Return without answering.
    pub const SILENT: u32 = 5;
}

/// Handler executing the scripted scenarios.
pub struct ScenarioHandler {
    pub cancelled: AtomicUsize,
    pub late_answers_rejected: AtomicUsize,
    /// Each permit releases one gated request.
    pub release: Semaphore,
}

impl Default for ScenarioHandler {
    fn default() -> Self {
        Self {
            cancelled: AtomicUsize::new(0),
            late_answers_rejected: AtomicUsize::new(0),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl RequestHandler<TestMessage> for ScenarioHandler {
    async fn handle(&self, request: Arc<RemoteRequest<TestMessage>>, payload: TestMessage) {
        match payload {
            TestMessage::Echo(n) => {
                tokio::time::sleep(Duration::from_millis(n % 7)).await;
                request.complete(TestMessage::Text(format!("echo-{n}"))).await;
            }
            TestMessage::Call(case::SIMPLE) => {
                request.complete(TestMessage::Text("OK".to_string())).await;
            }
            TestMessage::Call(case::STREAMING) => {
                for i in 0..3 {
                    let _ = request
                        .send_part(TestMessage::Text(format!("Result{i}")))
                        .await;
                }
                request.complete(TestMessage::Text("OK".to_string())).await;
            }
            TestMessage::Call(case::CANCELLABLE) => {
                let token = request.cancellation_token();
                let _ = tokio::time::timeout(WAIT, token.cancelled()).await;
                if request.is_cancelled() {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
                if !request.complete(TestMessage::Text("too late".to_string())).await {
                    self.late_answers_rejected.fetch_add(1, Ordering::SeqCst);
                }
            }
            TestMessage::Call(case::GATED) => {
                if let Ok(permit) = self.release.acquire().await {
                    permit.forget();
                }
                request.complete(TestMessage::Text("OK".to_string())).await;
            }
            TestMessage::Call(case::SILENT) => {}
            _ => {
                request
                    .fail(RemoteFault::new("UNKNOWN_CASE", "Unknown test case number"))
                    .await;
            }
        }
    }
}

/// Factory for [`TestMessage`] requests whose replies are text.
pub struct TestFactory {
    message: TestMessage,
}

impl TestFactory {
    pub fn call(case: u32) -> Self {
        Self {
            message: TestMessage::Call(case),
        }
    }

    pub fn echo(n: u64) -> Self {
        Self {
            message: TestMessage::Echo(n),
        }
    }
}

impl RequestFactory<TestMessage> for TestFactory {
    type Value = String;

    fn create_payload(&self, _id: RequestId) -> RpcResult<TestMessage> {
        Ok(self.message.clone())
    }

    fn decode(&self, _id: RequestId, payload: TestMessage) -> RpcResult<String> {
        match payload {
            TestMessage::Text(text) => Ok(text),
            other => Err(RpcError::decode(format!("expected text, got {other:?}"))),
        }
    }
}

/// A client group and a server group joined by one in-memory connection.
pub struct Peers {
    pub client: Arc<ConnectionGroup<TestMessage>>,
    pub server: Arc<ConnectionGroup<TestMessage>>,
    pub handler: Arc<ScenarioHandler>,
}

impl Peers {
    pub fn new() -> Self {
        init_test_logging();
        let handler = Arc::new(ScenarioHandler::default());
        let client = ConnectionGroup::new(
            "client",
            GroupConfig::default(),
            Arc::new(RejectingHandler),
        );
        let server = ConnectionGroup::new("server", GroupConfig::default(), handler.clone());

        let (a, b) = duplex::<TestMessage>();
        client.attach(a).unwrap();
        server.attach(b).unwrap();
        Self {
            client,
            server,
            handler,
        }
    }

    pub fn distributor(&self) -> RequestDistributor<TestMessage> {
        RequestDistributor::new(self.client.clone())
    }
}

/// A client group whose peer is driven by the test through a raw connection.
pub struct ManualPeer {
    pub group: Arc<ConnectionGroup<TestMessage>>,
    pub peer: Arc<MemoryConnection<TestMessage>>,
}

impl ManualPeer {
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    pub fn with_config(config: GroupConfig) -> Self {
        init_test_logging();
        let group = ConnectionGroup::new("client", config, Arc::new(RejectingHandler));
        let (a, b) = duplex::<TestMessage>();
        group.attach(a).unwrap();
        Self { group, peer: b }
    }

    pub fn distributor(&self) -> RequestDistributor<TestMessage> {
        RequestDistributor::new(self.group.clone())
    }

    /// Read the next frame the group sent.
    pub async fn next_frame(&self) -> Frame<TestMessage> {
        tokio::time::timeout(WAIT, self.peer.read())
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed")
            .expect("connection closed")
    }

    /// Send a frame to the group.
    pub async fn send(&self, frame: Frame<TestMessage>) {
        self.peer.write(&frame).await.unwrap();
    }

    pub async fn send_part(&self, id: RequestId, text: &str) {
        self.send(Frame::ResponsePart {
            id,
            payload: TestMessage::Text(text.to_string()),
        })
        .await;
    }

    pub async fn send_end(&self, id: RequestId, text: &str) {
        self.send(Frame::ResponseEnd {
            id,
            outcome: Outcome::Value(TestMessage::Text(text.to_string())),
        })
        .await;
    }

    /// Round-trip a throwaway request so every earlier frame is processed.
    pub async fn flush(&self) {
        let request = self
            .distributor()
            .try_submit(TestFactory::call(case::SIMPLE))
            .await
            .expect("flush request not sent");
        let frame = self.next_frame().await;
        let id = frame.request_id().expect("request frame");
        self.send_end(id, "flushed").await;
        request.wait_timeout(WAIT).await.unwrap();
    }
}
