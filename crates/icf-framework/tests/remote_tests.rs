//! Remote facades talking to a connector server, over in-memory pairs and
//! over TCP.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use icf_framework::config::DistributorConfig;
use icf_framework::prelude::*;
use icf_framework::remote::RemoteMessage;
use icf_rpc::transport::duplex;
use tokio::time::timeout;

fn fault_code(err: &ConnectorError) -> Option<&str> {
    match err {
        ConnectorError::RemoteFault { code, .. } => Some(code.as_str()),
        _ => None,
    }
}

async fn remote(
    installed: &Installed,
    support: BatchSupport,
) -> (RemoteConnectorClient, std::sync::Arc<RemoteConnectorFacade>) {
    let client = installed.connect(KEY).await.unwrap();
    let facade = client.new_facade(directory_api(support)).unwrap();
    (client, facade)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Handshake and sessions
// ============================================================================

#[tokio::test]
async fn test_handshake_lists_installed_connectors() {
    let installed = Installed::new();
    let client = installed.connect(KEY).await.unwrap();

    assert_eq!(client.connectors().len(), 4);
    assert_eq!(
        client.server_start_time(),
        installed.framework.server().start_time()
    );
    assert_eq!(installed.framework.server().session_count(), 1);
    assert!(installed
        .framework
        .server()
        .session(client.session())
        .is_some());

    let unknown = ApiConfiguration::new(ConnectorKey::new("test.other", "1.0", "Other"));
    let err = client.new_facade(unknown).unwrap_err();
    assert!(matches!(err, ConnectorError::ConnectorNotFound { .. }));
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let installed = Installed::new();

    let err = installed.connect("not-the-key").await.unwrap_err();

    assert!(matches!(err, ConnectorError::AuthenticationFailed));
    assert_eq!(err.error_code(), "AUTH_FAILED");
    assert_eq!(installed.framework.server().session_count(), 0);
}

#[tokio::test]
async fn test_second_connection_joins_the_session() {
    let installed = Installed::new();
    let client = installed.connect(KEY).await.unwrap();

    let (client_end, server_end) = duplex::<RemoteMessage>();
    let server = installed.framework.server().clone();
    let accept = tokio::spawn(async move { server.accept_connection(server_end).await });
    client.attach_connection(client_end).await.unwrap();

    let session = accept.await.unwrap().unwrap();
    assert_eq!(session, client.session());
    assert_eq!(client.group().connection_count(), 2);
    assert_eq!(installed.framework.server().session_count(), 1);
}

#[tokio::test]
async fn test_closed_session_is_reaped() {
    let installed = Installed::new();
    let client = installed.connect(KEY).await.unwrap();
    let group = installed
        .framework
        .server()
        .session(client.session())
        .unwrap();

    client.close().await;
    wait_for(|| !group.is_operational()).await;

    let report = installed
        .framework
        .server()
        .maintain_sessions(Duration::ZERO)
        .await;
    assert_eq!(report.closed_sessions, 1);
    assert_eq!(installed.framework.server().session_count(), 0);
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_remote_crud() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;
    let options = OperationOptions::default();

    let uid = facade
        .create("account", AttributeSet::new().with("name", "alice"), &options)
        .await
        .unwrap();
    assert_eq!(uid.value(), "alice");
    assert_eq!(installed.state(BatchSupport::None).len(), 1);

    let err = facade
        .create("account", AttributeSet::new().with("name", "alice"), &options)
        .await
        .unwrap_err();
    assert_eq!(fault_code(&err), Some("OBJECT_EXISTS"));

    facade
        .update(
            "account",
            &uid,
            UpdateType::Replace,
            AttributeSet::new().with("mail", "alice@example.com"),
            &options,
        )
        .await
        .unwrap();
    let object = facade.get("account", &uid, &options).await.unwrap().unwrap();
    assert_eq!(object.attributes.get_string("mail"), Some("alice@example.com"));

    facade.delete("account", &uid, &options).await.unwrap();
    assert!(facade.get("account", &uid, &options).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_search_streams_objects() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;
    let options = OperationOptions::default();
    for i in 0..25 {
        facade
            .create(
                "account",
                AttributeSet::new().with("name", format!("user{i:02}")),
                &options,
            )
            .await
            .unwrap();
    }

    let collector = object_collector();
    let result = facade
        .search("account", None, collector.clone(), &options)
        .await
        .unwrap();

    assert_eq!(result, SearchResult::complete());
    assert_eq!(collector.len(), 25);
    assert!(collector.is_completed());
    assert_eq!(collector.items()[0].uid.value(), "user00");
}

#[tokio::test]
async fn test_remote_sync_authenticate_and_scripts() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;
    let options = OperationOptions::default();
    facade
        .create("account", AttributeSet::new().with("name", "alice"), &options)
        .await
        .unwrap();

    let deltas = std::sync::Arc::new(CollectingObserver::<SyncDelta, ConnectorError>::new());
    let token = facade
        .sync("account", None, deltas.clone(), &options)
        .await
        .unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(token, facade.latest_sync_token("account").await.unwrap());

    let uid = facade
        .authenticate("account", "alice", "secret", &options)
        .await
        .unwrap();
    assert_eq!(uid.value(), "alice");
    let err = facade
        .authenticate("account", "alice", "nope", &options)
        .await
        .unwrap_err();
    assert_eq!(fault_code(&err), Some("AUTH_FAILED"));

    let value = facade
        .run_script_on_connector(&ScriptContext::new("shell", "id"), &options)
        .await
        .unwrap();
    assert_eq!(value["length"], 2);

    facade.test().await.unwrap();
    facade.validate().await.unwrap();
}

#[tokio::test]
async fn test_remote_undeclared_operation_fails_locally() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;

    let err = facade
        .run_script_on_resource(&ScriptContext::new("shell", "id"), &OperationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::Unsupported { .. }));
}

#[tokio::test]
async fn test_remote_operation_timeout() {
    let installed = Installed::new();
    let client = installed.connect(KEY).await.unwrap();
    let api = directory_api(BatchSupport::None)
        .with_timeout(OperationKind::ResolveUsername, Duration::from_millis(100));
    let facade = client.new_facade(api).unwrap();

    let err = facade
        .resolve_username("account", SLOW, &OperationOptions::default())
        .await
        .unwrap_err();

    // Either side may give up first.
    assert!(
        matches!(
            err,
            ConnectorError::OperationTimeout {
                operation: OperationKind::ResolveUsername,
                ..
            }
        ) || fault_code(&err) == Some("OPERATION_TIMEOUT"),
        "unexpected error: {err:?}"
    );
    // The session stays usable.
    facade.test().await.unwrap();
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn test_remote_sequential_batch() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;
    let collector = batch_collector();

    let subscription = facade
        .execute_batch(create_tasks(4), collector.clone(), &BatchOptions::default())
        .await
        .unwrap();

    assert!(subscription.is_none());
    assert!(collector.is_completed());
    let results = collector.items();
    assert_eq!(results.len(), 4);
    assert_eq!(results.iter().filter(|r| r.complete).count(), 1);
    assert_eq!(installed.state(BatchSupport::None).len(), 4);
}

#[tokio::test]
async fn test_remote_batch_stopped_on_failure() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::None).await;
    let collector = batch_collector();
    let tasks = vec![BatchTask::create("account", AttributeSet::new())];

    facade
        .execute_batch(tasks, collector.clone(), &BatchOptions::fail_on_error())
        .await
        .unwrap();

    assert_eq!(collector.len(), 1);
    let err = collector.error().unwrap();
    assert_eq!(fault_code(&err), Some("INVALID_DATA"));
}

#[tokio::test]
async fn test_remote_synchronous_batch() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::Synchronous).await;
    let collector = batch_collector();

    let subscription = facade
        .execute_batch(create_tasks(3), collector.clone(), &BatchOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert!(subscription.is_unsubscribed());
    assert!(collector.is_completed());
    assert_eq!(collector.len(), 3);
}

#[tokio::test]
async fn test_remote_callback_batch_streams_results() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::Callback).await;
    let collector = batch_collector();

    let subscription = facade
        .execute_batch(create_tasks(5), collector.clone(), &BatchOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(subscription.token().is_some());
    assert_eq!(subscription.support(), BatchSupport::Callback);

    let termination = timeout(WAIT, collector.wait_terminal()).await.unwrap();
    assert!(matches!(termination, Termination::Completed));
    let results = collector.items();
    assert_eq!(results.len(), 5);
    assert_eq!(results.iter().filter(|r| r.complete).count(), 1);
    wait_for(|| subscription.is_unsubscribed()).await;
}

#[tokio::test]
async fn test_remote_callback_batch_cancelled_by_unsubscribe() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::Callback).await;
    let state = installed.state(BatchSupport::Callback);
    let collector = batch_collector();

    let subscription = facade
        .execute_batch(
            vec![BatchTask::create(HOLD, AttributeSet::new().with("name", "held"))],
            collector.clone(),
            &BatchOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(!subscription.is_unsubscribed());

    subscription.unsubscribe();

    let termination = timeout(WAIT, collector.wait_terminal()).await.unwrap();
    assert!(matches!(
        termination,
        Termination::Failed(ConnectorError::Cancelled)
    ));
    wait_for(|| state.batches_cancelled.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_remote_token_batch_collected_by_polling() {
    let installed = Installed::new();
    let (_client, facade) = remote(&installed, BatchSupport::Token).await;
    let first = batch_collector();

    let subscription = facade
        .execute_batch(create_tasks(4), first.clone(), &BatchOptions::default())
        .await
        .unwrap()
        .unwrap();
    let token = subscription.token().unwrap();
    assert!(!subscription.is_unsubscribed());

    let mut results = first.items();
    let deadline = tokio::time::Instant::now() + WAIT;
    let termination = loop {
        let collector = batch_collector();
        facade
            .query_batch(token, collector.clone(), &BatchOptions::default())
            .await
            .unwrap();
        results.extend(collector.items());
        if let Some(termination) = collector.termination() {
            break termination;
        }
        assert!(tokio::time::Instant::now() < deadline, "batch never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert!(matches!(termination, Termination::Completed));
    assert_eq!(results.len(), 4);
    assert_eq!(results.iter().filter(|r| r.complete).count(), 1);

    let err = facade
        .query_batch(token, batch_collector(), &BatchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(fault_code(&err), Some("BATCH_TOKEN_NOT_FOUND"));
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_round_trip() {
    let installed = Installed::new();
    let addr = installed.framework.start_server().await.unwrap();

    let client = RemoteConnectorClient::connect(
        addr,
        KEY,
        DistributorConfig::default().with_request_timeout(WAIT),
    )
    .await
    .unwrap();
    let facade = client.new_facade(directory_api(BatchSupport::None)).unwrap();

    let uid = facade
        .create(
            "account",
            AttributeSet::new().with("name", "alice"),
            &OperationOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(uid.value(), "alice");

    let collector = object_collector();
    facade
        .search("account", None, collector.clone(), &OperationOptions::default())
        .await
        .unwrap();
    assert_eq!(collector.len(), 1);

    client.close().await;
    installed.framework.shutdown().await;
}

#[tokio::test]
async fn test_tcp_wrong_key() {
    let installed = Installed::new();
    let addr = installed.framework.start_server().await.unwrap();

    let err = RemoteConnectorClient::connect(addr, "wrong", DistributorConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectorError::AuthenticationFailed));
    installed.framework.shutdown().await;
}
