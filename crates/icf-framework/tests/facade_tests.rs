//! Local facades obtained from the framework: operations, the facade cache
//! and idle eviction.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures_util::future::join_all;
use icf_framework::prelude::*;
use tokio::time::timeout;

fn account(name: &str) -> AttributeSet {
    AttributeSet::new()
        .with("name", name)
        .with("mail", format!("{name}@example.com"))
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_create_get_update_delete() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    let options = OperationOptions::default();

    let uid = facade.create("account", account("alice"), &options).await.unwrap();
    assert_eq!(uid.value(), "alice");

    let err = facade
        .create("account", account("alice"), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::ObjectAlreadyExists { .. }));

    facade
        .update(
            "account",
            &uid,
            UpdateType::Replace,
            AttributeSet::new().with("mail", "alice@corp.example"),
            &options,
        )
        .await
        .unwrap();

    let object = facade.get("account", &uid, &options).await.unwrap().unwrap();
    assert_eq!(object.attributes.get_string("mail"), Some("alice@corp.example"));

    let narrowed = facade
        .get(
            "account",
            &uid,
            &OperationOptions::default().with_attributes_to_get(vec!["name".to_string()]),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(narrowed.attributes.has("name"));
    assert!(!narrowed.attributes.has("mail"));

    facade.delete("account", &uid, &options).await.unwrap();
    assert!(facade.get("account", &uid, &options).await.unwrap().is_none());
}

#[tokio::test]
async fn test_search_streams_matching_objects() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    let options = OperationOptions::default();
    for name in ["alice", "bob", "carol"] {
        facade.create("account", account(name), &options).await.unwrap();
    }

    let everything = object_collector();
    let result = facade
        .search("account", None, everything.clone(), &options)
        .await
        .unwrap();
    assert_eq!(result, SearchResult::complete());
    assert_eq!(everything.len(), 3);
    assert!(everything.is_completed());

    let filtered = object_collector();
    facade
        .search(
            "account",
            Some(Filter::eq("name", "bob")),
            filtered.clone(),
            &options,
        )
        .await
        .unwrap();
    let found = filtered.items();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].uid.value(), "bob");
}

#[tokio::test]
async fn test_sync_resumes_from_token() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    let options = OperationOptions::default();
    for name in ["alice", "bob"] {
        facade.create("account", account(name), &options).await.unwrap();
    }

    let first = Arc::new(CollectingObserver::<SyncDelta, ConnectorError>::new());
    let token = facade
        .sync("account", None, first.clone(), &options)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.is_completed());
    assert_eq!(token, facade.latest_sync_token("account").await.unwrap());

    facade.create("account", account("carol"), &options).await.unwrap();
    let second = Arc::new(CollectingObserver::<SyncDelta, ConnectorError>::new());
    facade
        .sync("account", token, second.clone(), &options)
        .await
        .unwrap();
    let deltas = second.items();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].uid.value(), "carol");
    assert_eq!(deltas[0].delta_type, SyncDeltaType::CreateOrUpdate);
}

#[tokio::test]
async fn test_authenticate_and_resolve_username() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    let options = OperationOptions::default();
    facade.create("account", account("alice"), &options).await.unwrap();

    let uid = facade
        .authenticate("account", "alice", "secret", &options)
        .await
        .unwrap();
    assert_eq!(uid.value(), "alice");

    let err = facade
        .authenticate("account", "alice", "wrong", &options)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "AUTH_FAILED");

    assert!(facade
        .resolve_username("account", "nobody", &options)
        .await
        .is_err());
}

#[tokio::test]
async fn test_scripts_and_undeclared_operations() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    let options = OperationOptions::default();
    let script = ScriptContext::new("shell", "echo hello");

    let value = facade
        .run_script_on_connector(&script, &options)
        .await
        .unwrap();
    assert_eq!(value["language"], "shell");
    assert_eq!(value["length"], 10);

    assert!(!facade
        .capabilities()
        .supports(OperationKind::ScriptOnResource));
    let err = facade
        .run_script_on_resource(&script, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Unsupported { .. }));
}

#[tokio::test]
async fn test_derived_capabilities() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::Token).await;
    let capabilities = facade.capabilities();

    assert!(capabilities.supports(OperationKind::Validate));
    assert!(capabilities.supports(OperationKind::Get));
    assert!(capabilities.supports(OperationKind::Batch));
    facade.validate().await.unwrap();
    facade.test().await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let installed = Installed::new();

    let missing = ApiConfiguration::new(directory_key(BatchSupport::None));
    let err = installed.framework.new_instance(&missing).await.unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidConfiguration { .. }));

    let unknown = directory_api(BatchSupport::None).with_property("colour", "blue");
    assert!(installed.framework.new_instance(&unknown).await.is_err());

    let not_installed = ApiConfiguration::new(ConnectorKey::new("test.other", "1.0", "Other"));
    let err = installed
        .framework
        .new_instance(&not_installed)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::ConnectorNotFound { .. }));
    assert!(installed.framework.cache().is_empty());
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_equal_configurations_share_one_facade() {
    let installed = Installed::new();
    let key = directory_key(BatchSupport::None);

    let a = ApiConfiguration::new(key.clone())
        .with_property("host", "directory.test")
        .with_property("password", "pw");
    let b = ApiConfiguration::new(key.clone())
        .with_property("password", "pw")
        .with_property("host", "directory.test");
    let c = ApiConfiguration::new(key).with_property("host", "other.test");

    let first = installed.framework.new_instance(&a).await.unwrap();
    let second = installed.framework.new_instance(&b).await.unwrap();
    let third = installed.framework.new_instance(&c).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(installed.framework.cache().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_new_instance_returns_one_facade() {
    let installed = Installed::new();
    let api = directory_api(BatchSupport::Synchronous);

    let handles = (0..32).map(|_| {
        let framework = installed.framework.clone();
        let api = api.clone();
        tokio::spawn(async move { framework.new_instance(&api).await.unwrap() })
    });

    let facades: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    let first = &facades[0];
    assert!(facades.iter().all(|facade| Arc::ptr_eq(first, facade)));
    assert_eq!(installed.framework.cache().len(), 1);
}

#[tokio::test]
async fn test_idle_eviction_spares_busy_facades() {
    let installed = Installed::new();
    let api = directory_api(BatchSupport::Callback);
    let state = installed.state(BatchSupport::Callback);
    let facade = installed.framework.new_instance(&api).await.unwrap();
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
    assert_eq!(facade.pool_statistics().num_active, 1);

    let cache = installed.framework.cache();
    assert_eq!(cache.evict_idle(Duration::ZERO).await, 0);
    assert!(cache.get(&api).is_some());

    subscription.unsubscribe();
    timeout(WAIT, collector.wait_terminal()).await.unwrap();
    timeout(WAIT, async {
        while facade.pool_statistics().num_active > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(cache.evict_idle(Duration::ZERO).await, 1);
    assert!(cache.get(&api).is_none());
    assert_eq!(state.instances_disposed.load(Ordering::SeqCst), 1);

    let rebuilt = installed.framework.new_instance(&api).await.unwrap();
    assert!(!Arc::ptr_eq(&facade, &rebuilt));
}

#[tokio::test]
async fn test_recently_used_facade_is_kept() {
    let installed = Installed::new();
    let facade = installed.facade(BatchSupport::None).await;
    facade
        .create("account", account("alice"), &OperationOptions::default())
        .await
        .unwrap();

    let evicted = installed
        .framework
        .cache()
        .evict_idle(Duration::from_secs(60))
        .await;
    assert_eq!(evicted, 0);
    assert_eq!(installed.framework.cache().len(), 1);
}

#[tokio::test]
async fn test_shutdown_disposes_every_facade() {
    let installed = Installed::new();
    let state = installed.state(BatchSupport::None);
    let facade = installed.facade(BatchSupport::None).await;
    facade
        .create("account", account("alice"), &OperationOptions::default())
        .await
        .unwrap();
    assert_eq!(state.instances_created.load(Ordering::SeqCst), 1);

    installed.framework.shutdown().await;

    assert!(installed.framework.cache().is_empty());
    assert_eq!(state.instances_disposed.load(Ordering::SeqCst), 1);
    assert!(facade
        .create("account", account("bob"), &OperationOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_maintenance_loop_evicts_idle_facades() {
    let mut config = test_config();
    config.cache.idle_timeout_secs = 0;
    config.distributor = config.distributor.with_heartbeat(Duration::from_millis(50));
    let installed = Installed::with_config(config);
    let state = installed.state(BatchSupport::None);
    let facade = installed.facade(BatchSupport::None).await;
    facade
        .create("account", account("alice"), &OperationOptions::default())
        .await
        .unwrap();
    drop(facade);

    installed.framework.start_maintenance();

    timeout(WAIT, async {
        while !installed.framework.cache().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state.instances_disposed.load(Ordering::SeqCst), 1);
    installed.framework.shutdown().await;
}
