//! Settings to registry to store, against both in-process backends

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use kvstore::etcd::MemoryEtcd;
use kvstore::zookeeper::MemoryZk;
use kvstore::{Backend, Context, Store, StoreError, StoreRegistry, StoreSettings};
use kvstore_testutils as testutils;

fn registry() -> StoreRegistry {
    StoreRegistry::with_builtin(Arc::new(MemoryEtcd::new()), Arc::new(MemoryZk::new()))
}

fn settings_for(backend: Backend) -> StoreSettings {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(
        file,
        "backend = \"{}\"\nendpoints = [\"127.0.0.1:1\"]\nconnection_timeout_ms = 3000",
        backend
    )
    .unwrap();
    file.flush().unwrap();

    StoreSettings::load_with_env(Some(file.path()), Some(Default::default())).unwrap()
}

async fn open(backend: Backend) -> Arc<dyn Store> {
    let store = registry().from_settings(&settings_for(backend)).await.unwrap();
    assert_eq!(store.backend(), backend.as_str());
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_settings_select_backend() {
    testutils::init_tracing();

    for backend in Backend::ALL {
        let store = open(backend).await;
        testutils::run_cleanup(store.as_ref()).await;
        testutils::run_test_common(store.as_ref()).await;
        testutils::run_test_txn(store.as_ref()).await;
    }
}

#[tokio::test]
async fn test_same_calls_on_every_backend() {
    let ctx = Context::background();

    for backend in Backend::ALL {
        let store = open(backend).await;
        store
            .put(&ctx, "/e2e/a", Bytes::from_static(b"1"), None)
            .await
            .unwrap();
        store
            .put(&ctx, "/e2e/b", Bytes::from_static(b"2"), None)
            .await
            .unwrap();

        let keys: Vec<String> = store
            .list(&ctx, "/e2e")
            .await
            .unwrap()
            .into_iter()
            .map(|pair| pair.key)
            .collect();
        assert_eq!(keys, vec!["/e2e/a", "/e2e/b"], "backend {}", backend);

        store.delete_tree(&ctx, "/e2e").await.unwrap();
        let err = store.get(&ctx, "/e2e/a").await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound), "backend {}", backend);
    }
}

#[tokio::test]
async fn test_unregistered_backend_in_settings() {
    let settings = StoreSettings {
        backend: "consul".to_string(),
        endpoints: vec!["127.0.0.1:8500".to_string()],
        ..Default::default()
    };
    let err = registry().from_settings(&settings).await.err().unwrap();
    assert!(matches!(err, StoreError::BackendNotSupported(_)));
}
