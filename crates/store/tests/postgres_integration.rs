//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use store::{KeyValueStore, PostgresStore, StoreError, StoreExt, Version};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresStore::new(temp_pool.clone())
                .run_migrations()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE records")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

#[tokio::test]
async fn insert_and_get_record() {
    let store = get_test_store().await;

    let version = store
        .compare_and_set("sagas", "O1", Version::initial(), json!({"status": "Created"}))
        .await
        .unwrap();
    assert_eq!(version, Version::first());

    let record = store.get("sagas", "O1").await.unwrap().unwrap();
    assert_eq!(record.namespace, "sagas");
    assert_eq!(record.key, "O1");
    assert_eq!(record.version, Version::first());
    assert_eq!(record.value["status"], "Created");
}

#[tokio::test]
async fn duplicate_insert_conflicts() {
    let store = get_test_store().await;

    store
        .compare_and_set("idempotency", "O1:reserve", Version::initial(), json!({}))
        .await
        .unwrap();

    let err = store
        .compare_and_set("idempotency", "O1:reserve", Version::initial(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConcurrencyConflict { actual, .. } if actual == Version::first()
    ));
}

#[tokio::test]
async fn stale_update_conflicts_and_keeps_value() {
    let store = get_test_store().await;

    store
        .compare_and_set("stock", "A", Version::initial(), json!({"available": 10}))
        .await
        .unwrap();
    store
        .compare_and_set("stock", "A", Version::first(), json!({"available": 8}))
        .await
        .unwrap();

    let err = store
        .compare_and_set("stock", "A", Version::first(), json!({"available": 0}))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let record = store.get("stock", "A").await.unwrap().unwrap();
    assert_eq!(record.version, Version::new(2));
    assert_eq!(record.value["available"], 8);
}

#[tokio::test]
async fn concurrent_insert_if_absent_has_one_winner() {
    let store = get_test_store().await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert_if_absent("idempotency", "contended", &i)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn scan_orders_by_key_and_remove() {
    let store = get_test_store().await;

    for key in ["00000000000000000002", "00000000000000000001", "00000000000000000010"] {
        store
            .compare_and_set("dead_letters", key, Version::initial(), json!(key))
            .await
            .unwrap();
    }

    let keys: Vec<String> = store
        .scan("dead_letters")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(
        keys,
        vec![
            "00000000000000000001",
            "00000000000000000002",
            "00000000000000000010"
        ]
    );

    assert!(store.remove("dead_letters", "00000000000000000001").await.unwrap());
    assert!(!store.remove("dead_letters", "00000000000000000001").await.unwrap());
    assert_eq!(store.scan("dead_letters").await.unwrap().len(), 2);
}
