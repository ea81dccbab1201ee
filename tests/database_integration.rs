//! Database integration tests with real PostgreSQL
//!
//! These tests require a live PostgreSQL database.
//! Set POSTGRES_TEST_URL environment variable to run.

use futures::StreamExt;
use serde_json::json;
use solidafy_cdc::cdc::TargetPositionSource;
use solidafy_cdc::config::{ConfiguredStream, DatabaseConfig, DatabaseEngineKind};
use solidafy_cdc::database::DatabaseEngine;
use solidafy_cdc::magic_sync::{MagicSyncQueries, KEY_HASH_COLUMN};
use solidafy_cdc::xmin::{XminQueries, XminQueryPlan};

/// Get test connection string from environment or skip
fn get_test_connection() -> Option<String> {
    std::env::var("POSTGRES_TEST_URL").ok()
}

fn postgres_engine() -> Option<DatabaseEngine> {
    let Some(conn_str) = get_test_connection() else {
        println!("Skipping: POSTGRES_TEST_URL not set");
        return None;
    };
    let config = DatabaseConfig {
        engine: DatabaseEngineKind::Postgres,
        connection_string: Some(conn_str),
        host: None,
        port: None,
        database: None,
        user: None,
        password: None,
    };
    let engine = DatabaseEngine::new(&config);
    assert!(engine.is_ok(), "Failed to create engine: {:?}", engine.err());
    engine.ok()
}

/// Catalog view every PostgreSQL database has
fn pg_tables_stream() -> ConfiguredStream {
    serde_json::from_value(json!({
        "stream": {
            "name": "pg_tables",
            "namespace": "pg_catalog",
            "json_schema": {
                "type": "object",
                "properties": {"schemaname": {}, "tablename": {}}
            },
            "source_defined_primary_key": [["schemaname"], ["tablename"]]
        },
        "sync_mode": "incremental"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_postgres_connection() {
    let Some(engine) = postgres_engine() else {
        return;
    };
    let check = engine.check_connection().await;
    assert!(check.is_ok(), "Connection check failed: {:?}", check.err());
    println!("Connection check passed: {}", engine.connection_info());
}

#[tokio::test]
async fn test_postgres_current_xmin_and_lsn() {
    let Some(engine) = postgres_engine() else {
        return;
    };

    let status = engine.current_xmin().await.unwrap();
    assert!(status.xmin_xid_value > 0);
    assert_eq!(status.xmin_raw_value >> 32, status.num_wraparound);

    let lsn = engine.current_position().await.unwrap();
    println!("Current xmin {status:?}, flush LSN {lsn}");
}

#[tokio::test]
async fn test_postgres_fingerprint_scan() {
    let Some(engine) = postgres_engine() else {
        return;
    };

    let rows: Vec<_> = engine
        .query_with_fingerprints(&pg_tables_stream())
        .await
        .unwrap()
        .collect()
        .await;
    assert!(!rows.is_empty());
    let first = rows[0].as_ref().unwrap();
    assert!(first.contains_key("tablename"));
    assert!(first.contains_key(KEY_HASH_COLUMN));
}

#[tokio::test]
async fn test_postgres_xmin_scan() {
    let Some(engine) = postgres_engine() else {
        return;
    };
    let stream: ConfiguredStream = serde_json::from_value(json!({
        "stream": {
            "name": "pg_class",
            "namespace": "pg_catalog",
            "json_schema": {"type": "object", "properties": {"relname": {}}}
        },
        "sync_mode": "incremental"
    }))
    .unwrap();

    let full: Vec<_> = engine
        .query_xmin(&stream, &XminQueryPlan::Full)
        .await
        .unwrap()
        .collect()
        .await;
    assert!(!full.is_empty());
    assert!(full[0].as_ref().unwrap().contains_key("relname"));

    let current = engine.current_xmin().await.unwrap();
    let after: Vec<_> = engine
        .query_xmin(
            &stream,
            &XminQueryPlan::After {
                xid: current.xmin_xid_value,
            },
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert!(after.len() < full.len());
}
