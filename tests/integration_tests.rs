//! End-to-end tests of the incremental strategies
//!
//! MagicSync runs against an in-memory DuckDB database; CDC runs against a
//! scripted log engine.

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use solidafy_cdc::cdc::{
    CdcDriver, ChangeEvent, ChangeOp, EngineContext, LogEngine, Lsn, OffsetSnapshot,
    TargetPositionSource, CDC_DELETED_AT_COLUMN, CDC_LSN_COLUMN,
};
use solidafy_cdc::config::{CdcConfig, CdcReadOptions};
use solidafy_cdc::database::DatabaseEngine;
use solidafy_cdc::engine::{read_incremental, IncrementalDriver, Message, StreamStatus};
use solidafy_cdc::magic_sync::MagicSyncDriver;
use solidafy_cdc::state::{CheckpointMessage, StateStore};
use solidafy_cdc::{ConfiguredCatalog, JsonObject, Result, StreamKey};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn catalog(streams: &[(&str, Option<&str>)]) -> ConfiguredCatalog {
    let streams: Vec<Value> = streams
        .iter()
        .map(|(name, namespace)| {
            json!({
                "stream": {
                    "name": name,
                    "namespace": namespace,
                    "json_schema": {
                        "type": "object",
                        "properties": {"id": {"type": "integer"}, "name": {"type": "string"}}
                    },
                    "source_defined_primary_key": [["id"]]
                },
                "sync_mode": "incremental"
            })
        })
        .collect();
    serde_json::from_value(json!({ "streams": streams })).unwrap()
}

async fn run_sync(
    strategy: impl solidafy_cdc::IncrementalStrategy + 'static,
    catalog: ConfiguredCatalog,
    prior: Vec<CheckpointMessage>,
) -> Vec<Message> {
    read_incremental(strategy, catalog, prior)
        .map(|message| message.unwrap())
        .collect()
        .await
}

fn records(messages: &[Message]) -> Vec<&JsonObject> {
    messages
        .iter()
        .filter_map(Message::as_record)
        .map(|record| &record.data)
        .collect()
}

fn checkpoints(messages: &[Message]) -> Vec<CheckpointMessage> {
    messages.iter().filter_map(Message::as_state).cloned().collect()
}

fn statuses(messages: &[Message]) -> Vec<StreamStatus> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::Trace { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// ============================================================================
// MagicSync
// ============================================================================

#[tokio::test]
async fn test_magic_sync_emits_only_changes_across_runs() {
    let database = Arc::new(DatabaseEngine::in_memory().unwrap());
    database
        .execute_batch(
            "CREATE TABLE users (id INTEGER, name VARCHAR);
             INSERT INTO users VALUES (1, 'ada'), (2, 'grace');",
        )
        .unwrap();
    let catalog = catalog(&[("users", None)]);
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    // First run sees every row
    let first = run_sync(
        MagicSyncDriver::new(database.clone()),
        catalog.clone(),
        store.load().unwrap(),
    )
    .await;
    assert_eq!(records(&first).len(), 2);
    assert_eq!(
        statuses(&first),
        vec![StreamStatus::Started, StreamStatus::Complete]
    );
    store.merge(checkpoints(&first)).await.unwrap();

    // One update and one insert
    database
        .execute_batch(
            "UPDATE users SET name = 'lovelace' WHERE id = 1;
             INSERT INTO users VALUES (3, 'barbara');",
        )
        .unwrap();

    let second = run_sync(
        MagicSyncDriver::new(database.clone()),
        catalog.clone(),
        store.load().unwrap(),
    )
    .await;
    let mut ids: Vec<i64> = records(&second)
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);
    assert!(records(&second)
        .iter()
        .all(|r| !r.contains_key("_ab_key_hash") && !r.contains_key("_ab_value_hash")));
    store.merge(checkpoints(&second)).await.unwrap();

    // Nothing changed since
    let third = run_sync(
        MagicSyncDriver::new(database),
        catalog,
        store.load().unwrap(),
    )
    .await;
    assert!(records(&third).is_empty());
    assert_eq!(checkpoints(&third).len(), 1);
    assert_eq!(store.load().unwrap().len(), 1);
}

#[tokio::test]
async fn test_magic_sync_missing_table_ends_stream_early() {
    let database = Arc::new(DatabaseEngine::in_memory().unwrap());
    database
        .execute_batch(
            "CREATE TABLE users (id INTEGER, name VARCHAR);
             INSERT INTO users VALUES (1, 'ada');",
        )
        .unwrap();

    let messages = run_sync(
        MagicSyncDriver::new(database),
        catalog(&[("missing", None), ("users", None)]),
        Vec::new(),
    )
    .await;

    assert_eq!(
        statuses(&messages),
        vec![
            StreamStatus::Started,
            StreamStatus::Incomplete,
            StreamStatus::Started,
            StreamStatus::Complete,
        ]
    );
    let states = checkpoints(&messages);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].stream_key(), Some(StreamKey::new("users", None)));
}

// ============================================================================
// CDC
// ============================================================================

/// Target position fixed for the test
struct FixedPosition(Lsn);

#[async_trait]
impl TargetPositionSource<Lsn> for FixedPosition {
    async fn current_position(&self) -> Result<Lsn> {
        Ok(self.0)
    }
}

/// What the engine was started with
#[derive(Debug, Default, Clone)]
struct Observed {
    seed: Option<OffsetSnapshot>,
    snapshot_mode: Option<String>,
}

/// Engine emitting a fixed change log and committing the offset it reached
struct ReplayEngine {
    events: Vec<ChangeEvent>,
    offset: OffsetSnapshot,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl LogEngine for ReplayEngine {
    async fn run(self: Box<Self>, mut ctx: EngineContext) -> Result<()> {
        {
            let mut observed = self.observed.lock().unwrap();
            observed.seed = ctx.offset_seed.clone();
            observed.snapshot_mode = ctx.properties.get("snapshot.mode").map(str::to_string);
        }
        for event in self.events {
            ctx.sink.publish(event).await?;
        }
        ctx.offsets.commit(&self.offset).await?;
        ctx.shutdown.requested().await;
        Ok(())
    }
}

fn change(stream: &str, op: ChangeOp, lsn: u64, id: i64) -> ChangeEvent {
    let row = json!({"id": id, "name": format!("user-{id}")})
        .as_object()
        .unwrap()
        .clone();
    let event = ChangeEvent::new(StreamKey::namespaced("public", stream), op)
        .with_source("lsn", lsn)
        .with_source("ts_ms", 1_700_000_000_000_i64);
    if op == ChangeOp::Delete {
        event.with_before(row)
    } else {
        event.with_after(row)
    }
}

fn slot_offset(lsn: u64) -> OffsetSnapshot {
    [(
        "[\"cdc\",{\"server\":\"source\"}]".to_string(),
        format!("{{\"lsn\":{lsn}}}"),
    )]
    .into_iter()
    .collect()
}

fn cdc_driver(
    dir: &std::path::Path,
    events: Vec<ChangeEvent>,
    offset: OffsetSnapshot,
    target: u64,
    observed: Arc<Mutex<Observed>>,
) -> IncrementalDriver {
    let mut config = CdcConfig::new("cdc_slot", "cdc_pub");
    config.offset_dir = Some(dir.to_path_buf());
    let engine = ReplayEngine {
        events,
        offset,
        observed,
    };
    let driver = CdcDriver::new(config, Box::new(engine), Arc::new(FixedPosition(Lsn(target))))
        .with_read_options(
            CdcReadOptions::default()
                .with_timeouts(Duration::from_secs(2), Duration::from_millis(100)),
        );
    IncrementalDriver::Cdc(driver)
}

#[tokio::test]
async fn test_cdc_sync_ends_with_global_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let events = vec![
        change("users", ChangeOp::Create, 10, 1),
        change("audit_log", ChangeOp::Create, 11, 99),
        change("users", ChangeOp::Update, 12, 1),
        change("users", ChangeOp::Delete, 13, 2),
    ];

    let messages = run_sync(
        cdc_driver(dir.path(), events, slot_offset(13), 13, observed.clone()),
        catalog(&[("users", Some("public")), ("orders", Some("public"))]),
        Vec::new(),
    )
    .await;

    // Unselected streams are skipped
    let rows = records(&messages);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][CDC_LSN_COLUMN], json!(10));
    assert_eq!(rows[1][CDC_DELETED_AT_COLUMN], Value::Null);
    assert_eq!(rows[2]["id"], json!(2));
    assert!(rows[2][CDC_DELETED_AT_COLUMN].is_string());

    let states = checkpoints(&messages);
    assert_eq!(states.len(), 1);
    assert!(states[0].is_global());
    assert_eq!(states[0].offset().unwrap(), Some(slot_offset(13)));
    let wire = serde_json::to_value(&states[0]).unwrap();
    assert_eq!(wire["type"], "GLOBAL");
    assert_eq!(
        wire["global"]["stream_states"].as_array().unwrap().len(),
        2
    );

    assert_eq!(
        statuses(&messages),
        vec![
            StreamStatus::Started,
            StreamStatus::Started,
            StreamStatus::Complete,
            StreamStatus::Complete,
        ]
    );

    let observed = observed.lock().unwrap().clone();
    assert!(observed.seed.is_none());
    assert_eq!(observed.snapshot_mode.as_deref(), Some("initial"));
}

#[tokio::test]
async fn test_cdc_resumes_from_saved_offset() {
    let dir = tempfile::tempdir().unwrap();
    let first_observed = Arc::new(Mutex::new(Observed::default()));
    let first = run_sync(
        cdc_driver(
            dir.path(),
            vec![change("users", ChangeOp::Create, 5, 1)],
            slot_offset(5),
            5,
            first_observed,
        ),
        catalog(&[("users", Some("public"))]),
        Vec::new(),
    )
    .await;
    let prior = checkpoints(&first);

    let observed = Arc::new(Mutex::new(Observed::default()));
    let second = run_sync(
        cdc_driver(
            dir.path(),
            vec![change("users", ChangeOp::Update, 8, 1)],
            slot_offset(8),
            8,
            observed.clone(),
        ),
        catalog(&[("users", Some("public"))]),
        prior,
    )
    .await;

    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed.seed, Some(slot_offset(5)));
    assert_eq!(observed.snapshot_mode.as_deref(), Some("never"));
    assert_eq!(records(&second).len(), 1);
    assert_eq!(
        checkpoints(&second)[0].offset().unwrap(),
        Some(slot_offset(8))
    );
}

#[tokio::test]
async fn test_cdc_without_log_engine_is_config_error() {
    let config = solidafy_cdc::SourceConfig::from_yaml(
        r#"
database:
  engine: duckdb
  connection_string: ":memory:"
replication_method:
  method: CDC
  replication_slot: slot
  publication: pub
"#,
    )
    .unwrap();
    let database = Arc::new(DatabaseEngine::new(&config.database).unwrap());

    let result = IncrementalDriver::from_config(&config, database, None);
    assert!(matches!(result, Err(solidafy_cdc::Error::Config { .. })));
}
