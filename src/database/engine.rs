//! DuckDB-based database engine
//!
//! Attaches the source database through a DuckDB extension and serves the
//! row scans of the incremental strategies.

use crate::cdc::{Lsn, TargetPositionSource};
use crate::config::{ConfiguredStream, DatabaseConfig, DatabaseEngineKind};
use crate::engine::RowStream;
use crate::error::{Error, Result};
use crate::magic_sync::{MagicSyncQueries, KEY_HASH_COLUMN, VALUE_HASH_COLUMN};
use crate::types::{quote_ident, quote_literal, JsonObject, StreamKey};
use crate::xmin::{XminQueries, XminQueryPlan, XminStatus};
use async_trait::async_trait;
use duckdb::{Connection, Statement};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Alias the source database is attached under
const SOURCE_ALIAS: &str = "source_db";

/// Rows buffered between the DuckDB cursor and the reader
const ROW_CHANNEL_CAPACITY: usize = 1024;

/// Database engine using DuckDB
pub struct DatabaseEngine {
    conn: Arc<Mutex<Connection>>,
    kind: DatabaseEngineKind,
    attached: bool,
    connection_string: String,
}

impl DatabaseEngine {
    /// Open DuckDB and attach the configured database
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database(format!("Failed to create DuckDB connection: {e}")))?;
        let connection_string = config.connection_string();

        let mut engine = Self {
            conn: Arc::new(Mutex::new(conn)),
            kind: config.engine,
            attached: false,
            connection_string,
        };
        engine.attach_database()?;
        Ok(engine)
    }

    /// In-memory DuckDB database without an attached source
    pub fn in_memory() -> Result<Self> {
        Self::new(&DatabaseConfig::in_memory())
    }

    /// Attach external database to DuckDB
    fn attach_database(&mut self) -> Result<()> {
        let (extension, attach_type) = match self.kind {
            DatabaseEngineKind::Postgres => (Some("postgres"), "TYPE POSTGRES, READ_ONLY"),
            DatabaseEngineKind::Mysql => (Some("mysql"), "TYPE MYSQL, READ_ONLY"),
            DatabaseEngineKind::Sqlite => (Some("sqlite"), "TYPE SQLITE, READ_ONLY"),
            DatabaseEngineKind::Duckdb => {
                if self.connection_string == ":memory:" {
                    return Ok(());
                }
                (None, "READ_ONLY")
            }
        };

        let mut sql = String::new();
        if let Some(extension) = extension {
            sql.push_str(&format!("INSTALL {extension}; LOAD {extension}; "));
        }
        sql.push_str(&format!(
            "ATTACH {} AS {SOURCE_ALIAS} ({attach_type});",
            quote_literal(&self.connection_string)
        ));

        self.execute_batch(&sql)
            .map_err(|e| Error::database(format!("Failed to attach {}: {e}", self.kind)))?;
        self.attached = true;
        tracing::info!("Attached {} database as {SOURCE_ALIAS}", self.kind);
        Ok(())
    }

    /// Run one or more statements against the DuckDB connection
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::database("DuckDB connection lock poisoned"))?;
        conn.execute_batch(sql)
            .map_err(|e| Error::database(e.to_string()))
    }

    /// Test database connection
    pub async fn check_connection(&self) -> Result<()> {
        let query = match self.kind {
            DatabaseEngineKind::Postgres => "SELECT 1 FROM source_db.pg_catalog.pg_tables LIMIT 1",
            DatabaseEngineKind::Mysql => "SELECT 1 FROM source_db.information_schema.tables LIMIT 1",
            DatabaseEngineKind::Sqlite => "SELECT 1 FROM source_db.sqlite_master LIMIT 1",
            DatabaseEngineKind::Duckdb => "SELECT 1",
        };
        self.query_scalar(query.to_string())
            .await
            .map_err(|e| Error::database(format!("Connection check failed: {e}")))?;
        Ok(())
    }

    /// Fully qualified, quoted table name of a stream
    pub fn table_name(&self, stream: &StreamKey) -> String {
        let table = quote_ident(&stream.name);
        let schema = match (&stream.namespace, self.kind) {
            (Some(namespace), _) => Some(quote_ident(namespace)),
            (None, DatabaseEngineKind::Postgres) => Some(quote_ident("public")),
            (None, _) => None,
        };

        let local = match schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table,
        };
        if self.attached {
            format!("{SOURCE_ALIAS}.{local}")
        } else {
            local
        }
    }

    /// Database type
    pub fn kind(&self) -> DatabaseEngineKind {
        self.kind
    }

    /// Connection string for logging, password masked
    pub fn connection_info(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@') {
            if let Some(colon_pos) = self.connection_string[..at_pos].rfind(':') {
                let before_pass = &self.connection_string[..=colon_pos];
                let after_at = &self.connection_string[at_pos..];
                return format!("{before_pass}****{after_at}");
            }
        }
        self.connection_string.clone()
    }

    fn require_postgres(&self, what: &str) -> Result<()> {
        if self.kind == DatabaseEngineKind::Postgres && self.attached {
            Ok(())
        } else {
            Err(Error::config(format!(
                "{what} requires a postgres database, found {}",
                self.kind
            )))
        }
    }

    /// Run a statement inside the attached PostgreSQL database
    fn postgres_query(sql: &str) -> String {
        format!(
            "SELECT * FROM postgres_query('{SOURCE_ALIAS}', {})",
            quote_literal(sql)
        )
    }

    // ========================================================================
    // Query Execution
    // ========================================================================

    /// First column of the first row
    async fn query_scalar(&self, sql: String) -> Result<Value> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Value> {
            let conn = conn
                .lock()
                .map_err(|_| Error::database("DuckDB connection lock poisoned"))?;
            tracing::debug!("Executing query: {sql}");
            conn.query_row(&sql, [], |row| row.get::<_, duckdb::types::Value>(0))
                .map(duckdb_value_to_json)
                .map_err(|e| Error::database(e.to_string()))
        })
        .await
        .map_err(|e| Error::database(format!("Query task failed: {e}")))?
    }

    /// Stream rows of a query built on the connection
    ///
    /// Rows are read on a blocking thread and handed over through a bounded
    /// channel. Failures arrive as a query error for `stream`.
    fn query_rows<F>(&self, stream: &StreamKey, build_sql: F) -> RowStream
    where
        F: FnOnce(&Connection) -> duckdb::Result<String> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let conn = Arc::clone(&self.conn);
        let label = stream.to_string();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = scan_rows(&conn, build_sql, &tx) {
                tracing::debug!("Row scan for '{label}' failed: {e}");
                let _ = tx.blocking_send(Err(Error::query(label, e.to_string())));
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}

/// Read every row of the built query into the channel
///
/// Stops quietly once the reader is gone.
fn scan_rows<F>(
    conn: &Mutex<Connection>,
    build_sql: F,
    tx: &mpsc::Sender<Result<JsonObject>>,
) -> anyhow::Result<()>
where
    F: FnOnce(&Connection) -> duckdb::Result<String>,
{
    let conn = conn
        .lock()
        .map_err(|_| anyhow::anyhow!("DuckDB connection lock poisoned"))?;
    let sql = build_sql(&*conn)?;
    tracing::debug!("Executing query: {sql}");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let names = rows
        .as_ref()
        .map(Statement::column_names)
        .unwrap_or_default();

    while let Some(row) = rows.next()? {
        let mut record = JsonObject::new();
        for (index, name) in names.iter().enumerate() {
            let value: duckdb::types::Value = row.get(index)?;
            record.insert(name.clone(), duckdb_value_to_json(value));
        }
        if tx.blocking_send(Ok(record)).is_err() {
            tracing::debug!("Row reader dropped, stopping scan");
            return Ok(());
        }
    }
    Ok(())
}

/// Column names of a table, in table order
fn table_columns(conn: &Connection, table: &str) -> duckdb::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} LIMIT 0"))?;
    let rows = stmt.query([])?;
    Ok(rows
        .as_ref()
        .map(Statement::column_names)
        .unwrap_or_default())
}

/// Unambiguous text encoding of columns as one hash input
///
/// Each column renders as `N` when NULL, otherwise as `V<length>:<text>`, so
/// no two distinct rows share an encoding.
fn hash_input(columns: &[String]) -> String {
    let parts: Vec<String> = columns.iter().map(|c| hash_part(&quote_ident(c))).collect();
    format!("concat({})", parts.join(", "))
}

fn hash_part(column: &str) -> String {
    let text = format!("CAST({column} AS VARCHAR)");
    format!(
        "CASE WHEN {column} IS NULL THEN 'N' \
         ELSE 'V' || CAST(length({text}) AS VARCHAR) || ':' || {text} END"
    )
}

/// Fingerprinted scan of a table
///
/// Falls back to every column as the key when no primary key is known.
fn fingerprint_query(table: &str, columns: &[String], key_columns: &[String]) -> String {
    let key_columns = if key_columns.is_empty() {
        columns
    } else {
        key_columns
    };
    let select: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {}, md5({}) AS {KEY_HASH_COLUMN}, md5({}) AS {VALUE_HASH_COLUMN} FROM {table}",
        select.join(", "),
        hash_input(key_columns),
        hash_input(columns),
    )
}

// ============================================================================
// Strategy Collaborators
// ============================================================================

#[async_trait]
impl MagicSyncQueries for DatabaseEngine {
    async fn query_with_fingerprints(&self, stream: &ConfiguredStream) -> Result<RowStream> {
        let key = stream.key();
        let table = self.table_name(&key);
        let columns = stream.columns();
        let key_columns = stream.primary_key_columns();
        if key_columns.is_empty() {
            tracing::warn!("Stream '{key}' has no primary key, fingerprinting whole rows");
        }

        Ok(self.query_rows(&key, move |conn| {
            let columns = if columns.is_empty() {
                table_columns(conn, &table)?
            } else {
                columns
            };
            Ok(fingerprint_query(&table, &columns, &key_columns))
        }))
    }
}

#[async_trait]
impl XminQueries for DatabaseEngine {
    async fn current_xmin(&self) -> Result<XminStatus> {
        self.require_postgres("Xmin replication")?;
        let value = self
            .query_scalar(Self::postgres_query(
                "SELECT txid_snapshot_xmin(txid_current_snapshot())::bigint AS raw",
            ))
            .await?;
        let raw = value
            .as_i64()
            .ok_or_else(|| Error::database(format!("Unexpected snapshot xmin: {value}")))?;
        Ok(XminStatus::from_raw(raw))
    }

    async fn query_xmin(
        &self,
        stream: &ConfiguredStream,
        plan: &XminQueryPlan,
    ) -> Result<RowStream> {
        self.require_postgres("Xmin replication")?;
        let key = stream.key();
        let columns = stream.columns();
        let select = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let table = format!(
            "{}.{}",
            quote_ident(key.namespace_or("public")),
            quote_ident(&key.name)
        );

        let mut sql = format!("SELECT {select} FROM {table}");
        if let Some(predicate) = plan.predicate() {
            sql.push_str(&format!(" WHERE {predicate}"));
        }
        let sql = Self::postgres_query(&sql);
        Ok(self.query_rows(&key, move |_| Ok(sql)))
    }
}

#[async_trait]
impl TargetPositionSource<Lsn> for DatabaseEngine {
    async fn current_position(&self) -> Result<Lsn> {
        self.require_postgres("CDC target position")?;
        let value = self
            .query_scalar(Self::postgres_query(
                "SELECT pg_current_wal_flush_lsn()::text AS lsn",
            ))
            .await?;
        value
            .as_str()
            .ok_or_else(|| Error::position(format!("Unexpected flush LSN: {value}")))?
            .parse()
    }
}

// ============================================================================
// Value Conversion
// ============================================================================

/// Convert DuckDB Value to JSON Value
fn duckdb_value_to_json(value: duckdb::types::Value) -> Value {
    match value {
        duckdb::types::Value::Null => Value::Null,
        duckdb::types::Value::Boolean(b) => Value::Bool(b),
        duckdb::types::Value::TinyInt(i) => Value::Number(i.into()),
        duckdb::types::Value::SmallInt(i) => Value::Number(i.into()),
        duckdb::types::Value::Int(i) => Value::Number(i.into()),
        duckdb::types::Value::BigInt(i) => Value::Number(i.into()),
        duckdb::types::Value::HugeInt(i) => Value::String(i.to_string()),
        duckdb::types::Value::UTinyInt(i) => Value::Number(i.into()),
        duckdb::types::Value::USmallInt(i) => Value::Number(i.into()),
        duckdb::types::Value::UInt(i) => Value::Number(i.into()),
        duckdb::types::Value::UBigInt(i) => Value::Number(i.into()),
        duckdb::types::Value::Float(f) => {
            serde_json::Number::from_f64(f64::from(f)).map_or(Value::Null, Value::Number)
        }
        duckdb::types::Value::Double(f) => {
            serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
        }
        duckdb::types::Value::Text(s) => Value::String(s),
        duckdb::types::Value::Blob(b) => Value::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b,
        )),
        duckdb::types::Value::Timestamp(_, i) => {
            let secs = i / 1_000_000;
            let nsecs = ((i % 1_000_000) * 1000) as u32;
            chrono::DateTime::from_timestamp(secs, nsecs)
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()))
                .unwrap_or(Value::Number(i.into()))
        }
        duckdb::types::Value::Date32(d) => {
            // 719163 days from 1 CE to 1970-01-01
            chrono::NaiveDate::from_num_days_from_ce_opt(d + 719_163)
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Number(d.into()))
        }
        duckdb::types::Value::Time64(_, t) => {
            let secs = t / 1_000_000;
            let micros = t % 1_000_000;
            Value::String(format!(
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                micros
            ))
        }
        _ => Value::String(format!("{value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn users_stream(primary_key: Option<&str>) -> ConfiguredStream {
        let mut value = json!({
            "stream": {
                "name": "users",
                "json_schema": {
                    "type": "object",
                    "properties": {"id": {"type": "integer"}, "name": {"type": "string"}}
                }
            },
            "sync_mode": "incremental"
        });
        if let Some(pk) = primary_key {
            value["primary_key"] = json!([[pk]]);
        }
        serde_json::from_value(value).unwrap()
    }

    fn engine_with_users() -> DatabaseEngine {
        let engine = DatabaseEngine::in_memory().unwrap();
        engine
            .execute_batch(
                "CREATE TABLE users (id INTEGER, name VARCHAR);
                 INSERT INTO users VALUES (1, 'ada'), (2, NULL);",
            )
            .unwrap();
        engine
    }

    async fn collect(rows: RowStream) -> Vec<JsonObject> {
        rows.map(|row| row.unwrap()).collect().await
    }

    #[test]
    fn test_table_name() {
        let engine = DatabaseEngine::in_memory().unwrap();
        assert_eq!(engine.table_name(&StreamKey::new("users", None)), "\"users\"");
        assert_eq!(
            engine.table_name(&StreamKey::namespaced("main", "my\"table")),
            "\"main\".\"my\"\"table\""
        );
    }

    #[test]
    fn test_fingerprint_query_without_key_uses_all_columns() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let sql = fingerprint_query("\"users\"", &columns, &[]);
        assert_eq!(sql.matches(&hash_input(&columns)).count(), 2);
        assert!(sql.contains("WHEN \"name\" IS NULL THEN 'N'"));
    }

    #[tokio::test]
    async fn test_fingerprints_are_stable() {
        let engine = engine_with_users();
        let stream = users_stream(Some("id"));

        let first = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;
        let second = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);

        let ada = &first[0];
        assert_eq!(ada["id"], json!(1));
        assert_eq!(ada["name"], json!("ada"));
        assert_eq!(ada[KEY_HASH_COLUMN].as_str().unwrap().len(), 32);
        assert_ne!(ada[KEY_HASH_COLUMN], ada[VALUE_HASH_COLUMN]);
        assert_eq!(first[1]["name"], Value::Null);
    }

    #[tokio::test]
    async fn test_value_hash_follows_updates() {
        let engine = engine_with_users();
        let stream = users_stream(Some("id"));
        let before = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;

        engine
            .execute_batch("UPDATE users SET name = 'grace' WHERE id = 1")
            .unwrap();
        let after = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;

        let find = |rows: &[JsonObject], id: i64| {
            rows.iter().find(|r| r["id"] == json!(id)).unwrap().clone()
        };
        assert_eq!(find(&before, 1)[KEY_HASH_COLUMN], find(&after, 1)[KEY_HASH_COLUMN]);
        assert_ne!(
            find(&before, 1)[VALUE_HASH_COLUMN],
            find(&after, 1)[VALUE_HASH_COLUMN]
        );
        assert_eq!(find(&before, 2), find(&after, 2));
    }

    fn pair_stream() -> ConfiguredStream {
        serde_json::from_value(json!({
            "stream": {
                "name": "pairs",
                "json_schema": {
                    "type": "object",
                    "properties": {"id": {}, "a": {}, "b": {}}
                }
            },
            "primary_key": [["id"]],
            "sync_mode": "incremental"
        }))
        .unwrap()
    }

    async fn value_hash_after(engine: &DatabaseEngine, update: &str) -> (Value, Value) {
        let stream = pair_stream();
        let before = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;
        engine.execute_batch(update).unwrap();
        let after = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;
        assert_eq!(before[0][KEY_HASH_COLUMN], after[0][KEY_HASH_COLUMN]);
        (
            before[0][VALUE_HASH_COLUMN].clone(),
            after[0][VALUE_HASH_COLUMN].clone(),
        )
    }

    #[tokio::test]
    async fn test_value_hash_separates_columns() {
        let engine = DatabaseEngine::in_memory().unwrap();
        engine
            .execute_batch(
                "CREATE TABLE pairs (id INTEGER, a VARCHAR, b VARCHAR);
                 INSERT INTO pairs VALUES (1, 'x|y', 'z');",
            )
            .unwrap();

        let (before, after) =
            value_hash_after(&engine, "UPDATE pairs SET a = 'x', b = 'y|z' WHERE id = 1").await;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_value_hash_separates_null_from_text() {
        let engine = DatabaseEngine::in_memory().unwrap();
        engine
            .execute_batch(
                "CREATE TABLE pairs (id INTEGER, a VARCHAR, b VARCHAR);
                 INSERT INTO pairs VALUES (1, NULL, 'z');",
            )
            .unwrap();

        let (before, after) =
            value_hash_after(&engine, "UPDATE pairs SET a = '\\N' WHERE id = 1").await;
        assert_ne!(before, after);

        let (before, after) =
            value_hash_after(&engine, "UPDATE pairs SET a = 'N' WHERE id = 1").await;
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_columns_discovered_without_schema() {
        let engine = engine_with_users();
        let stream: ConfiguredStream =
            serde_json::from_value(json!({"stream": {"name": "users"}})).unwrap();

        let rows = collect(engine.query_with_fingerprints(&stream).await.unwrap()).await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains_key("id"));
        assert!(rows[0].contains_key("name"));
    }

    #[tokio::test]
    async fn test_missing_table_is_query_error() {
        let engine = DatabaseEngine::in_memory().unwrap();
        let mut rows = engine
            .query_with_fingerprints(&users_stream(Some("id")))
            .await
            .unwrap();

        let err = rows.next().await.unwrap().unwrap_err();
        assert!(!err.is_fatal());
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn test_postgres_only_queries_rejected() {
        let engine = DatabaseEngine::in_memory().unwrap();
        assert!(matches!(
            engine.current_xmin().await,
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            engine.current_position().await,
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_check_connection() {
        let engine = DatabaseEngine::in_memory().unwrap();
        engine.check_connection().await.unwrap();
    }

    #[test]
    fn test_postgres_query_escapes_quotes() {
        assert_eq!(
            DatabaseEngine::postgres_query("SELECT 'x'"),
            "SELECT * FROM postgres_query('source_db', 'SELECT ''x''')"
        );
    }

    #[test]
    fn test_duckdb_value_to_json() {
        assert_eq!(duckdb_value_to_json(duckdb::types::Value::Null), Value::Null);
        assert_eq!(
            duckdb_value_to_json(duckdb::types::Value::Boolean(true)),
            Value::Bool(true)
        );
        assert_eq!(
            duckdb_value_to_json(duckdb::types::Value::Int(42)),
            Value::Number(42.into())
        );
        assert_eq!(
            duckdb_value_to_json(duckdb::types::Value::Blob(vec![1, 2, 3])),
            Value::String("AQID".to_string())
        );
        assert_eq!(
            duckdb_value_to_json(duckdb::types::Value::Text("hello".to_string())),
            Value::String("hello".to_string())
        );
    }
}
