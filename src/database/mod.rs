//! Database connectivity via DuckDB
//!
//! DuckDB attaches PostgreSQL, MySQL, SQLite or DuckDB files and serves the
//! row scans the incremental strategies need.

mod engine;

pub use engine::DatabaseEngine;
