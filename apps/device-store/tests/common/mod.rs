//! Common test utilities for integration tests.
//!
//! - TestContext: an on-disk store in a temporary directory
//! - Schema fingerprints for comparing upgraded and fresh stores
//! - Builders for legacy stores at a given schema version

#![allow(dead_code)]

pub mod fixtures;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;

use flow_device_store::db::{migration, schema, ConnectionManager, SurveyStore};

/// Store file in a temporary directory, removed when the context drops.
pub struct TestContext {
    _dir: TempDir,
    pub path: PathBuf,
    pub connections: Arc<ConnectionManager>,
    pub store: SurveyStore,
}

impl TestContext {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("surveydata.db");
        let connections = ConnectionManager::new(&path);
        let store = SurveyStore::new(connections.open().expect("Failed to open store"));
        Self {
            _dir: dir,
            path,
            connections,
            store,
        }
    }

    /// A second, independent store handle on the same file.
    pub fn another_store(&self) -> SurveyStore {
        SurveyStore::new(self.connections.open().expect("Failed to open store"))
    }
}

/// Per-table structure: stored DDL, sorted columns and indexes.
#[derive(Debug, PartialEq, Eq)]
pub struct TableShape {
    /// Normalised `CREATE TABLE` text, so conflict clauses and constraints are compared too.
    pub sql: String,
    /// (name, type, notnull, default, pk)
    pub columns: Vec<(String, String, bool, Option<String>, i64)>,
    /// (name for explicit indexes, unique, indexed columns, normalised DDL)
    pub indexes: Vec<(Option<String>, bool, Vec<String>, Option<String>)>,
}

/// Collapse whitespace and drop quoting and `IF NOT EXISTS`, which SQLite
/// may or may not keep depending on how the object was created.
pub fn normalise_sql(sql: &str) -> String {
    sql.replace('"', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("IF NOT EXISTS ", "")
}

fn stored_sql(conn: &Connection, kind: &str, name: &str) -> Option<String> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = ?1 AND name = ?2",
        [kind, name],
        |row| row.get::<_, Option<String>>(0),
    )
    .unwrap()
    .map(|sql| normalise_sql(&sql))
}

/// Structural description of every user table in a store.
pub fn schema_fingerprint(conn: &Connection) -> BTreeMap<String, TableShape> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .unwrap();
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();

    tables
        .into_iter()
        .map(|table| {
            let shape = table_shape(conn, &table);
            (table, shape)
        })
        .collect()
}

fn table_shape(conn: &Connection, table: &str) -> TableShape {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .unwrap();
    let mut columns: Vec<(String, String, bool, Option<String>, i64)> = stmt
        .query_map([], |row| {
            Ok((row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
        })
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    columns.sort();

    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table})"))
        .unwrap();
    let listed: Vec<(String, bool, String)> = stmt
        .query_map([], |row| Ok((row.get(1)?, row.get(2)?, row.get(3)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();

    let mut indexes: Vec<(Option<String>, bool, Vec<String>, Option<String>)> = listed
        .into_iter()
        .map(|(name, unique, origin)| {
            let mut stmt = conn
                .prepare(&format!("PRAGMA index_info({name})"))
                .unwrap();
            let cols: Vec<String> = stmt
                .query_map([], |row| row.get(2))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap();
            let sql = stored_sql(conn, "index", &name);
            // Autoindex names depend on creation history.
            let name = (origin == "c").then_some(name);
            (name, unique, cols, sql)
        })
        .collect();
    indexes.sort();

    let sql = stored_sql(conn, "table", table).unwrap_or_default();
    TableShape {
        sql,
        columns,
        indexes,
    }
}

/// In-memory store with the launch schema, upgraded to `version`.
pub fn legacy_store_at(version: i32) -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(schema::LEGACY_LAUNCH_SCHEMA).unwrap();
    conn.execute_batch(&format!("PRAGMA user_version = {}", schema::VER_LAUNCH))
        .unwrap();
    if version > schema::VER_LAUNCH {
        migration::upgrade(&mut conn, schema::VER_LAUNCH, version).unwrap();
    }
    conn
}

/// In-memory store created fresh at the current version.
pub fn fresh_store() -> Connection {
    let mut conn = Connection::open_in_memory().unwrap();
    migration::initialize(&mut conn).unwrap();
    conn
}
