//! Bookkeeping schema and small storage helpers.
//!
//! Two global tables back every sync context:
//! - `__sync_config`: key/value store holding the site identity, the
//!   database version counter, the schema hash and user-defined sync keys.
//! - `__sync_tables`: the durable registry of tracked tables.
//!
//! Per-table CRDT metadata lives in `{table}__sync_meta` side tables, owned
//! by the registry.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::Value;

/// Name of the key/value bookkeeping table.
pub const CONFIG_TABLE: &str = "__sync_config";
/// Name of the durable table registry.
pub const TABLES_TABLE: &str = "__sync_tables";
/// Suffix appended to a tracked table's name to form its metadata table.
pub const META_SUFFIX: &str = "__sync_meta";

pub(crate) const KEY_SITE_ID: &str = "site_id";
pub(crate) const KEY_DB_VERSION: &str = "db_version";
pub(crate) const KEY_SCHEMA_HASH: &str = "schema_hash";

/// Keys managed by the crate itself; refused through the sync-key API.
pub(crate) const RESERVED_KEYS: [&str; 3] = [KEY_SITE_ID, KEY_DB_VERSION, KEY_SCHEMA_HASH];

/// Create the global bookkeeping tables if they do not exist yet.
pub(crate) fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS __sync_config (
            key TEXT PRIMARY KEY,
            value
        );
        CREATE TABLE IF NOT EXISTS __sync_tables (
            name TEXT PRIMARY KEY,
            algo TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );",
    )?;
    Ok(())
}

/// Drop the global bookkeeping tables (full uninstall).
pub(crate) fn teardown(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS __sync_config;
         DROP TABLE IF EXISTS __sync_tables;",
    )?;
    Ok(())
}

pub(crate) fn config_get(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let value = conn
        .prepare_cached("SELECT value FROM __sync_config WHERE key = ?1")?
        .query_row(params![key], |row| row.get::<_, Value>(0))
        .optional()?;
    Ok(value)
}

pub(crate) fn config_set(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO __sync_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )?
    .execute(params![key, value])?;
    Ok(())
}

pub(crate) fn config_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.prepare_cached("DELETE FROM __sync_config WHERE key = ?1")?
        .execute(params![key])?;
    Ok(())
}

/// Run `f` atomically: inside the host's transaction when one is already
/// open, otherwise inside a fresh one committed on success and rolled back
/// on error.
pub(crate) fn in_txn<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    if conn.is_autocommit() {
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    } else {
        f(conn)
    }
}

/// Double-quote an SQL identifier, escaping embedded quotes.
///
/// Tracked table and column names come from the host and are interpolated
/// into DDL and metadata statements, so every interpolation goes through
/// here.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
