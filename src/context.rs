//! The public entry point: a [`SyncContext`] wrapped around one SQLite
//! connection.
//!
//! The context owns the connection for its lifetime. The host keeps full
//! SQL access through [`SyncContext::connection`] and reports its committed
//! row mutations through the `track_*` methods; replicas exchange state as
//! binary payloads via [`SyncContext::encode_payload`] and
//! [`SyncContext::apply_payload`]. Commit and rollback hooks keep the
//! version clock aligned with the host's transaction boundaries, so marks
//! inside one host transaction share a database version.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::db;
use crate::error::{Error, Result};
use crate::payload::{self, ApplyReport, EncodedPayload, Watermark};
use crate::pk::encode_pk;
use crate::registry::{TableAlgo, TableInfo, TableRegistry};
use crate::tracker;
use crate::types::{SiteId, Value, SENTINEL_COLUMN};

/// Replication engine state bound to one connection.
pub struct SyncContext {
    conn: Connection,
    config: SyncConfig,
    clock: Arc<Clock>,
    registry: TableRegistry,
    pending_alters: Mutex<HashMap<String, Arc<TableInfo>>>,
}

impl SyncContext {
    /// Attach to a connection with default settings, creating the
    /// bookkeeping tables and the site identity on first use.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_config(conn, SyncConfig::default())
    }

    pub fn with_config(conn: Connection, config: SyncConfig) -> Result<Self> {
        db::bootstrap(&conn)?;
        let clock = Arc::new(Clock::load(&conn)?);
        let registry = TableRegistry::load(&conn)?;
        install_hooks(&conn, &clock);
        tracing::info!("sync context ready (site={})", clock.site_id());
        Ok(Self {
            conn,
            config,
            clock,
            registry,
            pending_alters: Mutex::new(HashMap::new()),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// The wrapped connection, for the host's own SQL. Host transactions on
    /// it are honored: engine writes join an open transaction instead of
    /// committing on their own.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Detach and hand the connection back, removing the transaction hooks.
    pub fn into_connection(self) -> Connection {
        remove_hooks(&self.conn);
        self.conn
    }

    // ---- table lifecycle ----

    /// Start replicating `name` using the configured defaults. Pre-existing
    /// rows are backfilled as local inserts. Idempotent.
    pub fn init_table(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.init_table_with(name, self.config.default_algo, self.config.skip_int_pk_check)
    }

    /// Start replicating `name` with an explicit algorithm and key policy.
    pub fn init_table_with(
        &self,
        name: &str,
        algo: TableAlgo,
        skip_int_pk_check: bool,
    ) -> Result<Arc<TableInfo>> {
        db::in_txn(&self.conn, |conn| {
            let info = self.registry.register(conn, name, algo, skip_int_pk_check)?;
            tracker::backfill(conn, &self.clock, &info)?;
            Ok(info)
        })
    }

    /// Stop replicating `name` and drop its metadata. User data stays.
    pub fn cleanup_table(&self, name: &str) -> Result<()> {
        db::in_txn(&self.conn, |conn| self.registry.remove(conn, name))
    }

    /// Full uninstall: drop every table's metadata and the global
    /// bookkeeping tables, then hand back the bare connection.
    pub fn cleanup_all(self) -> Result<Connection> {
        db::in_txn(&self.conn, |conn| {
            for info in self.registry.tables() {
                self.registry.remove(conn, &info.name)?;
            }
            db::teardown(conn)
        })?;
        tracing::info!("sync state removed from database");
        Ok(self.into_connection())
    }

    /// Suspend or resume local-mutation tracking for a table. While
    /// disabled, `track_*` calls are silent no-ops (bulk loads); merges and
    /// encoding keep working.
    pub fn set_table_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(&self.conn, name, enabled)
    }

    pub fn table_info(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.registry.lookup(name)
    }

    /// Every replicated table, sorted by name.
    pub fn tables(&self) -> Vec<Arc<TableInfo>> {
        self.registry.tables()
    }

    // ---- mutation tracking ----

    /// Report a committed row insertion.
    pub fn track_insert(&self, table: &str, key: &[Value]) -> Result<()> {
        let Some(info) = self.tracking_target(table)? else { return Ok(()) };
        let pk = encode_pk(key)?;
        db::in_txn(&self.conn, |conn| tracker::mark_insert(conn, &self.clock, &info, &pk))
    }

    /// Report a committed update of one column.
    pub fn track_update(&self, table: &str, key: &[Value], column: &str) -> Result<()> {
        let Some(info) = self.tracking_target(table)? else { return Ok(()) };
        let pk = encode_pk(key)?;
        db::in_txn(&self.conn, |conn| {
            tracker::mark_update(conn, &self.clock, &info, &pk, column)
        })
    }

    /// Report a committed row deletion.
    pub fn track_delete(&self, table: &str, key: &[Value]) -> Result<()> {
        let Some(info) = self.tracking_target(table)? else { return Ok(()) };
        let pk = encode_pk(key)?;
        db::in_txn(&self.conn, |conn| tracker::mark_delete(conn, &self.clock, &info, &pk))
    }

    /// Report a committed primary-key change.
    pub fn track_move(&self, table: &str, old_key: &[Value], new_key: &[Value]) -> Result<()> {
        let Some(info) = self.tracking_target(table)? else { return Ok(()) };
        let old = encode_pk(old_key)?;
        let new = encode_pk(new_key)?;
        db::in_txn(&self.conn, |conn| {
            tracker::mark_move(conn, &self.clock, &info, &old, &new)
        })
    }

    fn tracking_target(&self, table: &str) -> Result<Option<Arc<TableInfo>>> {
        let info = self.registry.lookup(table)?;
        if !info.enabled {
            tracing::debug!("tracking disabled for {}, mutation ignored", table);
            return Ok(None);
        }
        Ok(Some(info))
    }

    // ---- payload exchange ----

    /// Encode every change past `since` into one payload blob.
    pub fn encode_payload(&self, since: Watermark) -> Result<EncodedPayload> {
        payload::encode(
            &self.conn,
            &self.registry,
            &self.clock,
            self.config.payload_row_limit,
            since,
        )
    }

    /// Encode like [`SyncContext::encode_payload`] and write the blob to a
    /// file.
    #[cfg(not(target_family = "wasm"))]
    pub fn encode_payload_to_file(
        &self,
        path: impl AsRef<Path>,
        since: Watermark,
    ) -> Result<EncodedPayload> {
        let encoded = self.encode_payload(since)?;
        std::fs::write(path, &encoded.blob)?;
        Ok(encoded)
    }

    /// Apply a payload received from a peer. Atomic: on error nothing of it
    /// remains applied (when called inside a host transaction, the host
    /// must roll back).
    pub fn apply_payload(&self, blob: &[u8]) -> Result<ApplyReport> {
        payload::apply(&self.conn, &self.registry, &self.clock, blob)
    }

    // ---- versioning and identity ----

    /// Current database version (0 until the first tracked change).
    pub fn db_version(&self) -> Result<i64> {
        self.clock.current_db_version(&self.conn)
    }

    /// Allocate and persist the next database version, past `merging` when
    /// given. Joins the host transaction when one is open, otherwise runs
    /// in its own.
    pub fn next_db_version(&self, merging: Option<i64>) -> Result<i64> {
        db::in_txn(&self.conn, |conn| self.clock.next_db_version(conn, merging))
    }

    /// Next intra-transaction ordinal.
    pub fn bump_seq(&self) -> i64 {
        self.clock.bump_seq()
    }

    pub fn site_id(&self) -> SiteId {
        self.clock.site_id()
    }

    /// Abandon the current site identity and start a fresh one, after the
    /// local database was restored or copied (see [`Error::IdentityReset`]).
    pub fn reset_site_id(&self) -> Result<SiteId> {
        self.clock.reset_site_id(&self.conn)
    }

    /// Whether local history already covers `target` (a peer's database
    /// version).
    pub fn is_caught_up(&self, target: i64) -> Result<bool> {
        Ok(self.db_version()? >= target)
    }

    // ---- settings ----

    /// Store a host key/value pair alongside the sync state. Keys the
    /// engine uses internally are refused.
    pub fn set_sync_key(&self, key: &str, value: &Value) -> Result<()> {
        self.check_reserved(key)?;
        db::config_set(&self.conn, key, value)
    }

    pub fn sync_key(&self, key: &str) -> Result<Option<Value>> {
        self.check_reserved(key)?;
        db::config_get(&self.conn, key)
    }

    pub fn clear_sync_key(&self, key: &str) -> Result<()> {
        self.check_reserved(key)?;
        db::config_delete(&self.conn, key)
    }

    fn check_reserved(&self, key: &str) -> Result<()> {
        if db::RESERVED_KEYS.contains(&key) {
            return Err(Error::InvalidState(format!("sync key {key} is reserved")));
        }
        Ok(())
    }

    // ---- schema management ----

    /// The stored schema fingerprint, if one was computed.
    pub fn schema_hash(&self) -> Result<Option<i64>> {
        Ok(match db::config_get(&self.conn, db::KEY_SCHEMA_HASH)? {
            Some(Value::Integer(h)) => Some(h),
            _ => None,
        })
    }

    /// Recompute and store the schema fingerprint: a crc32 over the
    /// registered tables' declared SQL. Peers compare fingerprints before
    /// exchanging payloads to detect schema drift cheaply.
    pub fn update_schema_hash(&self) -> Result<i64> {
        let mut hasher = crc32fast::Hasher::new();
        for info in self.registry.tables() {
            hasher.update(info.name.as_bytes());
            hasher.update(info.sql.as_bytes());
        }
        let hash = hasher.finalize() as i64;
        db::config_set(&self.conn, db::KEY_SCHEMA_HASH, &Value::Integer(hash))?;
        Ok(hash)
    }

    /// Bracket a host `ALTER TABLE`: snapshot the current shape, run the
    /// DDL, then call [`SyncContext::commit_alter`].
    pub fn begin_alter(&self, table: &str) -> Result<()> {
        let info = self.registry.lookup(table)?;
        self.pending_alters.lock().insert(table.to_string(), info);
        Ok(())
    }

    /// Finish an alter bracket: reconcile metadata with the new shape
    /// (dropped columns lose their metadata, a changed key shape is
    /// refused) and refresh the cached table info. On failure the bracket
    /// stays open so the call can be retried.
    pub fn commit_alter(&self, table: &str) -> Result<Arc<TableInfo>> {
        let before = self
            .pending_alters
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no alter in progress for table {table}")))?;
        let info = db::in_txn(&self.conn, |conn| self.registry.refresh_after_alter(conn, &before))?;
        self.pending_alters.lock().remove(table);
        Ok(info)
    }

    // ---- maintenance ----

    /// Garbage-collect tombstones settled before `older_than_version`
    /// (a local database version): each such row's sentinel and dormant
    /// column metadata are deleted. Returns the number of rows purged.
    ///
    /// Purged tombstones no longer ship, so only purge versions every peer
    /// has already seen.
    pub fn purge_tombstones(&self, table: &str, older_than_version: i64) -> Result<usize> {
        let info = self.registry.lookup(table)?;
        db::in_txn(&self.conn, |conn| {
            let count: i64 = conn
                .prepare_cached(&format!(
                    "SELECT count(*) FROM {} WHERE col_name = ?1 AND alive = 0 AND local_version < ?2",
                    info.quoted_meta()
                ))?
                .query_row(rusqlite::params![SENTINEL_COLUMN, older_than_version], |row| row.get(0))?;
            if count > 0 {
                conn.prepare_cached(&format!(
                    "DELETE FROM {meta} WHERE pk IN (
                        SELECT pk FROM {meta} WHERE col_name = ?1 AND alive = 0 AND local_version < ?2
                    )",
                    meta = info.quoted_meta()
                ))?
                .execute(rusqlite::params![SENTINEL_COLUMN, older_than_version])?;
                tracing::info!("purged {} tombstoned rows from {}", count, info.name);
            }
            Ok(count as usize)
        })
    }
}

fn install_hooks(conn: &Connection, clock: &Arc<Clock>) {
    let on_commit = clock.clone();
    conn.commit_hook(Some(move || {
        on_commit.end_tx(false);
        false
    }));
    let on_rollback = clock.clone();
    conn.rollback_hook(Some(move || on_rollback.end_tx(true)));
}

fn remove_hooks(conn: &Connection) {
    conn.commit_hook(None::<fn() -> bool>);
    conn.rollback_hook(None::<fn()>);
}
