//! Tracked-table registry.
//!
//! A table becomes replicable when it is registered: its primary-key shape
//! is validated, a `{table}__sync_meta` side table is created for CRDT
//! metadata, and the registration is persisted in `__sync_tables` so it
//! survives restarts. The in-memory cache mirrors the persisted state and
//! hands out immutable [`TableInfo`] snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{quote_ident, META_SUFFIX};
use crate::error::{Error, Result};

/// Conflict-resolution algorithm assigned to a tracked table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableAlgo {
    /// Full insert/update/delete lifecycle with causal-length semantics.
    CausalLengthSet,
    /// Insert/update only; deletes are refused locally and rejected on merge.
    GrowOnlySet,
}

impl TableAlgo {
    /// Parse the persisted/wire name (`"cls"` or `"gos"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cls" => Some(TableAlgo::CausalLengthSet),
            "gos" => Some(TableAlgo::GrowOnlySet),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TableAlgo::CausalLengthSet => "cls",
            TableAlgo::GrowOnlySet => "gos",
        }
    }
}

impl fmt::Display for TableAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable snapshot of one registered table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub algo: TableAlgo,
    pub enabled: bool,
    /// Primary-key columns in declared key order.
    pub pk_cols: Vec<String>,
    /// Non-key data columns in declaration order.
    pub data_cols: Vec<String>,
    /// The table's declared SQL, as recorded in `sqlite_master`.
    pub sql: String,
}

impl TableInfo {
    /// Name of the metadata side table.
    pub fn meta_table(&self) -> String {
        format!("{}{}", self.name, META_SUFFIX)
    }

    pub fn is_pk_column(&self, col: &str) -> bool {
        self.pk_cols.iter().any(|c| c == col)
    }

    pub fn has_data_column(&self, col: &str) -> bool {
        self.data_cols.iter().any(|c| c == col)
    }

    pub(crate) fn quoted(&self) -> String {
        quote_ident(&self.name)
    }

    pub(crate) fn quoted_meta(&self) -> String {
        quote_ident(&self.meta_table())
    }

    /// `"k1" = ? AND "k2" = ?` over the key columns, for dynamic statements
    /// that bind key values positionally.
    pub(crate) fn pk_predicate(&self) -> String {
        self.pk_cols
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// `"k1", "k2"` over the key columns.
    pub(crate) fn pk_list(&self) -> String {
        self.pk_cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `?, ?` matching [`TableInfo::pk_list`].
    pub(crate) fn pk_placeholders(&self) -> String {
        vec!["?"; self.pk_cols.len()].join(", ")
    }
}

/// In-memory cache over `__sync_tables`, keyed by table name.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
}

impl TableRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from the persisted registry. Tables that
    /// disappeared from the schema since registration are skipped with a
    /// warning; their registry rows stay untouched.
    pub(crate) fn load(conn: &Connection) -> Result<Self> {
        let registry = Self::new();
        let mut stmt = conn.prepare("SELECT name, algo, enabled FROM __sync_tables ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
            ))
        })?;
        for row in rows {
            let (name, algo_name, enabled) = row?;
            let algo = TableAlgo::from_name(&algo_name).ok_or_else(|| {
                Error::InvalidState(format!("table {name} registered with unknown algo {algo_name}"))
            })?;
            match introspect(conn, &name) {
                Ok((pk_cols, data_cols, sql)) => {
                    let info = TableInfo { name: name.clone(), algo, enabled, pk_cols, data_cols, sql };
                    registry.tables.write().insert(name, Arc::new(info));
                }
                Err(Error::NotFound(_)) => {
                    tracing::warn!("registered table {} no longer exists, skipping", name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(registry)
    }

    /// Register `name` for replication: validate the key shape, create the
    /// metadata table and persist the registration. Re-registering with the
    /// same algorithm is a no-op returning the cached snapshot.
    pub(crate) fn register(
        &self,
        conn: &Connection,
        name: &str,
        algo: TableAlgo,
        skip_int_pk_check: bool,
    ) -> Result<Arc<TableInfo>> {
        if let Some(existing) = self.tables.read().get(name) {
            if existing.algo != algo {
                return Err(Error::InvalidState(format!(
                    "table {} already tracked with algo {}",
                    name, existing.algo
                )));
            }
            return Ok(existing.clone());
        }

        let (pk_cols, data_cols, sql) = introspect(conn, name)?;
        validate_pk(conn, name, &pk_cols, skip_int_pk_check)?;

        create_meta_table(conn, name)?;
        conn.prepare_cached(
            "INSERT INTO __sync_tables (name, algo, enabled) VALUES (?1, ?2, 1)
             ON CONFLICT(name) DO UPDATE SET algo = excluded.algo",
        )?
        .execute(params![name, algo.name()])?;

        let info = Arc::new(TableInfo {
            name: name.to_string(),
            algo,
            enabled: true,
            pk_cols,
            data_cols,
            sql,
        });
        tracing::info!(
            "registered table {} (algo={}, key_cols={}, data_cols={})",
            name,
            algo,
            info.pk_cols.len(),
            info.data_cols.len()
        );
        self.tables.write().insert(name.to_string(), info.clone());
        Ok(info)
    }

    /// Snapshot of a registered table, or `NotFound`.
    pub fn lookup(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table {name} is not tracked")))
    }

    /// All registered tables, sorted by name for deterministic iteration.
    pub fn tables(&self) -> Vec<Arc<TableInfo>> {
        let mut out: Vec<_> = self.tables.read().values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Flip local-mutation tracking for a table and persist the flag.
    pub(crate) fn set_enabled(&self, conn: &Connection, name: &str, enabled: bool) -> Result<()> {
        let current = self.lookup(name)?;
        conn.prepare_cached("UPDATE __sync_tables SET enabled = ?1 WHERE name = ?2")?
            .execute(params![enabled as i64, name])?;
        let mut info = (*current).clone();
        info.enabled = enabled;
        self.tables.write().insert(name.to_string(), Arc::new(info));
        tracing::info!("table {} tracking {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Forget a table: drop its metadata table and registry row. The user
    /// table itself is untouched.
    pub(crate) fn remove(&self, conn: &Connection, name: &str) -> Result<()> {
        let info = self.lookup(name)?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", info.quoted_meta()))?;
        conn.prepare_cached("DELETE FROM __sync_tables WHERE name = ?1")?
            .execute(params![name])?;
        self.tables.write().remove(name);
        tracing::info!("removed table {} from tracking", name);
        Ok(())
    }

    /// Re-introspect a table after host DDL and reconcile metadata:
    /// metadata of dropped data columns is deleted, added columns simply
    /// start tracking from their next mutation. A changed primary-key shape
    /// is refused, since stored key encodings would no longer match.
    pub(crate) fn refresh_after_alter(
        &self,
        conn: &Connection,
        old: &TableInfo,
    ) -> Result<Arc<TableInfo>> {
        let (pk_cols, data_cols, sql) = introspect(conn, &old.name)?;
        if pk_cols != old.pk_cols {
            return Err(Error::InvalidState(format!(
                "primary key of {} changed from ({}) to ({})",
                old.name,
                old.pk_cols.join(", "),
                pk_cols.join(", ")
            )));
        }

        let removed: Vec<&String> =
            old.data_cols.iter().filter(|c| !data_cols.contains(c)).collect();
        for col in &removed {
            let n = conn.execute(
                &format!("DELETE FROM {} WHERE col_name = ?1", old.quoted_meta()),
                params![col],
            )?;
            tracing::debug!("dropped {} metadata rows of removed column {}.{}", n, old.name, col);
        }

        let info = Arc::new(TableInfo {
            name: old.name.clone(),
            algo: old.algo,
            enabled: old.enabled,
            pk_cols,
            data_cols,
            sql,
        });
        self.tables.write().insert(old.name.clone(), info.clone());
        Ok(info)
    }
}

/// Column layout of `name`: key columns in key order, data columns in
/// declaration order, and the declared SQL.
fn introspect(conn: &Connection, name: &str) -> Result<(Vec<String>, Vec<String>, String)> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
    let mut pk: Vec<(i64, String)> = Vec::new();
    let mut data: Vec<String> = Vec::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>("name")?, row.get::<_, i64>("pk")?))
    })?;
    for row in rows {
        let (col, pk_ord) = row?;
        if pk_ord > 0 {
            pk.push((pk_ord, col));
        } else {
            data.push(col);
        }
    }
    if pk.is_empty() && data.is_empty() {
        return Err(Error::NotFound(format!("table {name} does not exist")));
    }
    pk.sort_by_key(|(ord, _)| *ord);

    let sql: String = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_default();

    Ok((pk.into_iter().map(|(_, c)| c).collect(), data, sql))
}

fn validate_pk(conn: &Connection, name: &str, pk_cols: &[String], skip_int_pk_check: bool) -> Result<()> {
    if pk_cols.is_empty() {
        return Err(Error::UnsupportedKeyType(format!(
            "table {name} has no declared primary key; rowid-addressed rows cannot be identified across replicas"
        )));
    }
    if pk_cols.len() == 1 && !skip_int_pk_check {
        // A single column declared exactly INTEGER aliases the rowid, and
        // independently auto-assigned rowids collide across replicas.
        let decl: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT type FROM pragma_table_info({}) WHERE name = ?1",
                    quote_ident_literal(name)
                ),
                params![&pk_cols[0]],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(decl) = decl {
            if decl.trim().eq_ignore_ascii_case("INTEGER") {
                return Err(Error::UnsupportedKeyType(format!(
                    "table {name} uses a single INTEGER primary key (rowid alias); pass skip_int_pk_check to accept it anyway"
                )));
            }
        }
    }
    Ok(())
}

/// Single-quote a string literal for use as a pragma function argument.
fn quote_ident_literal(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

fn create_meta_table(conn: &Connection, name: &str) -> Result<()> {
    let meta = quote_ident(&format!("{name}{META_SUFFIX}"));
    let idx = quote_ident(&format!("{name}{META_SUFFIX}_version_idx"));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {meta} (
            pk BLOB NOT NULL,
            col_name TEXT NOT NULL,
            cl INTEGER NOT NULL DEFAULT 0,
            col_version INTEGER NOT NULL DEFAULT 1,
            db_version INTEGER NOT NULL,
            site_id BLOB NOT NULL,
            seq INTEGER NOT NULL DEFAULT 0,
            local_version INTEGER NOT NULL,
            alive INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (pk, col_name)
        );
        CREATE INDEX IF NOT EXISTS {idx} ON {meta} (local_version, seq);"
    ))?;
    Ok(())
}
