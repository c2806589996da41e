//! Row-level access to the `{table}__sync_meta` side tables.
//!
//! One metadata row per (encoded key, column), with the per-row sentinel
//! stored under [`SENTINEL_COLUMN`]. The stored `col_version`/`db_version`/
//! `site_id`/`seq` always describe the ORIGIN of the record that landed
//! here; `local_version` is the local encode watermark and never takes part
//! in conflict comparison.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::registry::TableInfo;
use crate::types::{SiteId, VersionKey, SENTINEL_COLUMN};

/// One row of a metadata side table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MetaRow {
    pub cl: i64,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: SiteId,
    pub seq: i64,
    pub local_version: i64,
    pub alive: bool,
}

impl MetaRow {
    /// Conflict-ordering key of the stored record.
    pub fn version(&self) -> VersionKey {
        VersionKey {
            col_version: self.col_version,
            db_version: self.db_version,
            site_id: self.site_id,
        }
    }
}

pub(crate) fn get(conn: &Connection, info: &TableInfo, pk: &[u8], col: &str) -> Result<Option<MetaRow>> {
    let sql = format!(
        "SELECT cl, col_version, db_version, site_id, seq, local_version, alive
         FROM {} WHERE pk = ?1 AND col_name = ?2",
        info.quoted_meta()
    );
    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![pk, col], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)? != 0,
            ))
        })
        .optional()?;
    match row {
        None => Ok(None),
        Some((cl, col_version, db_version, site, seq, local_version, alive)) => Ok(Some(MetaRow {
            cl,
            col_version,
            db_version,
            site_id: SiteId::from_slice(&site)?,
            seq,
            local_version,
            alive,
        })),
    }
}

/// Shorthand for the row-lifecycle sentinel of `pk`.
pub(crate) fn sentinel(conn: &Connection, info: &TableInfo, pk: &[u8]) -> Result<Option<MetaRow>> {
    get(conn, info, pk, SENTINEL_COLUMN)
}

pub(crate) fn upsert(
    conn: &Connection,
    info: &TableInfo,
    pk: &[u8],
    col: &str,
    row: &MetaRow,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (pk, col_name, cl, col_version, db_version, site_id, seq, local_version, alive)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(pk, col_name) DO UPDATE SET
            cl = excluded.cl,
            col_version = excluded.col_version,
            db_version = excluded.db_version,
            site_id = excluded.site_id,
            seq = excluded.seq,
            local_version = excluded.local_version,
            alive = excluded.alive",
        info.quoted_meta()
    );
    conn.prepare_cached(&sql)?.execute(params![
        pk,
        col,
        row.cl,
        row.col_version,
        row.db_version,
        row.site_id.as_bytes().as_slice(),
        row.seq,
        row.local_version,
        row.alive as i64,
    ])?;
    Ok(())
}

/// Remove every metadata row of one tracked row. Returns the count removed.
pub(crate) fn drop_all(conn: &Connection, info: &TableInfo, pk: &[u8]) -> Result<usize> {
    let sql = format!("DELETE FROM {} WHERE pk = ?1", info.quoted_meta());
    Ok(conn.prepare_cached(&sql)?.execute(params![pk])?)
}

/// Re-key every metadata row of `old_pk` to `new_pk`. The caller clears any
/// metadata already stored under `new_pk` first.
pub(crate) fn rekey(conn: &Connection, info: &TableInfo, old_pk: &[u8], new_pk: &[u8]) -> Result<usize> {
    let sql = format!("UPDATE {} SET pk = ?1 WHERE pk = ?2", info.quoted_meta());
    Ok(conn.prepare_cached(&sql)?.execute(params![new_pk, old_pk])?)
}

/// Refresh the encode watermark of every non-sentinel row of `pk`, so the
/// whole row ships again from the current local version.
pub(crate) fn touch_columns(
    conn: &Connection,
    info: &TableInfo,
    pk: &[u8],
    local_version: i64,
) -> Result<usize> {
    let sql = format!(
        "UPDATE {} SET local_version = ?1 WHERE pk = ?2 AND col_name != ?3",
        info.quoted_meta()
    );
    Ok(conn.prepare_cached(&sql)?.execute(params![local_version, pk, SENTINEL_COLUMN])?)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::db;
    use crate::registry::{TableAlgo, TableRegistry};
    use std::sync::Arc;

    fn setup() -> (Connection, Arc<TableInfo>) {
        let conn = Connection::open_in_memory().unwrap();
        db::bootstrap(&conn).unwrap();
        conn.execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT)").unwrap();
        let registry = TableRegistry::new();
        let info = registry.register(&conn, "items", TableAlgo::CausalLengthSet, false).unwrap();
        (conn, info)
    }

    fn row(cl: i64, col_version: i64) -> MetaRow {
        MetaRow {
            cl,
            col_version,
            db_version: 3,
            site_id: SiteId::from_bytes([7; 16]),
            seq: 1,
            local_version: 3,
            alive: true,
        }
    }

    #[test]
    fn test_get_missing_row() {
        let (conn, info) = setup();
        assert!(get(&conn, &info, b"k", "name").unwrap().is_none());
        assert!(sentinel(&conn, &info, b"k").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_get() {
        let (conn, info) = setup();
        let r = row(0, 1);
        upsert(&conn, &info, b"k", "name", &r).unwrap();
        assert_eq!(get(&conn, &info, b"k", "name").unwrap(), Some(r));
    }

    #[test]
    fn test_upsert_overwrites() {
        let (conn, info) = setup();
        upsert(&conn, &info, b"k", "name", &row(0, 1)).unwrap();
        let newer = MetaRow { col_version: 2, alive: false, ..row(0, 1) };
        upsert(&conn, &info, b"k", "name", &newer).unwrap();
        let got = get(&conn, &info, b"k", "name").unwrap().unwrap();
        assert_eq!(got.col_version, 2);
        assert!(!got.alive);
    }

    #[test]
    fn test_version_key_extraction() {
        let r = row(0, 5);
        let key = r.version();
        assert_eq!(key.col_version, 5);
        assert_eq!(key.db_version, 3);
        assert_eq!(key.site_id, SiteId::from_bytes([7; 16]));
    }

    #[test]
    fn test_drop_all_removes_every_column() {
        let (conn, info) = setup();
        upsert(&conn, &info, b"k", SENTINEL_COLUMN, &row(0, 1)).unwrap();
        upsert(&conn, &info, b"k", "name", &row(0, 1)).unwrap();
        upsert(&conn, &info, b"other", "name", &row(0, 1)).unwrap();
        assert_eq!(drop_all(&conn, &info, b"k").unwrap(), 2);
        assert!(sentinel(&conn, &info, b"k").unwrap().is_none());
        assert!(get(&conn, &info, b"other", "name").unwrap().is_some());
    }

    #[test]
    fn test_rekey_moves_rows() {
        let (conn, info) = setup();
        upsert(&conn, &info, b"old", SENTINEL_COLUMN, &row(0, 1)).unwrap();
        upsert(&conn, &info, b"old", "name", &row(0, 2)).unwrap();
        assert_eq!(rekey(&conn, &info, b"old", b"new").unwrap(), 2);
        assert!(sentinel(&conn, &info, b"old").unwrap().is_none());
        assert_eq!(get(&conn, &info, b"new", "name").unwrap().unwrap().col_version, 2);
    }

    #[test]
    fn test_touch_columns_skips_sentinel() {
        let (conn, info) = setup();
        upsert(&conn, &info, b"k", SENTINEL_COLUMN, &row(0, 1)).unwrap();
        upsert(&conn, &info, b"k", "name", &row(0, 1)).unwrap();
        assert_eq!(touch_columns(&conn, &info, b"k", 9).unwrap(), 1);
        assert_eq!(get(&conn, &info, b"k", "name").unwrap().unwrap().local_version, 9);
        assert_eq!(sentinel(&conn, &info, b"k").unwrap().unwrap().local_version, 3);
    }
}
