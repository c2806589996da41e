//! Local mutation tracking.
//!
//! The host reports each committed row mutation after performing it; the
//! tracker translates the report into metadata writes that later encode as
//! change records. Nothing here touches user tables: the host's write has
//! already happened, the tracker only records its clock coordinates.
//!
//! All marks of one host transaction share a database version and take
//! increasing `seq` ordinals (see [`Clock::tx_slot`]).

use rusqlite::Connection;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::meta::{self, MetaRow};
use crate::pk;
use crate::registry::{TableAlgo, TableInfo};
use crate::types::{Value, SENTINEL_COLUMN};

/// Record a row creation: sentinel plus one metadata row per data column.
///
/// On a tombstoned row this is a reincarnation (causal length + 1); on a
/// live row it degrades to refreshing every data column.
pub(crate) fn mark_insert(conn: &Connection, clock: &Clock, info: &TableInfo, pk: &[u8]) -> Result<()> {
    let cl = match meta::sentinel(conn, info, pk)? {
        None => {
            let slot = clock.tx_slot(conn)?;
            meta::upsert(
                conn,
                info,
                pk,
                SENTINEL_COLUMN,
                &MetaRow {
                    cl: 0,
                    col_version: 1,
                    db_version: slot.db_version,
                    site_id: clock.site_id(),
                    seq: slot.seq,
                    local_version: slot.db_version,
                    alive: true,
                },
            )?;
            0
        }
        Some(s) if !s.alive => {
            let slot = clock.tx_slot(conn)?;
            let cl = s.cl + 1;
            meta::upsert(
                conn,
                info,
                pk,
                SENTINEL_COLUMN,
                &MetaRow {
                    cl,
                    col_version: s.col_version + 1,
                    db_version: slot.db_version,
                    site_id: clock.site_id(),
                    seq: slot.seq,
                    local_version: slot.db_version,
                    alive: true,
                },
            )?;
            tracing::debug!("row reincarnated in {} (cl={})", info.name, cl);
            cl
        }
        Some(s) => s.cl,
    };

    for col in &info.data_cols {
        mark_column(conn, clock, info, pk, col, cl)?;
    }
    Ok(())
}

/// Record a single-column update.
///
/// A missing or tombstoned sentinel is revived first: the host demonstrably
/// holds the row, so the metadata follows it.
pub(crate) fn mark_update(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    pk: &[u8],
    col: &str,
) -> Result<()> {
    if info.is_pk_column(col) {
        return Err(Error::InvalidState(format!(
            "column {} is part of the key of {}; key changes are tracked as moves",
            col, info.name
        )));
    }
    if !info.has_data_column(col) {
        return Err(Error::NotFound(format!("column {} in table {}", col, info.name)));
    }

    let cl = match meta::sentinel(conn, info, pk)? {
        Some(s) if s.alive => s.cl,
        Some(s) => {
            let slot = clock.tx_slot(conn)?;
            let cl = s.cl + 1;
            meta::upsert(
                conn,
                info,
                pk,
                SENTINEL_COLUMN,
                &MetaRow {
                    cl,
                    col_version: s.col_version + 1,
                    db_version: slot.db_version,
                    site_id: clock.site_id(),
                    seq: slot.seq,
                    local_version: slot.db_version,
                    alive: true,
                },
            )?;
            tracing::debug!("update revived tombstoned row in {} (cl={})", info.name, cl);
            cl
        }
        None => {
            let slot = clock.tx_slot(conn)?;
            meta::upsert(
                conn,
                info,
                pk,
                SENTINEL_COLUMN,
                &MetaRow {
                    cl: 0,
                    col_version: 1,
                    db_version: slot.db_version,
                    site_id: clock.site_id(),
                    seq: slot.seq,
                    local_version: slot.db_version,
                    alive: true,
                },
            )?;
            tracing::debug!("update started tracking untracked row in {}", info.name);
            0
        }
    };
    mark_column(conn, clock, info, pk, col, cl)
}

/// Record a row deletion: the sentinel turns into a tombstone at the same
/// causal length. Column metadata stays behind, dormant, for the row's
/// possible reincarnation. Deleting an already tombstoned row is a no-op.
pub(crate) fn mark_delete(conn: &Connection, clock: &Clock, info: &TableInfo, pk: &[u8]) -> Result<()> {
    if info.algo == TableAlgo::GrowOnlySet {
        return Err(Error::InvalidState(format!(
            "table {} is grow-only; deletes are not replicated",
            info.name
        )));
    }

    let (cl, col_version) = match meta::sentinel(conn, info, pk)? {
        Some(s) if !s.alive => {
            tracing::debug!("row in {} already tombstoned (cl={})", info.name, s.cl);
            return Ok(());
        }
        Some(s) => (s.cl, s.col_version + 1),
        None => (0, 1),
    };
    let slot = clock.tx_slot(conn)?;
    meta::upsert(
        conn,
        info,
        pk,
        SENTINEL_COLUMN,
        &MetaRow {
            cl,
            col_version,
            db_version: slot.db_version,
            site_id: clock.site_id(),
            seq: slot.seq,
            local_version: slot.db_version,
            alive: false,
        },
    )?;
    Ok(())
}

/// Record a primary-key change: metadata re-keys to the new key (causal
/// length and column versions preserved, watermark refreshed so the row
/// ships again in full), and a tombstone is left under the old key at the
/// same database version.
pub(crate) fn mark_move(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    old_pk: &[u8],
    new_pk: &[u8],
) -> Result<()> {
    if info.algo == TableAlgo::GrowOnlySet {
        return Err(Error::InvalidState(format!(
            "table {} is grow-only; a key change implies a delete",
            info.name
        )));
    }
    if old_pk == new_pk {
        return Ok(());
    }

    let s = match meta::sentinel(conn, info, old_pk)? {
        None => {
            tracing::debug!("move of untracked row in {}, tracking as insert", info.name);
            return mark_insert(conn, clock, info, new_pk);
        }
        Some(s) if !s.alive => {
            return Err(Error::InvalidState(format!(
                "cannot move tombstoned row in {}",
                info.name
            )));
        }
        Some(s) => s,
    };

    let replaced = meta::drop_all(conn, info, new_pk)?;
    if replaced > 0 {
        tracing::warn!(
            "move target in {} already carried {} metadata rows, replaced",
            info.name,
            replaced
        );
    }
    meta::rekey(conn, info, old_pk, new_pk)?;

    let slot = clock.tx_slot(conn)?;
    meta::upsert(
        conn,
        info,
        new_pk,
        SENTINEL_COLUMN,
        &MetaRow {
            cl: s.cl,
            col_version: s.col_version + 1,
            db_version: slot.db_version,
            site_id: clock.site_id(),
            seq: slot.seq,
            local_version: slot.db_version,
            alive: true,
        },
    )?;
    meta::touch_columns(conn, info, new_pk, slot.db_version)?;

    let old_slot = clock.tx_slot(conn)?;
    meta::upsert(
        conn,
        info,
        old_pk,
        SENTINEL_COLUMN,
        &MetaRow {
            cl: s.cl,
            col_version: s.col_version + 1,
            db_version: old_slot.db_version,
            site_id: clock.site_id(),
            seq: old_slot.seq,
            local_version: old_slot.db_version,
            alive: false,
        },
    )?;
    tracing::debug!("moved row in {} (cl={})", info.name, s.cl);
    Ok(())
}

/// Start tracking rows that existed before the table was registered, as
/// fresh local inserts. Returns the number of rows marked.
pub(crate) fn backfill(conn: &Connection, clock: &Clock, info: &TableInfo) -> Result<usize> {
    let sql = format!("SELECT {} FROM {}", info.pk_list(), info.quoted());
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut marked = 0usize;
    while let Some(row) = rows.next()? {
        let mut key = Vec::with_capacity(info.pk_cols.len());
        for i in 0..info.pk_cols.len() {
            key.push(row.get::<_, Value>(i)?);
        }
        let pk = pk::encode_pk(&key)?;
        if meta::sentinel(conn, info, &pk)?.is_none() {
            mark_insert(conn, clock, info, &pk)?;
            marked += 1;
        }
    }
    if marked > 0 {
        tracing::info!("backfilled {} pre-existing rows in {}", marked, info.name);
    }
    Ok(marked)
}

fn mark_column(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    pk: &[u8],
    col: &str,
    cl: i64,
) -> Result<()> {
    let col_version = match meta::get(conn, info, pk, col)? {
        Some(m) => m.col_version + 1,
        None => 1,
    };
    let slot = clock.tx_slot(conn)?;
    meta::upsert(
        conn,
        info,
        pk,
        col,
        &MetaRow {
            cl,
            col_version,
            db_version: slot.db_version,
            site_id: clock.site_id(),
            seq: slot.seq,
            local_version: slot.db_version,
            alive: true,
        },
    )
}
