//! Conflict resolution for incoming change records.
//!
//! Every decision is deterministic and identical on every replica: causal
//! length compares first, then the record's ORIGIN
//! `(col_version, db_version, site_id)` tuple, with the byte-larger site id
//! winning a full tie. Local write order never influences the outcome, so
//! replicas that saw the same records in any order converge.
//!
//! Rejection is a normal outcome, not an error. Reserved restricted-value
//! placeholders are ordered and stored like ordinary values; filtering them
//! from reads is the caller's concern.

use rusqlite::{params_from_iter, Connection};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::meta::{self, MetaRow};
use crate::pk::decode_pk;
use crate::registry::{TableAlgo, TableInfo};
use crate::types::{ChangeRecord, SENTINEL_COLUMN};

/// Decision taken for one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record won; its effect is stored.
    Accept,
    /// The record won and moved the row to a newer incarnation (or first
    /// materialized it here).
    AcceptWithReincarnation,
    /// Local state is as new or newer; nothing changed.
    Reject,
}

impl MergeOutcome {
    pub fn is_accept(&self) -> bool {
        !matches!(self, MergeOutcome::Reject)
    }
}

/// Merge one record into local state. The caller provides the transaction
/// boundary and applies records in payload order.
pub(crate) fn merge_record(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    rec: &ChangeRecord,
) -> Result<MergeOutcome> {
    if rec.is_tombstone() {
        merge_tombstone(conn, clock, info, rec)
    } else if rec.is_structural() {
        merge_sentinel(conn, clock, info, rec)
    } else {
        merge_column(conn, clock, info, rec)
    }
}

fn merge_tombstone(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    rec: &ChangeRecord,
) -> Result<MergeOutcome> {
    if info.algo == TableAlgo::GrowOnlySet {
        tracing::warn!("rejecting tombstone for grow-only table {}", info.name);
        return Ok(MergeOutcome::Reject);
    }

    match meta::sentinel(conn, info, &rec.pk)? {
        None => {
            // Unknown row: store the tombstone so older records of the same
            // incarnation stay out, and drop any untracked row under the key.
            let lv = stamp(conn, clock, rec)?;
            store_from_record(conn, info, rec, rec.cl, rec.col_version, false, lv)?;
            delete_row(conn, info, rec)?;
            Ok(MergeOutcome::Accept)
        }
        Some(s) if rec.cl < s.cl => Ok(MergeOutcome::Reject),
        Some(s) if rec.cl > s.cl => {
            // A newer incarnation died before we ever saw it alive.
            let lv = stamp(conn, clock, rec)?;
            store_from_record(conn, info, rec, rec.cl, rec.col_version, false, lv)?;
            delete_row(conn, info, rec)?;
            Ok(MergeOutcome::AcceptWithReincarnation)
        }
        Some(s) => {
            if rec.version() > s.version() {
                let lv = stamp(conn, clock, rec)?;
                store_from_record(conn, info, rec, rec.cl, rec.col_version, false, lv)?;
                if s.alive {
                    delete_row(conn, info, rec)?;
                }
                Ok(MergeOutcome::Accept)
            } else {
                tracing::debug!(
                    "rejected tombstone for {} (version {:?} <= stored)",
                    info.name,
                    rec.version()
                );
                Ok(MergeOutcome::Reject)
            }
        }
    }
}

fn merge_sentinel(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    rec: &ChangeRecord,
) -> Result<MergeOutcome> {
    match meta::sentinel(conn, info, &rec.pk)? {
        None => {
            let lv = stamp(conn, clock, rec)?;
            ensure_row(conn, info, rec)?;
            store_from_record(conn, info, rec, rec.cl, rec.col_version, true, lv)?;
            Ok(MergeOutcome::Accept)
        }
        Some(s) if rec.cl < s.cl => Ok(MergeOutcome::Reject),
        Some(s) if rec.cl > s.cl => {
            let lv = stamp(conn, clock, rec)?;
            ensure_row(conn, info, rec)?;
            store_from_record(conn, info, rec, rec.cl, rec.col_version, true, lv)?;
            Ok(MergeOutcome::AcceptWithReincarnation)
        }
        Some(s) => {
            // Same incarnation: pure version comparison. This also lets a
            // creation beat a concurrent delete-of-untracked-row tombstone
            // when its tuple is larger, which keeps third replicas in line.
            if rec.version() > s.version() {
                let lv = stamp(conn, clock, rec)?;
                ensure_row(conn, info, rec)?;
                store_from_record(conn, info, rec, rec.cl, rec.col_version, true, lv)?;
                Ok(MergeOutcome::Accept)
            } else {
                Ok(MergeOutcome::Reject)
            }
        }
    }
}

fn merge_column(
    conn: &Connection,
    clock: &Clock,
    info: &TableInfo,
    rec: &ChangeRecord,
) -> Result<MergeOutcome> {
    if !info.has_data_column(&rec.col_name) {
        return Err(Error::NotFound(format!(
            "column {} in table {}",
            rec.col_name, info.name
        )));
    }

    let sentinel = meta::sentinel(conn, info, &rec.pk)?;
    let (outcome, sentinel_cl) = match &sentinel {
        None => (MergeOutcome::Accept, None),
        Some(s) if rec.cl < s.cl => return Ok(MergeOutcome::Reject),
        Some(s) if rec.cl > s.cl => (MergeOutcome::AcceptWithReincarnation, None),
        Some(s) if !s.alive => {
            // The tombstone holds this incarnation; only a higher causal
            // length brings the row back.
            tracing::debug!(
                "rejected column {} for tombstoned row in {}",
                rec.col_name,
                info.name
            );
            return Ok(MergeOutcome::Reject);
        }
        Some(s) => (MergeOutcome::Accept, Some(s.cl)),
    };

    if sentinel_cl.is_some() {
        // Live row at the record's incarnation: the column metadata decides.
        if let Some(m) = meta::get(conn, info, &rec.pk, &rec.col_name)? {
            let stale_incarnation = m.cl < rec.cl;
            if !stale_incarnation && rec.version() <= m.version() {
                tracing::debug!(
                    "rejected column {} in {} (version {:?} <= stored)",
                    rec.col_name,
                    info.name,
                    rec.version()
                );
                return Ok(MergeOutcome::Reject);
            }
        }
    }

    let lv = stamp(conn, clock, rec)?;
    if sentinel_cl.is_none() {
        // Adopt the record's incarnation. The synthesized sentinel uses
        // col_version 1 so it can never outrank structural records the
        // origin itself will ship.
        let synthesized = MetaRow {
            cl: rec.cl,
            col_version: 1,
            db_version: rec.db_version,
            site_id: rec.site_id,
            seq: rec.seq,
            local_version: lv,
            alive: true,
        };
        meta::upsert(conn, info, &rec.pk, SENTINEL_COLUMN, &synthesized)?;
    }
    write_column(conn, info, rec)?;
    store_from_record(conn, info, rec, rec.cl, rec.col_version, true, lv)?;
    Ok(outcome)
}

/// Advance the local clock past the record's origin version; the returned
/// value becomes the record's local encode watermark.
fn stamp(conn: &Connection, clock: &Clock, rec: &ChangeRecord) -> Result<i64> {
    clock.next_db_version(conn, Some(rec.db_version))
}

/// Store the record's origin clock under its (pk, column) metadata slot.
fn store_from_record(
    conn: &Connection,
    info: &TableInfo,
    rec: &ChangeRecord,
    cl: i64,
    col_version: i64,
    alive: bool,
    local_version: i64,
) -> Result<()> {
    meta::upsert(
        conn,
        info,
        &rec.pk,
        &rec.col_name,
        &MetaRow {
            cl,
            col_version,
            db_version: rec.db_version,
            site_id: rec.site_id,
            seq: rec.seq,
            local_version,
            alive,
        },
    )
}

/// Materialize the row with its key columns only, leaving data columns to
/// later column records.
fn ensure_row(conn: &Connection, info: &TableInfo, rec: &ChangeRecord) -> Result<()> {
    let key = decode_pk(&rec.pk)?;
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
        info.quoted(),
        info.pk_list(),
        info.pk_placeholders(),
        info.pk_list()
    );
    conn.prepare_cached(&sql)?.execute(params_from_iter(key.iter()))?;
    Ok(())
}

fn write_column(conn: &Connection, info: &TableInfo, rec: &ChangeRecord) -> Result<()> {
    let mut values = decode_pk(&rec.pk)?;
    values.push(rec.value.clone());
    let sql = format!(
        "INSERT INTO {} ({}, {}) VALUES ({}, ?) ON CONFLICT({}) DO UPDATE SET {} = excluded.{}",
        info.quoted(),
        info.pk_list(),
        crate::db::quote_ident(&rec.col_name),
        info.pk_placeholders(),
        info.pk_list(),
        crate::db::quote_ident(&rec.col_name),
        crate::db::quote_ident(&rec.col_name),
    );
    conn.prepare_cached(&sql)?.execute(params_from_iter(values.iter()))?;
    Ok(())
}

fn delete_row(conn: &Connection, info: &TableInfo, rec: &ChangeRecord) -> Result<()> {
    let key = decode_pk(&rec.pk)?;
    let sql = format!("DELETE FROM {} WHERE {}", info.quoted(), info.pk_predicate());
    conn.prepare_cached(&sql)?.execute(params_from_iter(key.iter()))?;
    Ok(())
}
