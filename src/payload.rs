//! Binary change payloads: encode local history, apply remote history.
//!
//! A payload is a 34-byte header followed by a bincode body. The header
//! carries a magic tag, a format version, the origin site id, the record
//! count and a crc32 of the body, so a receiver can refuse foreign or
//! damaged blobs before touching the database. The body is the record list
//! in `(local_version, seq)` order; applying records in payload order on any
//! replica yields the same state.

use bytes::{Buf, BufMut};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::clock::Clock;
use crate::db;
use crate::error::{Error, Result};
use crate::merge::{self, MergeOutcome};
use crate::pk::decode_pk;
use crate::registry::{TableInfo, TableRegistry};
use crate::types::{ChangeRecord, SiteId, Value, SENTINEL_COLUMN};

pub(crate) const PAYLOAD_MAGIC: [u8; 4] = *b"TSYN";
pub(crate) const PAYLOAD_VERSION: u16 = 1;
/// magic + version + site id + row count + crc32.
pub(crate) const HEADER_LEN: usize = 4 + 2 + 16 + 8 + 4;

/// Resume cursor for incremental encoding: the `(local_version, seq)` of the
/// last record the receiver holds. `Default` means "from the beginning".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub db_version: i64,
    pub seq: i64,
}

/// One encoded payload plus the cursor to request the next one from.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub blob: Vec<u8>,
    pub rows: usize,
    pub watermark: Watermark,
}

/// Outcome counts of one `apply`: every record seen, and how many won.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub seen: usize,
    pub applied: usize,
}

/// Encode every change past `since` across all registered tables.
///
/// `limit` is a soft row cap: encoding always finishes the current
/// `(local_version, seq)` group before stopping, so resuming from the
/// returned watermark never skips records (groups share a cursor position
/// after a key move re-ships a whole row).
pub(crate) fn encode(
    conn: &Connection,
    registry: &TableRegistry,
    clock: &Clock,
    limit: Option<usize>,
    since: Watermark,
) -> Result<EncodedPayload> {
    let mut pending = Vec::new();
    for info in registry.tables() {
        pending.extend(scan_table(conn, &info, since)?);
    }
    pending.sort_by_key(|(lv, seq, _)| (*lv, *seq));

    let mut records = Vec::new();
    let mut cursor = None;
    for (lv, seq, rec) in pending {
        if let Some(limit) = limit {
            if records.len() >= limit && cursor != Some((lv, seq)) {
                break;
            }
        }
        records.push(rec);
        cursor = Some((lv, seq));
    }
    let watermark = cursor
        .map(|(db_version, seq)| Watermark { db_version, seq })
        .unwrap_or(since);

    let body = bincode::serialize(&records)
        .map_err(|e| Error::InvalidState(format!("payload serialization failed: {e}")))?;
    let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
    blob.put_slice(&PAYLOAD_MAGIC);
    blob.put_u16(PAYLOAD_VERSION);
    blob.put_slice(clock.site_id().as_bytes());
    blob.put_u64(records.len() as u64);
    blob.put_u32(crc32fast::hash(&body));
    blob.extend_from_slice(&body);

    tracing::debug!(
        "encoded {} records up to ({}, {})",
        records.len(),
        watermark.db_version,
        watermark.seq
    );
    Ok(EncodedPayload { blob, rows: records.len(), watermark })
}

/// Validate a payload and return its origin site and records.
pub(crate) fn decode(blob: &[u8]) -> Result<(SiteId, Vec<ChangeRecord>)> {
    if blob.len() < HEADER_LEN {
        return Err(Error::MalformedPayload(format!(
            "payload shorter than header ({} bytes)",
            blob.len()
        )));
    }
    let mut buf = blob;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != PAYLOAD_MAGIC {
        return Err(Error::MalformedPayload("bad magic".to_string()));
    }
    let version = buf.get_u16();
    if version != PAYLOAD_VERSION {
        return Err(Error::MalformedPayload(format!(
            "unsupported payload version {version}"
        )));
    }
    let mut site = [0u8; 16];
    buf.copy_to_slice(&mut site);
    let origin = SiteId::from_bytes(site);
    let nrows = buf.get_u64();
    let crc = buf.get_u32();

    let body = buf;
    if crc32fast::hash(body) != crc {
        return Err(Error::MalformedPayload("checksum mismatch".to_string()));
    }
    let mut reader = std::io::Cursor::new(body);
    let records: Vec<ChangeRecord> = bincode::deserialize_from(&mut reader)
        .map_err(|e| Error::MalformedPayload(format!("body decode failed: {e}")))?;
    if reader.position() as usize != body.len() {
        return Err(Error::MalformedPayload("trailing bytes after body".to_string()));
    }
    if records.len() as u64 != nrows {
        return Err(Error::MalformedPayload(format!(
            "header claims {nrows} records, body holds {}",
            records.len()
        )));
    }
    Ok((origin, records))
}

/// Apply a payload atomically: records reach the merge engine in payload
/// order, rejection is the normal losing outcome, any error rolls the whole
/// application back (or surfaces into the host's open transaction).
///
/// Accepting a record stamped with the LOCAL site id means this database no
/// longer remembers its own past, usually a restored backup. That fails
/// `IdentityReset` so the host can call `reset_site_id` and rejoin cleanly.
pub(crate) fn apply(
    conn: &Connection,
    registry: &TableRegistry,
    clock: &Clock,
    blob: &[u8],
) -> Result<ApplyReport> {
    let (origin, records) = decode(blob)?;
    let local = clock.site_id();
    tracing::debug!("applying {} records from {origin}", records.len());

    db::in_txn(conn, |conn| {
        let mut applied = 0usize;
        for rec in &records {
            let info = registry.lookup(&rec.table)?;
            let outcome = merge::merge_record(conn, clock, &info, rec)?;
            if outcome.is_accept() {
                if rec.site_id == local {
                    return Err(Error::IdentityReset);
                }
                applied += 1;
            }
            if outcome == MergeOutcome::AcceptWithReincarnation {
                tracing::debug!(
                    "row in {} moved to incarnation {} during merge",
                    rec.table,
                    rec.cl
                );
            }
        }
        Ok(ApplyReport { seen: records.len(), applied })
    })
}

fn scan_table(
    conn: &Connection,
    info: &TableInfo,
    since: Watermark,
) -> Result<Vec<(i64, i64, ChangeRecord)>> {
    let sql = format!(
        "SELECT pk, col_name, cl, col_version, db_version, site_id, seq, local_version, alive
         FROM {} WHERE local_version > ?1 OR (local_version = ?1 AND seq > ?2)
         ORDER BY local_version, seq",
        info.quoted_meta()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![since.db_version, since.seq], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Vec<u8>>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)? != 0,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (pk, col_name, cl, col_version, db_version, site, seq, local_version, alive) = row?;
        let site_id = SiteId::from_slice(&site)?;
        let value = if col_name == SENTINEL_COLUMN {
            if alive {
                Value::Null
            } else {
                Value::tombstone()
            }
        } else {
            match row_value(conn, info, &pk, &col_name)? {
                Some(value) => value,
                // The row is gone; its tombstone carries the state.
                None => {
                    tracing::debug!("skipping column {} of deleted row in {}", col_name, info.name);
                    continue;
                }
            }
        };
        out.push((
            local_version,
            seq,
            ChangeRecord {
                table: info.name.clone(),
                pk,
                cl,
                col_name,
                value,
                col_version,
                db_version,
                site_id,
                seq,
            },
        ));
    }
    Ok(out)
}

fn row_value(conn: &Connection, info: &TableInfo, pk: &[u8], col: &str) -> Result<Option<Value>> {
    let key = decode_pk(pk)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        db::quote_ident(col),
        info.quoted(),
        info.pk_predicate()
    );
    let value = conn
        .prepare_cached(&sql)?
        .query_row(params_from_iter(key.iter()), |row| row.get::<_, Value>(0))
        .optional()?;
    Ok(value)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::pk::encode_pk;
    use crate::registry::TableAlgo;
    use crate::tracker;
    use std::sync::Arc;

    struct Replica {
        conn: Connection,
        clock: Clock,
        registry: TableRegistry,
    }

    impl Replica {
        fn new() -> Self {
            let conn = Connection::open_in_memory().unwrap();
            db::bootstrap(&conn).unwrap();
            conn.execute_batch(
                "CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT, qty INTEGER)",
            )
            .unwrap();
            let registry = TableRegistry::new();
            registry
                .register(&conn, "items", TableAlgo::CausalLengthSet, false)
                .unwrap();
            let clock = Clock::load(&conn).unwrap();
            Replica { conn, clock, registry }
        }

        fn info(&self) -> Arc<TableInfo> {
            self.registry.lookup("items").unwrap()
        }

        fn insert(&self, id: &str, name: &str, qty: i64) {
            self.conn
                .execute(
                    "INSERT INTO items (id, name, qty) VALUES (?1, ?2, ?3)",
                    params![id, name, qty],
                )
                .unwrap();
            let pk = encode_pk(&[Value::Text(id.to_string())]).unwrap();
            tracker::mark_insert(&self.conn, &self.clock, &self.info(), &pk).unwrap();
            self.clock.end_tx(false);
        }

        fn update_name(&self, id: &str, name: &str) {
            self.conn
                .execute("UPDATE items SET name = ?2 WHERE id = ?1", params![id, name])
                .unwrap();
            let pk = encode_pk(&[Value::Text(id.to_string())]).unwrap();
            tracker::mark_update(&self.conn, &self.clock, &self.info(), &pk, "name").unwrap();
            self.clock.end_tx(false);
        }

        fn delete(&self, id: &str) {
            self.conn.execute("DELETE FROM items WHERE id = ?1", params![id]).unwrap();
            let pk = encode_pk(&[Value::Text(id.to_string())]).unwrap();
            tracker::mark_delete(&self.conn, &self.clock, &self.info(), &pk).unwrap();
            self.clock.end_tx(false);
        }

        fn encode_all(&self) -> EncodedPayload {
            encode(&self.conn, &self.registry, &self.clock, None, Watermark::default()).unwrap()
        }

        fn apply(&self, blob: &[u8]) -> Result<ApplyReport> {
            apply(&self.conn, &self.registry, &self.clock, blob)
        }

        fn name_of(&self, id: &str) -> Option<String> {
            self.conn
                .query_row("SELECT name FROM items WHERE id = ?1", [id], |row| row.get(0))
                .ok()
        }

        fn count(&self) -> i64 {
            self.conn
                .query_row("SELECT count(*) FROM items", [], |row| row.get(0))
                .unwrap()
        }
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let a = Replica::new();
        let payload = a.encode_all();
        assert_eq!(payload.rows, 0);
        // Header plus the body's bare length prefix.
        assert_eq!(payload.blob.len(), HEADER_LEN + 8);
        assert_eq!(payload.watermark, Watermark::default());

        let (origin, records) = decode(&payload.blob).unwrap();
        assert_eq!(origin, a.clock.site_id());
        assert!(records.is_empty());
    }

    #[test]
    fn test_payload_transfers_rows() {
        let a = Replica::new();
        let b = Replica::new();
        a.insert("a", "alpha", 1);
        a.insert("b", "beta", 2);

        let payload = a.encode_all();
        // Two sentinels plus two columns each.
        assert_eq!(payload.rows, 6);

        let report = b.apply(&payload.blob).unwrap();
        assert_eq!(report.seen, 6);
        assert_eq!(report.applied, 6);
        assert_eq!(b.count(), 2);
        assert_eq!(b.name_of("a"), Some("alpha".to_string()));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = Replica::new();
        let b = Replica::new();
        a.insert("a", "alpha", 1);

        let payload = a.encode_all();
        b.apply(&payload.blob).unwrap();
        let report = b.apply(&payload.blob).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_watermark_resumes_incrementally() {
        let a = Replica::new();
        let b = Replica::new();
        a.insert("a", "alpha", 1);

        let first = a.encode_all();
        b.apply(&first.blob).unwrap();

        a.update_name("a", "alef");
        let second = encode(&a.conn, &a.registry, &a.clock, None, first.watermark).unwrap();
        assert_eq!(second.rows, 1);
        b.apply(&second.blob).unwrap();
        assert_eq!(b.name_of("a"), Some("alef".to_string()));
    }

    #[test]
    fn test_deleted_row_ships_tombstone_only() {
        let a = Replica::new();
        let b = Replica::new();
        a.insert("a", "alpha", 1);
        a.delete("a");

        let payload = a.encode_all();
        b.apply(&payload.blob).unwrap();
        assert_eq!(b.count(), 0);

        let (_, records) = decode(&payload.blob).unwrap();
        // Column records of the dead row are withheld.
        assert!(records.iter().all(|r| r.col_name == SENTINEL_COLUMN));
        assert!(records.iter().any(|r| r.is_tombstone()));
    }

    #[test]
    fn test_row_limit_is_a_soft_cap() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        a.insert("b", "beta", 2);

        let mut since = Watermark::default();
        let mut total = 0;
        let mut pages = 0;
        loop {
            let page = encode(&a.conn, &a.registry, &a.clock, Some(2), since).unwrap();
            if page.rows == 0 {
                break;
            }
            total += page.rows;
            since = page.watermark;
            pages += 1;
            assert!(pages < 10, "pagination must terminate");
        }
        assert_eq!(total, 6);
        assert!(pages >= 2);
    }

    #[test]
    fn test_paged_and_full_transfers_converge() {
        let a = Replica::new();
        let paged = Replica::new();
        let whole = Replica::new();
        a.insert("a", "alpha", 1);
        a.insert("b", "beta", 2);
        a.update_name("b", "bet");

        whole.apply(&a.encode_all().blob).unwrap();

        let mut since = Watermark::default();
        loop {
            let page = encode(&a.conn, &a.registry, &a.clock, Some(1), since).unwrap();
            if page.rows == 0 {
                break;
            }
            paged.apply(&page.blob).unwrap();
            since = page.watermark;
        }

        assert_eq!(paged.name_of("a"), whole.name_of("a"));
        assert_eq!(paged.name_of("b"), whole.name_of("b"));
        assert_eq!(paged.count(), whole.count());
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let a = Replica::new();
        let mut blob = a.encode_all().blob;
        blob[0] = b'X';
        assert!(matches!(decode(&blob).unwrap_err(), Error::MalformedPayload(_)));
    }

    #[test]
    fn test_unknown_version_is_malformed() {
        let a = Replica::new();
        let mut blob = a.encode_all().blob;
        blob[5] = 99;
        assert!(matches!(decode(&blob).unwrap_err(), Error::MalformedPayload(_)));
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        let mut blob = a.encode_all().blob;
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(ref m) if m.contains("checksum")));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        let mut blob = a.encode_all().blob;
        // Keep the checksum honest while appending garbage.
        blob.push(0);
        let body_crc = crc32fast::hash(&blob[HEADER_LEN..]);
        blob[30..34].copy_from_slice(&body_crc.to_be_bytes());
        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(ref m) if m.contains("trailing")));
    }

    #[test]
    fn test_record_count_mismatch_is_malformed() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        let mut blob = a.encode_all().blob;
        blob[29] = 77;
        let err = decode(&blob).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(ref m) if m.contains("records")));
    }

    #[test]
    fn test_unknown_table_aborts_apply() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        let payload = a.encode_all();

        let conn = Connection::open_in_memory().unwrap();
        db::bootstrap(&conn).unwrap();
        let clock = Clock::load(&conn).unwrap();
        let empty_registry = TableRegistry::new();
        let err = apply(&conn, &empty_registry, &clock, &payload.blob).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_own_site_records_trigger_identity_reset() {
        let a = Replica::new();
        a.insert("a", "alpha", 1);
        let payload = a.encode_all();

        // Wipe local state but keep the identity, as a restored backup would.
        a.conn.execute("DELETE FROM items", []).unwrap();
        a.conn.execute("DELETE FROM items__sync_meta", []).unwrap();

        let err = a.apply(&payload.blob).unwrap_err();
        assert!(matches!(err, Error::IdentityReset));
        // The transaction rolled back: nothing was half-applied.
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn test_relay_preserves_origin_clocks() {
        let a = Replica::new();
        let b = Replica::new();
        let c = Replica::new();
        a.insert("a", "alpha", 1);

        b.apply(&a.encode_all().blob).unwrap();
        // B relays everything it holds, including A's records.
        c.apply(&b.encode_all().blob).unwrap();

        assert_eq!(c.name_of("a"), Some("alpha".to_string()));
        let (_, records) = decode(&c.encode_all().blob).unwrap();
        assert!(records.iter().all(|r| r.site_id == a.clock.site_id()));
    }
}
