//! Core data model: site identity, SQLite values, and change records.
//!
//! A replicated mutation travels as a [`ChangeRecord`], a nine-field tuple
//! that every replica understands. Conflict resolution orders competing
//! records by [`VersionKey`], with the origin [`SiteId`] bytes as the final,
//! deterministic tie-break.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Column-name marker for structural (row-lifecycle) records and for the
/// per-row sentinel entry in the metadata tables.
pub const SENTINEL_COLUMN: &str = "__sentinel__";

/// Value carried by a delete record. Never written to user tables.
pub const TOMBSTONE_VALUE: &str = "__[dead]__";

/// Placeholder shipped in place of real data for access-restricted columns.
/// The merge engine orders it like an ordinary value; callers must not
/// surface it as data.
pub const RESTRICTED_VALUE: &str = "__[restricted]__";

/// Number of fields in a [`ChangeRecord`] wire tuple.
pub const CHANGE_RECORD_FIELDS: usize = 9;

/// Globally unique replica identity (16 random bytes, uuid v4).
///
/// The derived `Ord` compares the raw bytes, which is exactly the
/// deterministic tie-break the merge engine needs: every replica agrees on
/// which of two site ids is larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId([u8; 16]);

impl SiteId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse an identity from a raw byte slice (payload header, stored blob).
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::MalformedPayload(format!("site id must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

/// A dynamically typed SQLite value.
///
/// Bridges `rusqlite::types` in both directions so user-table reads and
/// metadata writes go through one representation, and derives serde so the
/// same representation is the wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Integer(_) => "INTEGER",
            Value::Real(_) => "REAL",
            Value::Text(_) => "TEXT",
            Value::Blob(_) => "BLOB",
        }
    }

    /// The reserved tombstone payload.
    pub fn tombstone() -> Self {
        Value::Text(TOMBSTONE_VALUE.to_string())
    }

    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl From<rusqlite::types::Value> for Value {
    fn from(v: rusqlite::types::Value) -> Self {
        match v {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => Value::Integer(i),
            rusqlite::types::Value::Real(f) => Value::Real(f),
            rusqlite::types::Value::Text(t) => Value::Text(t),
            rusqlite::types::Value::Blob(b) => Value::Blob(b),
        }
    }
}

impl From<Value> for rusqlite::types::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => rusqlite::types::Value::Null,
            Value::Integer(i) => rusqlite::types::Value::Integer(i),
            Value::Real(f) => rusqlite::types::Value::Real(f),
            Value::Text(t) => rusqlite::types::Value::Text(t),
            Value::Blob(b) => rusqlite::types::Value::Blob(b),
        }
    }
}

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl rusqlite::types::FromSql for Value {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        use rusqlite::types::ValueRef;
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

/// Conflict-ordering key for competing records of the same table/row/column.
///
/// The derived `Ord` compares `(col_version, db_version, site_id)`
/// lexicographically, so the larger site id wins only when both counters
/// tie. Causal length is compared separately and always first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey {
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: SiteId,
}

/// One replicated mutation.
///
/// Field declaration order is the wire order; the payload codec serializes
/// records exactly as declared here. `db_version`, `site_id` and `seq`
/// always describe the ORIGIN of the mutation and survive relays unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Tracked table the record belongs to.
    pub table: String,
    /// Encoded primary key (see [`crate::pk`]).
    pub pk: Vec<u8>,
    /// Causal length of the row at the origin.
    pub cl: i64,
    /// Affected column, or [`SENTINEL_COLUMN`] for row-lifecycle records.
    pub col_name: String,
    /// New value; [`Value::tombstone`] for deletes, `Null` for row creation.
    pub value: Value,
    /// Per-column mutation counter at the origin.
    pub col_version: i64,
    /// Origin database version (Lamport time).
    pub db_version: i64,
    /// Origin replica identity.
    pub site_id: SiteId,
    /// Origin intra-transaction ordinal.
    pub seq: i64,
}

impl ChangeRecord {
    /// True for row-lifecycle records (creation sentinel or tombstone).
    pub fn is_structural(&self) -> bool {
        self.col_name == SENTINEL_COLUMN
    }

    /// True for delete records.
    pub fn is_tombstone(&self) -> bool {
        self.is_structural() && self.value.as_text() == Some(TOMBSTONE_VALUE)
    }

    /// Ordering key used by the merge engine.
    pub fn version(&self) -> VersionKey {
        VersionKey {
            col_version: self.col_version,
            db_version: self.db_version,
            site_id: self.site_id,
        }
    }
}
