//! Versioning and site identity.
//!
//! The database version is a Lamport-style counter persisted in
//! `__sync_config`: every local committing transaction that tracks at least
//! one mutation consumes the next value, and every merged remote record
//! advances it to `max(local, incoming) + 1`. Local transactions allocate
//! their version lazily on the first tracked mutation; subsequent mutations
//! in the same transaction reuse it and take increasing `seq` ordinals.
//!
//! The connection hooks installed by the context call [`Clock::end_tx`] on
//! commit and rollback. Hooks may not run SQL, so a rollback only marks the
//! cached counter stale; the next read reloads the persisted (rolled-back)
//! value.

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::db::{self, KEY_DB_VERSION, KEY_SITE_ID};
use crate::error::{Error, Result};
use crate::types::{SiteId, Value};

/// Clock coordinates handed to one locally tracked mutation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxSlot {
    pub db_version: i64,
    pub seq: i64,
}

#[derive(Debug)]
struct ClockState {
    site_id: SiteId,
    /// Cached persisted counter; `None` after a rollback made it stale.
    db_version: Option<i64>,
    /// Version allocated to the open local transaction, if any.
    tx_version: Option<i64>,
    /// Next intra-transaction ordinal.
    seq: i64,
}

/// Database version counter and site identity for one database.
#[derive(Debug)]
pub struct Clock {
    inner: Mutex<ClockState>,
}

impl Clock {
    /// Load the persisted identity and counter, creating both on first use.
    pub fn load(conn: &Connection) -> Result<Self> {
        let site_id = match db::config_get(conn, KEY_SITE_ID)? {
            Some(Value::Blob(bytes)) => SiteId::from_slice(&bytes)?,
            Some(other) => {
                return Err(Error::InvalidState(format!(
                    "site id stored as {}, expected BLOB",
                    other.type_name()
                )))
            }
            None => {
                let id = SiteId::generate();
                db::config_set(conn, KEY_SITE_ID, &Value::Blob(id.as_bytes().to_vec()))?;
                tracing::info!("generated site identity {}", id);
                id
            }
        };

        let db_version = match db::config_get(conn, KEY_DB_VERSION)? {
            Some(Value::Integer(v)) => v,
            Some(other) => {
                return Err(Error::InvalidState(format!(
                    "db version stored as {}, expected INTEGER",
                    other.type_name()
                )))
            }
            None => {
                db::config_set(conn, KEY_DB_VERSION, &Value::Integer(0))?;
                0
            }
        };

        Ok(Self {
            inner: Mutex::new(ClockState {
                site_id,
                db_version: Some(db_version),
                tx_version: None,
                seq: 0,
            }),
        })
    }

    /// The identity local mutations are stamped with.
    pub fn site_id(&self) -> SiteId {
        self.inner.lock().site_id
    }

    /// Replace the site identity with a freshly generated one.
    ///
    /// Hazard: metadata written before the reset keeps the old identity, so
    /// peers see subsequent mutations as coming from a brand-new replica,
    /// and payloads produced before the reset stop being recognizable as
    /// self-originated. That lost self-recognition is exactly what
    /// [`Error::IdentityReset`] guards during apply.
    pub fn reset_site_id(&self, conn: &Connection) -> Result<SiteId> {
        let id = SiteId::generate();
        db::config_set(conn, KEY_SITE_ID, &Value::Blob(id.as_bytes().to_vec()))?;
        let mut st = self.inner.lock();
        tracing::info!("site identity reset from {} to {}", st.site_id, id);
        st.site_id = id;
        Ok(id)
    }

    /// Highest database version this replica has consumed so far.
    pub fn current_db_version(&self, conn: &Connection) -> Result<i64> {
        let mut st = self.inner.lock();
        match st.db_version {
            Some(v) => Ok(v),
            None => {
                let v = Self::read_persisted(conn)?;
                st.db_version = Some(v);
                Ok(v)
            }
        }
    }

    /// Advance the counter to `max(local, merging) + 1` and persist it.
    ///
    /// Must run inside the transaction doing the related writes so the bump
    /// commits or rolls back with them.
    pub fn next_db_version(&self, conn: &Connection, merging: Option<i64>) -> Result<i64> {
        let mut st = self.inner.lock();
        Self::advance(&mut st, conn, merging)
    }

    /// Version and ordinal for one locally tracked mutation. The first call
    /// of a transaction allocates the version; later calls reuse it with
    /// increasing `seq`.
    pub(crate) fn tx_slot(&self, conn: &Connection) -> Result<TxSlot> {
        let mut st = self.inner.lock();
        let db_version = match st.tx_version {
            Some(v) => v,
            None => {
                let v = Self::advance(&mut st, conn, None)?;
                st.tx_version = Some(v);
                st.seq = 0;
                v
            }
        };
        let seq = st.seq;
        st.seq += 1;
        Ok(TxSlot { db_version, seq })
    }

    /// Manually advance the intra-transaction ordinal, returning the new
    /// value. Lets a host impose extra ordering between its own mutations.
    pub fn bump_seq(&self) -> i64 {
        let mut st = self.inner.lock();
        st.seq += 1;
        st.seq
    }

    /// Close the per-transaction scope. Called from the connection hooks;
    /// a rollback additionally invalidates the cached counter because the
    /// persisted value reverted underneath it.
    pub(crate) fn end_tx(&self, rolled_back: bool) {
        let mut st = self.inner.lock();
        st.tx_version = None;
        st.seq = 0;
        if rolled_back {
            st.db_version = None;
        }
    }

    fn advance(st: &mut ClockState, conn: &Connection, merging: Option<i64>) -> Result<i64> {
        let current = match st.db_version {
            Some(v) => v,
            None => Self::read_persisted(conn)?,
        };
        let next = current.max(merging.unwrap_or(0)) + 1;
        db::config_set(conn, KEY_DB_VERSION, &Value::Integer(next))?;
        st.db_version = Some(next);
        Ok(next)
    }

    fn read_persisted(conn: &Connection) -> Result<i64> {
        match db::config_get(conn, KEY_DB_VERSION)? {
            Some(Value::Integer(v)) => Ok(v),
            Some(other) => Err(Error::InvalidState(format!(
                "db version stored as {}, expected INTEGER",
                other.type_name()
            ))),
            None => Ok(0),
        }
    }
}
