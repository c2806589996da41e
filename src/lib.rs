//! Embedded multi-master replication for SQLite tables.
//!
//! A [`SyncContext`] wraps one `rusqlite::Connection` and turns registered
//! tables into conflict-free replicated state: the host performs its SQL as
//! usual and reports committed row mutations (`track_*`); replicas exchange
//! binary change payloads in any order, any number of times, and converge
//! to the same data without coordination. Per-column last-writer-wins
//! versioning resolves concurrent updates, a causal-length lifecycle
//! resolves delete/re-insert races deterministically.
//!
//! ```rust,no_run
//! use table_sync::{SyncContext, Value, Watermark};
//!
//! fn main() -> table_sync::Result<()> {
//!     let ctx = SyncContext::open("app.db")?;
//!     ctx.connection().execute_batch(
//!         "CREATE TABLE IF NOT EXISTS notes (id TEXT PRIMARY KEY, body TEXT)",
//!     )?;
//!     ctx.init_table("notes")?;
//!
//!     ctx.connection().execute("INSERT INTO notes VALUES ('n1', 'hello')", [])?;
//!     ctx.track_insert("notes", &[Value::Text("n1".into())])?;
//!
//!     // Ship the blob to peers; apply blobs received from them.
//!     let payload = ctx.encode_payload(Watermark::default())?;
//!     send_to_peers(&payload.blob);
//!     for blob in receive_from_peers() {
//!         ctx.apply_payload(&blob)?;
//!     }
//!     Ok(())
//! }
//! # fn send_to_peers(_blob: &[u8]) {}
//! # fn receive_from_peers() -> Vec<Vec<u8>> { Vec::new() }
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod context;
pub mod error;
pub mod payload;
pub mod pk;
pub mod registry;
pub mod types;

mod clock;
mod db;
mod merge;
mod meta;
mod tracker;

// Re-export commonly used types
pub use config::SyncConfig;
pub use context::SyncContext;
pub use db::{CONFIG_TABLE, META_SUFFIX, TABLES_TABLE};
pub use error::{Error, Result};
pub use merge::MergeOutcome;
pub use payload::{ApplyReport, EncodedPayload, Watermark};
pub use registry::{TableAlgo, TableInfo};
pub use types::{
    ChangeRecord, SiteId, Value, VersionKey, CHANGE_RECORD_FIELDS, RESTRICTED_VALUE,
    SENTINEL_COLUMN, TOMBSTONE_VALUE,
};
