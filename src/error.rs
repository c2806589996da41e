//! Crate-wide error type.
//!
//! Every fallible operation returns [`Result`]. Storage failures from the
//! underlying SQLite connection convert via `From`. Merge rejections are a
//! normal outcome, not an error (see [`crate::MergeOutcome`]).

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the sync layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A table or column is not known to the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying storage engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Reading or writing a payload file failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload blob failed structural validation.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A primary key uses a shape or type the key codec cannot represent.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A payload carried records this site originated but no longer holds.
    /// That happens when the site identity was regenerated or the database
    /// was restored from an older copy; applying would fork history.
    #[error("incoming payload contains own-site records unknown to local history")]
    IdentityReset,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound("table 'missing'".to_string());
        assert_eq!(err.to_string(), "not found: table 'missing'");
    }

    #[test]
    fn test_malformed_payload_display() {
        let err = Error::MalformedPayload("bad magic".to_string());
        assert_eq!(err.to_string(), "malformed payload: bad magic");
    }

    #[test]
    fn test_storage_from_rusqlite() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.to_string().starts_with("storage error:"));
    }

    #[test]
    fn test_unsupported_key_type_display() {
        let err = Error::UnsupportedKeyType("NULL in primary key".to_string());
        assert_eq!(err.to_string(), "unsupported key type: NULL in primary key");
    }

    #[test]
    fn test_identity_reset_display() {
        let msg = Error::IdentityReset.to_string();
        assert!(msg.contains("own-site records"));
    }
}
