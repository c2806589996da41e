//! Runtime configuration for a sync context.

use crate::registry::TableAlgo;

/// Tunables for a [`SyncContext`](crate::SyncContext).
///
/// Every field has a working default; start from `SyncConfig::default()` and
/// override through the builder methods.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Algorithm assigned to tables registered without an explicit one.
    pub default_algo: TableAlgo,
    /// Accept single-column INTEGER primary keys. Off by default: such keys
    /// alias the rowid, and independently assigned rowids collide across
    /// replicas.
    pub skip_int_pk_check: bool,
    /// Upper bound on rows per encoded payload, `None` for unbounded.
    /// Callers page through a backlog by feeding each returned watermark
    /// into the next encode.
    pub payload_row_limit: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_algo: TableAlgo::CausalLengthSet,
            skip_int_pk_check: false,
            payload_row_limit: None,
        }
    }
}

impl SyncConfig {
    /// Set the algorithm used by [`init_table`](crate::SyncContext::init_table).
    pub fn with_default_algo(mut self, algo: TableAlgo) -> Self {
        self.default_algo = algo;
        self
    }

    /// Allow or refuse single-column INTEGER primary keys globally.
    pub fn with_skip_int_pk_check(mut self, skip: bool) -> Self {
        self.skip_int_pk_check = skip;
        self
    }

    /// Cap the number of rows per encoded payload.
    pub fn with_payload_row_limit(mut self, limit: usize) -> Self {
        self.payload_row_limit = Some(limit);
        self
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.default_algo, TableAlgo::CausalLengthSet);
        assert!(!cfg.skip_int_pk_check);
        assert!(cfg.payload_row_limit.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let cfg = SyncConfig::default()
            .with_default_algo(TableAlgo::GrowOnlySet)
            .with_skip_int_pk_check(true)
            .with_payload_row_limit(500);
        assert_eq!(cfg.default_algo, TableAlgo::GrowOnlySet);
        assert!(cfg.skip_int_pk_check);
        assert_eq!(cfg.payload_row_limit, Some(500));
    }

    #[test]
    fn test_config_clone() {
        let cfg = SyncConfig::default().with_payload_row_limit(10);
        let cloned = cfg.clone();
        assert_eq!(cloned.payload_row_limit, Some(10));
        assert_eq!(cloned.default_algo, cfg.default_algo);
    }

    #[test]
    fn test_config_debug() {
        let cfg = SyncConfig::default();
        let debug_str = format!("{:?}", cfg);
        assert!(debug_str.contains("default_algo"));
        assert!(debug_str.contains("CausalLengthSet"));
    }
}
