//! Optimistic concurrency expectations for versioned ledger rows.

use crate::error::{LedgerError, LedgerResult};

/// Optimistic concurrency expectation for a versioned row.
///
/// Invoices, payments and daily-close records carry a `version` that increments
/// on every write. Writers state which version they read; the store refuses the
/// write if someone else got there first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (inserts, administrative rewrites).
    Any,
    /// Require the row to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> LedgerResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(LedgerError::concurrency(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn any_matches_every_version() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn stale_exact_version_is_a_retryable_concurrency_error() {
        let err = ExpectedVersion::Exact(3).check(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Concurrency);
        assert!(err.is_retryable());
        assert!(ExpectedVersion::Exact(4).check(4).is_ok());
    }
}
