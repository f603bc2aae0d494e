//! Ledger error model.

use chrono::NaiveDate;
use thiserror::Error;

use crate::id::{PaymentId, PayoutRuleId, TeacherId};
use crate::money::Money;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Coarse classification used by callers (HTTP mapping, retry decisions).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Unknown invoice/payment/teacher/rule.
    NotFound,
    /// State conflict; the caller may retry with corrected input.
    Conflict,
    /// Lost update or lock race; the caller should re-fetch and resubmit.
    Concurrency,
    /// Storage unavailable or transaction aborted.
    Persistence,
    /// A structural invariant would have been broken (a bug, not user input).
    Internal,
}

/// Ledger-level error.
///
/// Every failing operation rolls back completely; these values only describe
/// why, never a partially applied state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Non-positive payment amount, negative counted cash, zero adjustment...
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A value failed validation (e.g. missing field, bad period).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Strict allocation policy: the payment exceeds what open invoices can absorb.
    #[error("payment of {amount} exceeds allocatable balance {allocatable}")]
    Overpayment { amount: Money, allocatable: Money },

    #[error("daily close for {0} is already finalized")]
    AlreadyFinalized(NaiveDate),

    #[error("payment {0} is already refunded")]
    AlreadyRefunded(PaymentId),

    #[error("date {date} is in the future (today is {today})")]
    FutureDate { date: NaiveDate, today: NaiveDate },

    #[error("teacher {teacher_id} has {} overlapping active payout rules", .candidates.len())]
    AmbiguousPayoutRule {
        teacher_id: TeacherId,
        candidates: Vec<PayoutRuleId>,
    },

    #[error("receipt number already issued: {0}")]
    DuplicateReceipt(String),

    /// A concurrent writer changed the row first.
    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl LedgerError {
    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::InvalidAmount(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::Validation(_)
            | LedgerError::InvalidId(_) => ErrorKind::Validation,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Overpayment { .. }
            | LedgerError::AlreadyFinalized(_)
            | LedgerError::AlreadyRefunded(_)
            | LedgerError::FutureDate { .. }
            | LedgerError::AmbiguousPayoutRule { .. } => ErrorKind::Conflict,
            LedgerError::DuplicateReceipt(_) | LedgerError::Concurrency(_) => {
                ErrorKind::Concurrency
            }
            LedgerError::Persistence(_) => ErrorKind::Persistence,
            LedgerError::InvariantViolation(_) => ErrorKind::Internal,
        }
    }

    /// Only lost updates are worth resubmitting unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    /// Stable machine-readable code for API bodies and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::Validation(_) => "validation_error",
            LedgerError::InvalidId(_) => "invalid_id",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::Overpayment { .. } => "overpayment",
            LedgerError::AlreadyFinalized(_) => "already_finalized",
            LedgerError::AlreadyRefunded(_) => "already_refunded",
            LedgerError::FutureDate { .. } => "future_date",
            LedgerError::AmbiguousPayoutRule { .. } => "ambiguous_payout_rule",
            LedgerError::DuplicateReceipt(_) => "duplicate_receipt",
            LedgerError::Concurrency(_) => "conflict",
            LedgerError::Persistence(_) => "persistence_error",
            LedgerError::InvariantViolation(_) => "invariant_violation",
        }
    }
}
