//! `bursar-core`: billing-ledger foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, money arithmetic, the error taxonomy and optimistic version checks.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod version;

pub use entity::Entity;
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use id::{
    AdjustmentId, AllocationId, ClassId, InvoiceId, PaymentId, PayoutRuleId, StudentId,
    TeacherId, TenantId, UserId,
};
pub use money::{BasisPoints, Money, round_half_up};
pub use version::ExpectedVersion;
