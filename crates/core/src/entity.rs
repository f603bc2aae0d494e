//! Entity trait: identity + continuity across state changes.

use crate::error::{LedgerError, LedgerResult};
use crate::id::TenantId;

/// A tenant-owned ledger row.
///
/// Ledger rows (invoices, payments, allocations, ...) are entities: two rows with
/// the same id are the same row, whatever their current balances say.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// The school this row belongs to.
    fn tenant_id(&self) -> TenantId;

    /// Refuse to write a row into another tenant's ledger.
    fn ensure_tenant(&self, tenant_id: TenantId) -> LedgerResult<()> {
        if self.tenant_id() == tenant_id {
            Ok(())
        } else {
            Err(LedgerError::invariant(format!(
                "row {:?} of tenant {} written through tenant {}",
                self.id(),
                self.tenant_id(),
                tenant_id
            )))
        }
    }
}
