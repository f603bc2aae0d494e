//! Stateless service objects that run one ledger operation per store
//! transaction. Each call receives the store handle explicitly.

pub mod daily_close;
pub mod ledger;
pub mod payouts;

use chrono::{DateTime, Utc};

use bursar_core::{TenantId, UserId};

pub use daily_close::DailyCloseService;
pub use ledger::{
    CreditApplication, InvoiceDetails, PaymentDetails, PaymentReceipt, RefundReceipt,
    LedgerService, StudentCredit,
};
pub use payouts::PayoutService;

/// Who is acting, for which tenant, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub tenant_id: TenantId,
    pub actor: UserId,
    pub now: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(tenant_id: TenantId, actor: UserId) -> Self {
        Self {
            tenant_id,
            actor,
            now: Utc::now(),
        }
    }

    /// Pin the clock (tests, replays).
    pub fn at(self, now: DateTime<Utc>) -> Self {
        Self { now, ..self }
    }
}
