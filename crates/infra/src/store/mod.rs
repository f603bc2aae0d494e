//! Ledger persistence boundary.
//!
//! Every ledger mutation runs inside one [`LedgerTx`], opened for exactly one
//! tenant. `lock_*` methods take row locks that are held until the
//! transaction ends, so two writers touching the same invoice, payment or
//! daily-close row serialize. Dropping a transaction without calling
//! [`LedgerTx::commit`] rolls it back.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;

use bursar_billing::{Invoice, InvoiceAdjustment, Payment, PaymentAllocation};
use bursar_core::{
    ClassId, ExpectedVersion, InvoiceId, LedgerResult, PaymentId, StudentId, TeacherId, TenantId,
};
use bursar_payouts::PayoutRule;
use bursar_reconciliation::DailyClose;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self, tenant_id: TenantId) -> LedgerResult<Box<dyn LedgerTx>>;
}

#[async_trait]
pub trait LedgerTx: Send {
    fn tenant_id(&self) -> TenantId;

    /// Next receipt number for this tenant, formatted for `date`.
    async fn next_receipt_number(&mut self, date: NaiveDate) -> LedgerResult<String>;

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()>;
    async fn get_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>>;
    async fn lock_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>>;
    /// Issued invoices of the student with a positive balance, locked.
    async fn lock_open_invoices(&mut self, student_id: StudentId) -> LedgerResult<Vec<Invoice>>;
    async fn lock_invoices(&mut self, ids: &[InvoiceId]) -> LedgerResult<Vec<Invoice>>;
    /// `sent` invoices with a balance that fell due before `today`, locked.
    async fn lock_overdue_candidates(&mut self, today: NaiveDate) -> LedgerResult<Vec<Invoice>>;
    async fn update_invoice(&mut self, invoice: &Invoice, expected: ExpectedVersion) -> LedgerResult<()>;
    async fn list_invoices(&mut self, student_id: Option<StudentId>) -> LedgerResult<Vec<Invoice>>;

    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()>;
    async fn get_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>>;
    async fn lock_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>>;
    /// Completed payments of the student, oldest first, locked.
    async fn lock_student_payments(&mut self, student_id: StudentId) -> LedgerResult<Vec<Payment>>;
    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> LedgerResult<()>;
    async fn payments_on(&mut self, date: NaiveDate) -> LedgerResult<Vec<Payment>>;

    async fn insert_allocations(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()>;
    async fn allocations_for_payments(&mut self, ids: &[PaymentId]) -> LedgerResult<Vec<PaymentAllocation>>;
    async fn allocations_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<PaymentAllocation>>;
    /// Persist `reversed_at` on rows previously inserted.
    async fn mark_allocations_reversed(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()>;
    /// Active allocations on invoices for `class_ids` taking effect within `[start, end]`.
    async fn revenue_allocations(
        &mut self,
        class_ids: &[ClassId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> LedgerResult<Vec<PaymentAllocation>>;

    async fn insert_adjustment(&mut self, adjustment: &InvoiceAdjustment) -> LedgerResult<()>;
    async fn adjustments_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<InvoiceAdjustment>>;

    async fn get_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>>;
    async fn lock_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>>;
    /// A concurrent first save for the same date surfaces as `Concurrency`.
    async fn insert_daily_close(&mut self, close: &DailyClose) -> LedgerResult<()>;
    /// Only applies while the stored row is unlocked; a locked row yields
    /// `AlreadyFinalized`.
    async fn update_daily_close(&mut self, close: &DailyClose, expected: ExpectedVersion) -> LedgerResult<()>;

    async fn insert_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()>;
    async fn lock_payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>>;
    async fn update_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()>;
    async fn payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>>;

    async fn assign_class_teacher(&mut self, class_id: ClassId, teacher_id: TeacherId) -> LedgerResult<()>;
    async fn classes_for_teacher(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<ClassId>>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;
}
