use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use bursar_billing::allocation::fifo_key;
use bursar_billing::{
    Invoice, InvoiceAdjustment, InvoiceStatus, Payment, PaymentAllocation, format_receipt_number,
};
use bursar_core::{
    ClassId, Entity, ExpectedVersion, InvoiceId, LedgerError, LedgerResult, PaymentId, StudentId,
    TeacherId, TenantId,
};
use bursar_payouts::PayoutRule;
use bursar_reconciliation::DailyClose;

use super::{LedgerStore, LedgerTx};

#[derive(Debug, Clone, Default)]
struct TenantLedger {
    receipt_seq: u64,
    receipts: HashSet<String>,
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
    allocations: Vec<PaymentAllocation>,
    adjustments: Vec<InvoiceAdjustment>,
    closes: BTreeMap<NaiveDate, DailyClose>,
    payout_rules: Vec<PayoutRule>,
    class_teachers: HashMap<ClassId, TeacherId>,
}

/// In-memory ledger store.
///
/// A transaction holds its tenant's lock from `begin` until commit or drop,
/// so transactions of one tenant run one at a time. Reads see the committed
/// ledger until the first write switches the transaction to a private copy;
/// an uncommitted transaction leaves no trace. Intended for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    tenants: Arc<Mutex<HashMap<TenantId, Arc<AsyncMutex<TenantLedger>>>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, tenant_id: TenantId) -> LedgerResult<InMemoryLedgerTx> {
        let slot = {
            let mut tenants = self
                .tenants
                .lock()
                .map_err(|_| LedgerError::persistence("lock poisoned"))?;
            tenants.entry(tenant_id).or_default().clone()
        };
        Ok(InMemoryLedgerTx {
            tenant_id,
            guard: slot.lock_owned().await,
            working: None,
        })
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self, tenant_id: TenantId) -> LedgerResult<Box<dyn LedgerTx>> {
        Ok(Box::new(self.open(tenant_id).await?))
    }
}

struct InMemoryLedgerTx {
    tenant_id: TenantId,
    guard: OwnedMutexGuard<TenantLedger>,
    /// Copy of the guarded ledger, taken on the first write.
    working: Option<TenantLedger>,
}

impl InMemoryLedgerTx {
    fn state(&self) -> &TenantLedger {
        self.working.as_ref().unwrap_or(&*self.guard)
    }

    fn state_mut(&mut self) -> &mut TenantLedger {
        let committed: &TenantLedger = &self.guard;
        self.working.get_or_insert_with(|| committed.clone())
    }

    fn stored_invoice(&self, id: InvoiceId) -> LedgerResult<&Invoice> {
        self.state()
            .invoices
            .get(&id)
            .ok_or_else(|| LedgerError::not_found("invoice", id))
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn next_receipt_number(&mut self, date: NaiveDate) -> LedgerResult<String> {
        let ledger = self.state_mut();
        ledger.receipt_seq += 1;
        Ok(format_receipt_number(date, ledger.receipt_seq))
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        invoice.ensure_tenant(self.tenant_id)?;
        invoice.check_invariants()?;
        if self.state().invoices.contains_key(&invoice.id) {
            return Err(LedgerError::concurrency(format!(
                "invoice {} already exists",
                invoice.id
            )));
        }
        self.state_mut().invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        Ok(self.state().invoices.get(&id).cloned())
    }

    async fn lock_invoice(&mut self, id: InvoiceId) -> LedgerResult<Option<Invoice>> {
        self.get_invoice(id).await
    }

    async fn lock_open_invoices(&mut self, student_id: StudentId) -> LedgerResult<Vec<Invoice>> {
        let mut open: Vec<Invoice> = self
            .state()
            .invoices
            .values()
            .filter(|i| i.student_id == student_id && i.is_open())
            .cloned()
            .collect();
        open.sort_by_key(fifo_key);
        Ok(open)
    }

    async fn lock_invoices(&mut self, ids: &[InvoiceId]) -> LedgerResult<Vec<Invoice>> {
        ids.iter().map(|id| self.stored_invoice(*id).cloned()).collect()
    }

    async fn lock_overdue_candidates(&mut self, today: NaiveDate) -> LedgerResult<Vec<Invoice>> {
        let mut due: Vec<Invoice> = self
            .state()
            .invoices
            .values()
            .filter(|i| {
                i.status == InvoiceStatus::Sent && i.balance_due.is_positive() && i.due_date < today
            })
            .cloned()
            .collect();
        due.sort_by_key(fifo_key);
        Ok(due)
    }

    async fn update_invoice(&mut self, invoice: &Invoice, expected: ExpectedVersion) -> LedgerResult<()> {
        invoice.ensure_tenant(self.tenant_id)?;
        invoice.check_invariants()?;
        let stored = self.stored_invoice(invoice.id)?;
        expected.check(stored.version)?;
        self.state_mut().invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn list_invoices(&mut self, student_id: Option<StudentId>) -> LedgerResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .state()
            .invoices
            .values()
            .filter(|i| student_id.is_none_or(|s| i.student_id == s))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.issue_date, i.id));
        Ok(invoices)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        payment.ensure_tenant(self.tenant_id)?;
        if !self.state_mut().receipts.insert(payment.receipt_number.clone()) {
            return Err(LedgerError::DuplicateReceipt(payment.receipt_number.clone()));
        }
        self.state_mut().payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
        Ok(self.state().payments.get(&id).cloned())
    }

    async fn lock_payment(&mut self, id: PaymentId) -> LedgerResult<Option<Payment>> {
        self.get_payment(id).await
    }

    async fn lock_student_payments(&mut self, student_id: StudentId) -> LedgerResult<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .state()
            .payments
            .values()
            .filter(|p| p.student_id == student_id && !p.is_refunded())
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.payment_date, p.created_at, p.id));
        Ok(payments)
    }

    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> LedgerResult<()> {
        payment.ensure_tenant(self.tenant_id)?;
        let stored = self
            .state()
            .payments
            .get(&payment.id)
            .ok_or_else(|| LedgerError::not_found("payment", payment.id))?;
        expected.check(stored.version)?;
        if stored.receipt_number != payment.receipt_number {
            return Err(LedgerError::invariant("receipt numbers are immutable"));
        }
        self.state_mut().payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn payments_on(&mut self, date: NaiveDate) -> LedgerResult<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .state()
            .payments
            .values()
            .filter(|p| p.payment_date == date)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.id);
        Ok(payments)
    }

    async fn insert_allocations(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
        for row in rows {
            row.ensure_tenant(self.tenant_id)?;
            if !self.state().payments.contains_key(&row.payment_id) {
                return Err(LedgerError::not_found("payment", row.payment_id));
            }
            self.stored_invoice(row.invoice_id)?;
        }
        self.state_mut().allocations.extend_from_slice(rows);
        Ok(())
    }

    async fn allocations_for_payments(&mut self, ids: &[PaymentId]) -> LedgerResult<Vec<PaymentAllocation>> {
        Ok(self
            .state()
            .allocations
            .iter()
            .filter(|a| ids.contains(&a.payment_id))
            .cloned()
            .collect())
    }

    async fn allocations_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<PaymentAllocation>> {
        Ok(self
            .state()
            .allocations
            .iter()
            .filter(|a| a.invoice_id == id)
            .cloned()
            .collect())
    }

    async fn mark_allocations_reversed(&mut self, rows: &[PaymentAllocation]) -> LedgerResult<()> {
        for row in rows {
            let stored = self
                .state_mut()
                .allocations
                .iter_mut()
                .find(|a| a.id == row.id)
                .ok_or_else(|| LedgerError::not_found("allocation", row.id))?;
            if !stored.is_active() {
                return Err(LedgerError::concurrency(format!(
                    "allocation {} already reversed",
                    row.id
                )));
            }
            stored.reversed_at = row.reversed_at;
        }
        Ok(())
    }

    async fn revenue_allocations(
        &mut self,
        class_ids: &[ClassId],
        start: NaiveDate,
        end: NaiveDate,
    ) -> LedgerResult<Vec<PaymentAllocation>> {
        let ledger = self.state();
        Ok(ledger
            .allocations
            .iter()
            .filter(|a| a.is_active() && start <= a.allocated_on && a.allocated_on <= end)
            .filter(|a| {
                ledger
                    .invoices
                    .get(&a.invoice_id)
                    .and_then(|i| i.class_id)
                    .is_some_and(|c| class_ids.contains(&c))
            })
            .cloned()
            .collect())
    }

    async fn insert_adjustment(&mut self, adjustment: &InvoiceAdjustment) -> LedgerResult<()> {
        adjustment.ensure_tenant(self.tenant_id)?;
        self.stored_invoice(adjustment.invoice_id)?;
        self.state_mut().adjustments.push(adjustment.clone());
        Ok(())
    }

    async fn adjustments_for_invoice(&mut self, id: InvoiceId) -> LedgerResult<Vec<InvoiceAdjustment>> {
        Ok(self
            .state()
            .adjustments
            .iter()
            .filter(|a| a.invoice_id == id)
            .cloned()
            .collect())
    }

    async fn get_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
        Ok(self.state().closes.get(&date).cloned())
    }

    async fn lock_daily_close(&mut self, date: NaiveDate) -> LedgerResult<Option<DailyClose>> {
        self.get_daily_close(date).await
    }

    async fn insert_daily_close(&mut self, close: &DailyClose) -> LedgerResult<()> {
        close.ensure_tenant(self.tenant_id)?;
        if self.state().closes.contains_key(&close.close_date) {
            return Err(LedgerError::concurrency(format!(
                "daily close for {} was created concurrently",
                close.close_date
            )));
        }
        self.state_mut().closes.insert(close.close_date, close.clone());
        Ok(())
    }

    async fn update_daily_close(&mut self, close: &DailyClose, expected: ExpectedVersion) -> LedgerResult<()> {
        close.ensure_tenant(self.tenant_id)?;
        let stored = self
            .state()
            .closes
            .get(&close.close_date)
            .ok_or_else(|| LedgerError::not_found("daily close", close.close_date))?;
        if stored.is_locked {
            return Err(LedgerError::AlreadyFinalized(close.close_date));
        }
        expected.check(stored.version)?;
        self.state_mut().closes.insert(close.close_date, close.clone());
        Ok(())
    }

    async fn insert_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
        rule.ensure_tenant(self.tenant_id)?;
        self.state_mut().payout_rules.push(rule.clone());
        Ok(())
    }

    async fn lock_payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
        self.payout_rules(teacher_id).await
    }

    async fn update_payout_rule(&mut self, rule: &PayoutRule) -> LedgerResult<()> {
        rule.ensure_tenant(self.tenant_id)?;
        let stored = self
            .state_mut()
            .payout_rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| LedgerError::not_found("payout rule", rule.id))?;
        *stored = rule.clone();
        Ok(())
    }

    async fn payout_rules(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<PayoutRule>> {
        let mut rules: Vec<PayoutRule> = self
            .state()
            .payout_rules
            .iter()
            .filter(|r| r.teacher_id == teacher_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.effective_from, r.created_at, r.id));
        Ok(rules)
    }

    async fn assign_class_teacher(&mut self, class_id: ClassId, teacher_id: TeacherId) -> LedgerResult<()> {
        self.state_mut().class_teachers.insert(class_id, teacher_id);
        Ok(())
    }

    async fn classes_for_teacher(&mut self, teacher_id: TeacherId) -> LedgerResult<Vec<ClassId>> {
        let mut classes: Vec<ClassId> = self
            .state()
            .class_teachers
            .iter()
            .filter(|(_, t)| **t == teacher_id)
            .map(|(c, _)| *c)
            .collect();
        classes.sort();
        Ok(classes)
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let InMemoryLedgerTx {
            mut guard, working, ..
        } = *self;
        if let Some(working) = working {
            *guard = working;
        }
        Ok(())
    }
}
