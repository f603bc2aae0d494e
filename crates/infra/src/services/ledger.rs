use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{info, instrument, warn};

use bursar_billing::{
    AllocationTarget, ChainWalker, Invoice, InvoiceAdjustment, NewAdjustment, NewInvoice,
    NewPayment, OverpaymentPolicy, Payment, PaymentAllocation, check_invoice_coverage,
    check_parent_link, check_payment_conservation, execute_plan, plan_allocation,
    reverse_allocations, unapplied_credit,
};
use bursar_core::{
    AdjustmentId, ExpectedVersion, InvoiceId, LedgerError, LedgerResult, Money, PaymentId,
    StudentId,
};

use crate::config::LedgerConfig;
use crate::store::{LedgerStore, LedgerTx};

use super::OperationContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceDetails {
    pub invoice: Invoice,
    pub allocations: Vec<PaymentAllocation>,
    pub adjustments: Vec<InvoiceAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDetails {
    pub payment: Payment,
    pub allocations: Vec<PaymentAllocation>,
    pub unapplied: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub allocations: Vec<PaymentAllocation>,
    /// Kept as student credit; zero under the strict policy.
    pub unapplied: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundReceipt {
    pub payment: Payment,
    pub reversed_allocations: Vec<PaymentAllocation>,
    /// Unapplied credit that disappeared with the payment.
    pub voided_credit: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentCredit {
    pub student_id: StudentId,
    pub unapplied: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditApplication {
    pub student_id: StudentId,
    pub allocations: Vec<PaymentAllocation>,
    pub remaining_credit: Money,
}

/// Invoices, payments, allocations and adjustments.
#[derive(Debug, Clone, Default)]
pub struct LedgerService {
    config: LedgerConfig,
}

impl LedgerService {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, student_id = %cmd.student_id), err)]
    pub async fn create_invoice(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        cmd: NewInvoice,
    ) -> LedgerResult<Invoice> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;

        let parent = match cmd.parent_invoice_id {
            Some(parent_id) => {
                let parent = tx
                    .lock_invoice(parent_id)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("invoice", parent_id))?;
                let chain = walk_chain(tx.as_mut(), parent.clone(), self.config.max_invoice_chain_len).await?;
                Some((parent, chain.len()))
            }
            None => None,
        };

        let invoice = Invoice::create(InvoiceId::new(), ctx.tenant_id, cmd, today, ctx.now)?;
        if let Some((parent, chain_len)) = &parent {
            check_parent_link(parent, &invoice, *chain_len, self.config.max_invoice_chain_len)?;
        }

        tx.insert_invoice(&invoice).await?;
        tx.commit().await?;

        info!(invoice_id = %invoice.id, total = %invoice.total, status = invoice.status.as_str(), "invoice created");
        Ok(invoice)
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, invoice_id = %invoice_id), err)]
    pub async fn issue_invoice(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        invoice_id: InvoiceId,
    ) -> LedgerResult<Invoice> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("invoice", invoice_id))?;
        let read = invoice.version;
        invoice.issue(today, ctx.now)?;
        tx.update_invoice(&invoice, ExpectedVersion::Exact(read)).await?;
        tx.commit().await?;

        info!(status = invoice.status.as_str(), "invoice issued");
        Ok(invoice)
    }

    /// Record a payment, assign its receipt number and allocate it, all in one
    /// transaction.
    #[instrument(
        skip_all,
        fields(tenant_id = %ctx.tenant_id, student_id = %cmd.student_id, amount = %cmd.amount),
        err
    )]
    pub async fn record_payment(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        cmd: NewPayment,
    ) -> LedgerResult<PaymentReceipt> {
        let today = self.config.business_date(ctx.now);
        if !cmd.amount.is_positive() {
            return Err(LedgerError::invalid_amount("payment amount must be positive"));
        }

        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut payment = Payment::record(
            PaymentId::new(),
            ctx.tenant_id,
            String::new(),
            cmd,
            ctx.actor,
            today,
            ctx.now,
        )?;

        let mut invoices = match payment.invoice_id {
            Some(target_id) => {
                let target = tx
                    .lock_invoice(target_id)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("invoice", target_id))?;
                if target.student_id != payment.student_id {
                    return Err(LedgerError::validation(format!(
                        "invoice {target_id} does not belong to student {}",
                        payment.student_id
                    )));
                }
                vec![target]
            }
            None => tx.lock_open_invoices(payment.student_id).await?,
        };

        let target = match payment.invoice_id {
            Some(_) => AllocationTarget::Invoice(&invoices[0]),
            None => AllocationTarget::OpenInvoices(&invoices),
        };
        let plan = plan_allocation(payment.amount, target, self.config.overpayment_policy)
            .inspect_err(|e| {
                if let LedgerError::Overpayment { amount, allocatable } = e {
                    warn!(%amount, %allocatable, "payment exceeds what open invoices can absorb, rejected");
                }
            })?;
        let allocated = plan.allocated()?;
        if plan.unapplied.is_positive() {
            let payments = tx.lock_student_payments(payment.student_id).await?;
            let ids: Vec<PaymentId> = payments.iter().map(|p| p.id).collect();
            let allocations = tx.allocations_for_payments(&ids).await?;
            credit_total(&payments, &allocations)
                .and_then(|held| held.checked_add(plan.unapplied))
                .map_err(|_| {
                    LedgerError::validation(format!(
                        "student {} credit would exceed the representable amount",
                        payment.student_id
                    ))
                })?;
        }

        let read_versions = versions(&invoices);
        let allocations = execute_plan(&plan, &payment, &mut invoices, payment.payment_date, today, ctx.now)?;
        let touched: Vec<Invoice> = invoices
            .into_iter()
            .filter(|i| plan.steps.iter().any(|s| s.invoice_id == i.id))
            .collect();
        write_invoices(tx.as_mut(), &touched, &read_versions).await?;

        // Numbered last: the counter row stays locked until commit.
        payment.receipt_number = tx.next_receipt_number(payment.payment_date).await?;
        tx.insert_payment(&payment).await?;
        tx.insert_allocations(&allocations).await?;
        verify(tx.as_mut(), &touched, std::slice::from_ref(&payment)).await?;
        tx.commit().await?;

        info!(
            payment_id = %payment.id,
            receipt = %payment.receipt_number,
            %allocated,
            unapplied = %plan.unapplied,
            "payment recorded"
        );
        Ok(PaymentReceipt {
            payment,
            allocations,
            unapplied: plan.unapplied,
        })
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, payment_id = %payment_id), err)]
    pub async fn refund_payment(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        payment_id: PaymentId,
    ) -> LedgerResult<RefundReceipt> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("payment", payment_id))?;
        let read = payment.version;
        payment.refund(ctx.actor, ctx.now)?;

        let mut allocations = tx.allocations_for_payments(&[payment_id]).await?;
        let invoice_ids: Vec<InvoiceId> = allocations
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.invoice_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut invoices = tx.lock_invoices(&invoice_ids).await?;
        let read_versions = versions(&invoices);

        let reversed = reverse_allocations(&mut allocations, &mut invoices, today, ctx.now)?;
        write_invoices(tx.as_mut(), &invoices, &read_versions).await?;
        tx.mark_allocations_reversed(&reversed).await?;
        tx.update_payment(&payment, ExpectedVersion::Exact(read)).await?;
        verify(tx.as_mut(), &invoices, &[]).await?;
        let reversed_total = Money::try_sum(reversed.iter().map(|a| a.amount))?;
        let voided_credit = payment.amount.checked_sub(reversed_total)?;
        tx.commit().await?;

        info!(
            receipt = %payment.receipt_number,
            reversed = reversed.len(),
            %voided_credit,
            "payment refunded"
        );
        Ok(RefundReceipt {
            payment,
            reversed_allocations: reversed,
            voided_credit,
        })
    }

    #[instrument(
        skip_all,
        fields(tenant_id = %ctx.tenant_id, invoice_id = %invoice_id, kind = cmd.kind.as_str()),
        err
    )]
    pub async fn apply_adjustment(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        invoice_id: InvoiceId,
        cmd: NewAdjustment,
    ) -> LedgerResult<Invoice> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("invoice", invoice_id))?;
        let read = invoice.version;
        let adjustment = invoice.apply_adjustment(AdjustmentId::new(), cmd, ctx.actor, today, ctx.now)?;
        tx.update_invoice(&invoice, ExpectedVersion::Exact(read)).await?;
        tx.insert_adjustment(&adjustment).await?;
        tx.commit().await?;

        info!(amount = %adjustment.amount, total = %invoice.total, "invoice adjusted");
        Ok(invoice)
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, student_id = %student_id), err)]
    pub async fn student_credit(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        student_id: StudentId,
    ) -> LedgerResult<StudentCredit> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        let payments = tx.lock_student_payments(student_id).await?;
        let ids: Vec<PaymentId> = payments.iter().map(|p| p.id).collect();
        let allocations = tx.allocations_for_payments(&ids).await?;
        let unapplied = credit_total(&payments, &allocations)?;
        Ok(StudentCredit {
            student_id,
            unapplied,
        })
    }

    /// Spend the student's unapplied credit on their open invoices, oldest
    /// payment first, oldest invoice first.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, student_id = %student_id), err)]
    pub async fn apply_student_credit(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        student_id: StudentId,
    ) -> LedgerResult<CreditApplication> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;
        let payments = tx.lock_student_payments(student_id).await?;
        let ids: Vec<PaymentId> = payments.iter().map(|p| p.id).collect();
        let existing = tx.allocations_for_payments(&ids).await?;
        let mut invoices = tx.lock_open_invoices(student_id).await?;
        let read_versions = versions(&invoices);

        let mut created = Vec::new();
        let mut remaining = Money::ZERO;
        for payment in &payments {
            let credit = unapplied_credit(payment, &existing)?;
            if !credit.is_positive() {
                continue;
            }
            let plan = plan_allocation(
                credit,
                AllocationTarget::OpenInvoices(&invoices),
                OverpaymentPolicy::Credit,
            )?;
            remaining = remaining.checked_add(plan.unapplied)?;
            let rows = execute_plan(&plan, payment, &mut invoices, today, today, ctx.now)?;
            created.extend(rows);
        }

        if !created.is_empty() {
            let touched: Vec<Invoice> = invoices
                .into_iter()
                .filter(|i| created.iter().any(|a| a.invoice_id == i.id))
                .collect();
            write_invoices(tx.as_mut(), &touched, &read_versions).await?;
            tx.insert_allocations(&created).await?;
            verify(tx.as_mut(), &touched, &payments).await?;
            tx.commit().await?;
            info!(allocations = created.len(), remaining = %remaining, "student credit applied");
        }

        Ok(CreditApplication {
            student_id,
            allocations: created,
            remaining_credit: remaining,
        })
    }

    /// Mark every past-due `sent` invoice `overdue`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn refresh_overdue(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
    ) -> LedgerResult<Vec<Invoice>> {
        let today = self.config.business_date(ctx.now);
        let mut tx = store.begin(ctx.tenant_id).await?;
        let mut candidates = tx.lock_overdue_candidates(today).await?;
        let mut changed = Vec::new();
        for invoice in candidates.iter_mut() {
            let read = invoice.version;
            if invoice.refresh_overdue(today, ctx.now) {
                tx.update_invoice(invoice, ExpectedVersion::Exact(read)).await?;
                changed.push(invoice.clone());
            }
        }
        tx.commit().await?;

        info!(changed = changed.len(), %today, "overdue invoices refreshed");
        Ok(changed)
    }

    /// Recurring chain ending at `invoice_id`, root first.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, invoice_id = %invoice_id), err)]
    pub async fn invoice_chain(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        invoice_id: InvoiceId,
    ) -> LedgerResult<Vec<Invoice>> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        let leaf = tx
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("invoice", invoice_id))?;
        walk_chain(tx.as_mut(), leaf, self.config.max_invoice_chain_len).await
    }

    pub async fn get_invoice(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        invoice_id: InvoiceId,
    ) -> LedgerResult<InvoiceDetails> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        let invoice = tx
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("invoice", invoice_id))?;
        let allocations = tx.allocations_for_invoice(invoice_id).await?;
        let adjustments = tx.adjustments_for_invoice(invoice_id).await?;
        Ok(InvoiceDetails {
            invoice,
            allocations,
            adjustments,
        })
    }

    pub async fn list_invoices(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        student_id: Option<StudentId>,
    ) -> LedgerResult<Vec<Invoice>> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        tx.list_invoices(student_id).await
    }

    pub async fn get_payment(
        &self,
        store: &dyn LedgerStore,
        ctx: OperationContext,
        payment_id: PaymentId,
    ) -> LedgerResult<PaymentDetails> {
        let mut tx = store.begin(ctx.tenant_id).await?;
        let payment = tx
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("payment", payment_id))?;
        let allocations = tx.allocations_for_payments(&[payment_id]).await?;
        let unapplied = unapplied_credit(&payment, &allocations)?;
        Ok(PaymentDetails {
            payment,
            allocations,
            unapplied,
        })
    }
}

/// Unapplied credit held across a student's payments.
fn credit_total(payments: &[Payment], allocations: &[PaymentAllocation]) -> LedgerResult<Money> {
    let per_payment = payments
        .iter()
        .map(|p| unapplied_credit(p, allocations))
        .collect::<LedgerResult<Vec<_>>>()?;
    Money::try_sum(per_payment)
}

fn versions(invoices: &[Invoice]) -> HashMap<InvoiceId, u64> {
    invoices.iter().map(|i| (i.id, i.version)).collect()
}

async fn write_invoices(
    tx: &mut dyn LedgerTx,
    invoices: &[Invoice],
    read_versions: &HashMap<InvoiceId, u64>,
) -> LedgerResult<()> {
    for invoice in invoices {
        let expected = read_versions
            .get(&invoice.id)
            .map_or(ExpectedVersion::Any, |v| ExpectedVersion::Exact(*v));
        tx.update_invoice(invoice, expected).await?;
    }
    Ok(())
}

/// Re-check allocation invariants against what the transaction is about to commit.
async fn verify(tx: &mut dyn LedgerTx, invoices: &[Invoice], payments: &[Payment]) -> LedgerResult<()> {
    for invoice in invoices {
        let rows = tx.allocations_for_invoice(invoice.id).await?;
        check_invoice_coverage(invoice, &rows)?;
    }
    if !payments.is_empty() {
        let ids: Vec<PaymentId> = payments.iter().map(|p| p.id).collect();
        let rows = tx.allocations_for_payments(&ids).await?;
        for payment in payments {
            check_payment_conservation(payment, &rows)?;
        }
    }
    Ok(())
}

async fn walk_chain(tx: &mut dyn LedgerTx, leaf: Invoice, max_len: usize) -> LedgerResult<Vec<Invoice>> {
    let mut walker = ChainWalker::new(max_len);
    let mut next = Some(leaf);
    while let Some(invoice) = next {
        next = match walker.push(invoice)? {
            Some(parent_id) => Some(
                tx.get_invoice(parent_id)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("invoice", parent_id))?,
            ),
            None => None,
        };
    }
    Ok(walker.finish())
}
