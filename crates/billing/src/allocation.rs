//! Allocation engine: decides which invoices absorb a payment, and by how much.
//!
//! Everything here is pure. The caller loads (and locks) the rows, asks for a
//! plan, executes it against the loaded invoices and persists the result in one
//! transaction.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{
    AllocationId, Entity, InvoiceId, LedgerError, LedgerResult, Money, PaymentId, TenantId,
};

use crate::invoice::Invoice;
use crate::payment::Payment;

/// "This much of this payment applies to this invoice."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub id: AllocationId,
    pub tenant_id: TenantId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    /// Business date the money counts as collected against the invoice.
    pub allocated_on: NaiveDate,
    pub allocated_at: DateTime<Utc>,
    /// Set when a refund reverses this allocation. Reversed rows stay for audit.
    pub reversed_at: Option<DateTime<Utc>>,
}

impl Entity for PaymentAllocation {
    type Id = AllocationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl PaymentAllocation {
    pub fn is_active(&self) -> bool {
        self.reversed_at.is_none()
    }
}

/// What happens to the part of a payment no open invoice can absorb.
///
/// Fixed per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverpaymentPolicy {
    /// Reject the whole payment.
    #[default]
    Strict,
    /// Keep the remainder as unapplied credit on the student.
    Credit,
}

impl core::str::FromStr for OverpaymentPolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" | "reject" => Ok(OverpaymentPolicy::Strict),
            "credit" => Ok(OverpaymentPolicy::Credit),
            other => Err(LedgerError::validation(format!(
                "overpayment policy must be 'strict' or 'credit' (got '{other}')"
            ))),
        }
    }
}

/// Where a payment should go.
#[derive(Debug, Clone, Copy)]
pub enum AllocationTarget<'a> {
    /// Caller named an invoice.
    Invoice(&'a Invoice),
    /// Oldest obligation first across the student's invoices.
    OpenInvoices(&'a [Invoice]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStep {
    pub invoice_id: InvoiceId,
    pub amount: Money,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    pub steps: Vec<AllocationStep>,
    /// Left over after every step; always zero under `Strict`.
    pub unapplied: Money,
}

impl AllocationPlan {
    pub fn allocated(&self) -> LedgerResult<Money> {
        Money::try_sum(self.steps.iter().map(|s| s.amount))
    }
}

/// Due date, then issue date, then id: oldest obligation first, deterministic ties.
pub fn fifo_key(invoice: &Invoice) -> (NaiveDate, NaiveDate, InvoiceId) {
    (invoice.due_date, invoice.issue_date, invoice.id)
}

/// Open invoices in the order an untargeted payment consumes them.
pub fn fifo_queue(invoices: &[Invoice]) -> Vec<&Invoice> {
    let mut open: Vec<&Invoice> = invoices.iter().filter(|i| i.is_open()).collect();
    open.sort_by_key(|i| fifo_key(i));
    open
}

/// Decide how `amount` is split. Nothing is mutated.
pub fn plan_allocation(
    amount: Money,
    target: AllocationTarget<'_>,
    policy: OverpaymentPolicy,
) -> LedgerResult<AllocationPlan> {
    if !amount.is_positive() {
        return Err(LedgerError::invalid_amount("amount to allocate must be positive"));
    }

    let mut remaining = amount;
    let mut steps = Vec::new();

    match target {
        AllocationTarget::Invoice(invoice) => {
            if invoice.is_draft() {
                return Err(LedgerError::validation(format!(
                    "invoice {} is a draft and cannot take payments",
                    invoice.id
                )));
            }
            let take = remaining.min(invoice.balance_due);
            if take.is_positive() {
                steps.push(AllocationStep {
                    invoice_id: invoice.id,
                    amount: take,
                });
                remaining = remaining.checked_sub(take)?;
            }
        }
        AllocationTarget::OpenInvoices(invoices) => {
            for invoice in fifo_queue(invoices) {
                if !remaining.is_positive() {
                    break;
                }
                let take = remaining.min(invoice.balance_due);
                steps.push(AllocationStep {
                    invoice_id: invoice.id,
                    amount: take,
                });
                remaining = remaining.checked_sub(take)?;
            }
        }
    }

    if remaining.is_positive() && policy == OverpaymentPolicy::Strict {
        return Err(LedgerError::Overpayment {
            amount,
            allocatable: amount.checked_sub(remaining)?,
        });
    }

    Ok(AllocationPlan {
        steps,
        unapplied: remaining,
    })
}

/// Apply a plan to the loaded invoices and produce the allocation rows to insert.
///
/// On error the invoices may be partially updated; callers drop them together
/// with the surrounding transaction.
pub fn execute_plan(
    plan: &AllocationPlan,
    payment: &Payment,
    invoices: &mut [Invoice],
    allocated_on: NaiveDate,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<PaymentAllocation>> {
    let mut rows = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let invoice = invoices
            .iter_mut()
            .find(|i| i.id == step.invoice_id)
            .ok_or_else(|| LedgerError::not_found("invoice", step.invoice_id))?;
        if invoice.student_id != payment.student_id {
            return Err(LedgerError::validation(format!(
                "invoice {} does not belong to student {}",
                invoice.id, payment.student_id
            )));
        }
        invoice.record_allocation(step.amount, today, now)?;
        rows.push(PaymentAllocation {
            id: AllocationId::new(),
            tenant_id: payment.tenant_id,
            payment_id: payment.id,
            invoice_id: invoice.id,
            amount: step.amount,
            allocated_on,
            allocated_at: now,
            reversed_at: None,
        });
    }
    Ok(rows)
}

/// Mark every active allocation reversed and give the money back to its invoice.
///
/// Returns the rows that changed.
pub fn reverse_allocations(
    allocations: &mut [PaymentAllocation],
    invoices: &mut [Invoice],
    today: NaiveDate,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<PaymentAllocation>> {
    let mut reversed = Vec::new();
    for allocation in allocations.iter_mut().filter(|a| a.is_active()) {
        let invoice = invoices
            .iter_mut()
            .find(|i| i.id == allocation.invoice_id)
            .ok_or_else(|| LedgerError::not_found("invoice", allocation.invoice_id))?;
        invoice.reverse_allocation(allocation.amount, today, now)?;
        allocation.reversed_at = Some(now);
        reversed.push(allocation.clone());
    }
    Ok(reversed)
}

/// Σ active allocations of one payment.
pub fn allocated_from(
    payment_id: PaymentId,
    allocations: &[PaymentAllocation],
) -> LedgerResult<Money> {
    Money::try_sum(
        allocations
            .iter()
            .filter(|a| a.payment_id == payment_id && a.is_active())
            .map(|a| a.amount),
    )
}

/// What is left of a completed payment after its active allocations.
pub fn unapplied_credit(
    payment: &Payment,
    allocations: &[PaymentAllocation],
) -> LedgerResult<Money> {
    if payment.is_refunded() {
        return Ok(Money::ZERO);
    }
    payment.amount.checked_sub(allocated_from(payment.id, allocations)?)
}

/// A payment never hands out more than it brought in.
pub fn check_payment_conservation(
    payment: &Payment,
    allocations: &[PaymentAllocation],
) -> LedgerResult<()> {
    let allocated = allocated_from(payment.id, allocations)?;
    if allocated > payment.amount {
        return Err(LedgerError::invariant(format!(
            "payment {} allocates {allocated} of {}",
            payment.id, payment.amount
        )));
    }
    Ok(())
}

/// Active allocations on an invoice never exceed its total, and always equal
/// what the invoice believes has been paid.
pub fn check_invoice_coverage(
    invoice: &Invoice,
    allocations: &[PaymentAllocation],
) -> LedgerResult<()> {
    let covered = Money::try_sum(
        allocations
            .iter()
            .filter(|a| a.invoice_id == invoice.id && a.is_active())
            .map(|a| a.amount),
    )?;
    if covered > invoice.total {
        return Err(LedgerError::invariant(format!(
            "invoice {} has {covered} allocated against a total of {}",
            invoice.id, invoice.total
        )));
    }
    if covered != invoice.amount_paid {
        return Err(LedgerError::invariant(format!(
            "invoice {} amount paid {} disagrees with active allocations {covered}",
            invoice.id, invoice.amount_paid
        )));
    }
    Ok(())
}
