use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{
    ClassId, Entity, InvoiceId, LedgerError, LedgerResult, Money, StudentId, TenantId,
};

/// Invoice status lifecycle.
///
/// `Draft` is set explicitly; the other three are always derived from the
/// balance and the due date (see [`Invoice::derive_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InvoiceStatus::Draft),
            "sent" => Ok(InvoiceStatus::Sent),
            "paid" => Ok(InvoiceStatus::Paid),
            "overdue" => Ok(InvoiceStatus::Overdue),
            other => Err(LedgerError::validation(format!("unknown invoice status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Recurring,
    OneOff,
}

impl InvoiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceKind::Recurring => "recurring",
            InvoiceKind::OneOff => "one_off",
        }
    }
}

impl core::str::FromStr for InvoiceKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recurring" => Ok(InvoiceKind::Recurring),
            "one_off" | "one-off" => Ok(InvoiceKind::OneOff),
            other => Err(LedgerError::validation(format!("unknown invoice kind '{other}'"))),
        }
    }
}

/// Inclusive service period an invoice bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> LedgerResult<Self> {
        if start > end {
            return Err(LedgerError::validation(
                "billing period start must not be after its end",
            ));
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: Money,
}

impl LineItem {
    pub fn amount(&self) -> LedgerResult<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Command: create an invoice (enrollment, fee schedule, cashier desk...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub student_id: StudentId,
    pub class_id: Option<ClassId>,
    pub kind: InvoiceKind,
    /// Defaults to the business date of creation.
    pub issue_date: Option<NaiveDate>,
    pub due_date: NaiveDate,
    pub billing_period: Option<BillingPeriod>,
    pub parent_invoice_id: Option<InvoiceId>,
    pub line_items: Vec<LineItem>,
    pub discount: Money,
    pub late_fee: Money,
    pub as_draft: bool,
}

/// A billing obligation for a student.
///
/// Balances are never edited directly: allocations, reversals and adjustments
/// go through the methods below, which keep `total`, `amount_paid` and
/// `balance_due` consistent and bump `version` for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub tenant_id: TenantId,
    pub student_id: StudentId,
    pub class_id: Option<ClassId>,
    pub kind: InvoiceKind,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub billing_period: Option<BillingPeriod>,
    pub parent_invoice_id: Option<InvoiceId>,
    pub line_items: Vec<LineItem>,
    pub subtotal: Money,
    pub discount: Money,
    pub late_fee: Money,
    pub adjustments_total: Money,
    pub total: Money,
    pub amount_paid: Money,
    pub balance_due: Money,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Invoice {
    pub fn create(
        id: InvoiceId,
        tenant_id: TenantId,
        cmd: NewInvoice,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if cmd.line_items.is_empty() {
            return Err(LedgerError::validation(
                "cannot create invoice without line items",
            ));
        }

        let mut subtotal = Money::ZERO;
        for line in &cmd.line_items {
            if line.description.trim().is_empty() {
                return Err(LedgerError::validation(
                    "line item description is required",
                ));
            }
            if line.quantity <= 0 {
                return Err(LedgerError::validation(
                    "line item quantity must be positive",
                ));
            }
            if !line.unit_price.is_positive() {
                return Err(LedgerError::invalid_amount(
                    "line item unit_price must be positive",
                ));
            }
            subtotal = subtotal.checked_add(line.amount()?)?;
        }

        if cmd.discount.is_negative() {
            return Err(LedgerError::invalid_amount("discount must not be negative"));
        }
        if cmd.late_fee.is_negative() {
            return Err(LedgerError::invalid_amount("late fee must not be negative"));
        }

        let issue_date = cmd.issue_date.unwrap_or(today);
        if cmd.due_date < issue_date {
            return Err(LedgerError::validation(
                "due date must not precede the issue date",
            ));
        }
        if cmd.kind == InvoiceKind::Recurring && cmd.billing_period.is_none() {
            return Err(LedgerError::validation(
                "recurring invoices require a billing period",
            ));
        }

        let mut invoice = Self {
            id,
            tenant_id,
            student_id: cmd.student_id,
            class_id: cmd.class_id,
            kind: cmd.kind,
            status: InvoiceStatus::Draft,
            issue_date,
            due_date: cmd.due_date,
            billing_period: cmd.billing_period,
            parent_invoice_id: cmd.parent_invoice_id,
            line_items: cmd.line_items,
            subtotal,
            discount: cmd.discount,
            late_fee: cmd.late_fee,
            adjustments_total: Money::ZERO,
            total: Money::ZERO,
            amount_paid: Money::ZERO,
            balance_due: Money::ZERO,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        invoice.recompute_totals()?;
        if invoice.total.is_negative() {
            return Err(LedgerError::invalid_amount(
                "discount exceeds the invoice subtotal",
            ));
        }
        if !cmd.as_draft {
            invoice.status = InvoiceStatus::Sent;
            invoice.status = invoice.derive_status(today);
        }
        Ok(invoice)
    }

    /// Open = issued and still owing money. Only open invoices absorb payments.
    pub fn is_open(&self) -> bool {
        self.status != InvoiceStatus::Draft && self.balance_due.is_positive()
    }

    pub fn is_draft(&self) -> bool {
        self.status == InvoiceStatus::Draft
    }

    /// `paid` if nothing is owed, else `overdue` past the due date, else `sent`.
    /// Drafts stay drafts until issued.
    pub fn derive_status(&self, today: NaiveDate) -> InvoiceStatus {
        if self.status == InvoiceStatus::Draft {
            InvoiceStatus::Draft
        } else if self.balance_due.is_zero() {
            InvoiceStatus::Paid
        } else if self.due_date < today {
            InvoiceStatus::Overdue
        } else {
            InvoiceStatus::Sent
        }
    }

    /// Draft → derived status.
    pub fn issue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> LedgerResult<()> {
        if !self.is_draft() {
            return Err(LedgerError::validation(format!(
                "invoice {} is already issued",
                self.id
            )));
        }
        self.status = InvoiceStatus::Sent;
        self.status = self.derive_status(today);
        self.touch(now);
        Ok(())
    }

    /// Apply part of a payment. `amount` must fit in the open balance.
    pub fn record_allocation(
        &mut self,
        amount: Money,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if self.is_draft() {
            return Err(LedgerError::validation(format!(
                "cannot allocate to draft invoice {}",
                self.id
            )));
        }
        if !amount.is_positive() {
            return Err(LedgerError::invalid_amount("allocation must be positive"));
        }
        if amount > self.balance_due {
            return Err(LedgerError::invariant(format!(
                "allocation of {amount} exceeds balance due {} on invoice {}",
                self.balance_due, self.id
            )));
        }
        self.amount_paid = self.amount_paid.checked_add(amount)?;
        self.settle(today, now)
    }

    /// Undo a previously recorded allocation (refund path).
    pub fn reverse_allocation(
        &mut self,
        amount: Money,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if !amount.is_positive() || amount > self.amount_paid {
            return Err(LedgerError::invariant(format!(
                "cannot reverse {amount} from invoice {} with {} paid",
                self.id, self.amount_paid
            )));
        }
        self.amount_paid = self.amount_paid.checked_sub(amount)?;
        self.settle(today, now)
    }

    /// Flag as overdue without touching balances. Returns whether anything changed.
    pub fn refresh_overdue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> bool {
        let derived = self.derive_status(today);
        if derived == self.status {
            return false;
        }
        self.status = derived;
        self.touch(now);
        true
    }

    pub(crate) fn settle(&mut self, today: NaiveDate, now: DateTime<Utc>) -> LedgerResult<()> {
        self.recompute_totals()?;
        self.status = self.derive_status(today);
        self.touch(now);
        self.check_invariants()
    }

    pub(crate) fn recompute_totals(&mut self) -> LedgerResult<()> {
        self.total = self
            .subtotal
            .checked_sub(self.discount)?
            .checked_add(self.late_fee)?
            .checked_add(self.adjustments_total)?;
        self.balance_due = self.total.checked_sub(self.amount_paid)?;
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Structural invariants checked before every write.
    pub fn check_invariants(&self) -> LedgerResult<()> {
        let expected_total = self
            .subtotal
            .checked_sub(self.discount)?
            .checked_add(self.late_fee)?
            .checked_add(self.adjustments_total)?;
        if self.total != expected_total {
            return Err(LedgerError::invariant(format!(
                "invoice {} total {} != subtotal - discount + late fee + adjustments ({expected_total})",
                self.id, self.total
            )));
        }
        if self.amount_paid.checked_add(self.balance_due)? != self.total {
            return Err(LedgerError::invariant(format!(
                "invoice {}: amount paid + balance due != total",
                self.id
            )));
        }
        if self.amount_paid.is_negative() {
            return Err(LedgerError::invariant(format!(
                "invoice {} has negative amount paid",
                self.id
            )));
        }
        if self.balance_due.is_negative() {
            return Err(LedgerError::invariant(format!(
                "invoice {} has negative balance due",
                self.id
            )));
        }
        Ok(())
    }
}
