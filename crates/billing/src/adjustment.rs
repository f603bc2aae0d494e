//! Invoice adjustments: discounts, late fees, credit notes and write-offs.
//!
//! Adjustments are append-only rows; the invoice keeps running totals per kind.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{AdjustmentId, Entity, InvoiceId, LedgerError, LedgerResult, Money, TenantId, UserId};

use crate::invoice::Invoice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Discount,
    LateFee,
    CreditNote,
    WriteOff,
}

impl AdjustmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentKind::Discount => "discount",
            AdjustmentKind::LateFee => "late_fee",
            AdjustmentKind::CreditNote => "credit_note",
            AdjustmentKind::WriteOff => "write_off",
        }
    }

    /// Late fees raise the balance; every other kind lowers it.
    pub fn increases_balance(self) -> bool {
        matches!(self, AdjustmentKind::LateFee)
    }
}

impl core::str::FromStr for AdjustmentKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discount" => Ok(AdjustmentKind::Discount),
            "late_fee" | "lateFee" => Ok(AdjustmentKind::LateFee),
            "credit_note" | "creditNote" => Ok(AdjustmentKind::CreditNote),
            "write_off" | "writeOff" => Ok(AdjustmentKind::WriteOff),
            other => Err(LedgerError::validation(format!("unknown adjustment kind '{other}'"))),
        }
    }
}

/// Command: adjust an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAdjustment {
    pub kind: AdjustmentKind,
    /// Signed: positive increases the balance, negative decreases it.
    pub amount: Money,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceAdjustment {
    pub id: AdjustmentId,
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub kind: AdjustmentKind,
    pub amount: Money,
    pub reason: String,
    pub applied_by: UserId,
    pub applied_at: DateTime<Utc>,
}

impl Entity for InvoiceAdjustment {
    type Id = AdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Invoice {
    /// Apply an adjustment and return the audit row describing it.
    ///
    /// The adjusted total may not drop below what has already been paid.
    pub fn apply_adjustment(
        &mut self,
        id: AdjustmentId,
        cmd: NewAdjustment,
        applied_by: UserId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<InvoiceAdjustment> {
        if cmd.reason.trim().is_empty() {
            return Err(LedgerError::validation("adjustment reason is required"));
        }
        if cmd.amount.is_zero() {
            return Err(LedgerError::invalid_amount("adjustment amount must be non-zero"));
        }
        if cmd.kind.increases_balance() != cmd.amount.is_positive() {
            let expected = if cmd.kind.increases_balance() { "positive" } else { "negative" };
            return Err(LedgerError::invalid_amount(format!(
                "{} adjustments must be {expected}",
                cmd.kind.as_str()
            )));
        }

        let mut next = self.clone();
        match cmd.kind {
            AdjustmentKind::Discount => next.discount = next.discount.checked_add(cmd.amount.checked_abs()?)?,
            AdjustmentKind::LateFee => next.late_fee = next.late_fee.checked_add(cmd.amount)?,
            AdjustmentKind::CreditNote | AdjustmentKind::WriteOff => {
                next.adjustments_total = next.adjustments_total.checked_add(cmd.amount)?
            }
        }
        next.recompute_totals()?;
        if next.total < self.amount_paid || next.total.is_negative() {
            return Err(LedgerError::validation(format!(
                "adjustment of {} would reduce invoice {} below the {} already paid",
                cmd.amount, self.id, self.amount_paid
            )));
        }
        next.settle(today, now)?;
        *self = next;

        Ok(InvoiceAdjustment {
            id,
            tenant_id: self.tenant_id,
            invoice_id: self.id,
            kind: cmd.kind,
            amount: cmd.amount,
            reason: cmd.reason,
            applied_by,
            applied_at: now,
        })
    }
}
