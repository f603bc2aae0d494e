use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{
    Entity, InvoiceId, LedgerError, LedgerResult, Money, PaymentId, StudentId, TenantId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Card,
    Cheque,
}

/// Which drawer a payment lands in at daily close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementChannel {
    Cash,
    Bank,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Cheque => "cheque",
        }
    }

    pub fn channel(self) -> SettlementChannel {
        match self {
            PaymentMethod::Cash => SettlementChannel::Cash,
            PaymentMethod::BankTransfer | PaymentMethod::Card | PaymentMethod::Cheque => {
                SettlementChannel::Bank
            }
        }
    }
}

impl core::str::FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "bank_transfer" => Ok(PaymentMethod::BankTransfer),
            "card" => Ok(PaymentMethod::Card),
            "cheque" => Ok(PaymentMethod::Cheque),
            other => Err(LedgerError::validation(format!("unknown payment method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl core::str::FromStr for PaymentStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(PaymentStatus::Completed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(LedgerError::validation(format!("unknown payment status '{other}'"))),
        }
    }
}

/// Command: record money received from (or on behalf of) a student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub student_id: StudentId,
    /// Caller hint: apply to this invoice rather than oldest-first.
    pub invoice_id: Option<InvoiceId>,
    pub amount: Money,
    pub method: PaymentMethod,
    /// Defaults to the business date of recording.
    pub payment_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

/// Receipt numbers are `RCPT-{YYYYMMDD}-{seq:06}` with a per-tenant sequence.
pub fn format_receipt_number(date: NaiveDate, seq: u64) -> String {
    format!("RCPT-{}-{seq:06}", date.format("%Y%m%d"))
}

/// A received sum of money. Immutable apart from the refund transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub tenant_id: TenantId,
    pub receipt_number: String,
    pub student_id: StudentId,
    pub invoice_id: Option<InvoiceId>,
    pub amount: Money,
    pub method: PaymentMethod,
    pub received_by: UserId,
    pub payment_date: NaiveDate,
    pub notes: Option<String>,
    pub status: PaymentStatus,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refunded_by: Option<UserId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Entity for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Payment {
    pub fn record(
        id: PaymentId,
        tenant_id: TenantId,
        receipt_number: String,
        cmd: NewPayment,
        received_by: UserId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if !cmd.amount.is_positive() {
            return Err(LedgerError::invalid_amount(format!(
                "payment amount must be positive (got {})",
                cmd.amount.minor_units()
            )));
        }
        let payment_date = cmd.payment_date.unwrap_or(today);
        if payment_date > today {
            return Err(LedgerError::validation(format!(
                "payment date {payment_date} is after today ({today})"
            )));
        }

        Ok(Self {
            id,
            tenant_id,
            receipt_number,
            student_id: cmd.student_id,
            invoice_id: cmd.invoice_id,
            amount: cmd.amount,
            method: cmd.method,
            received_by,
            payment_date,
            notes: cmd.notes,
            status: PaymentStatus::Completed,
            refunded_at: None,
            refunded_by: None,
            version: 1,
            created_at: now,
        })
    }

    pub fn is_refunded(&self) -> bool {
        self.status == PaymentStatus::Refunded
    }

    /// Completed → Refunded. Allocation reversal is the caller's job.
    pub fn refund(&mut self, refunded_by: UserId, now: DateTime<Utc>) -> LedgerResult<()> {
        if self.is_refunded() {
            return Err(LedgerError::AlreadyRefunded(self.id));
        }
        self.status = PaymentStatus::Refunded;
        self.refunded_at = Some(now);
        self.refunded_by = Some(refunded_by);
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::invoice::tests::date;

    pub(crate) fn cash(student_id: StudentId, amount: i64) -> NewPayment {
        NewPayment {
            student_id,
            invoice_id: None,
            amount: Money::new(amount),
            method: PaymentMethod::Cash,
            payment_date: None,
            notes: None,
        }
    }

    pub(crate) fn recorded(student_id: StudentId, amount: i64) -> Payment {
        Payment::record(
            PaymentId::new(),
            TenantId::new(),
            format_receipt_number(date(2024, 1, 10), 1),
            cash(student_id, amount),
            UserId::new(),
            date(2024, 1, 10),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn receipt_number_is_dated_and_zero_padded() {
        assert_eq!(format_receipt_number(date(2024, 1, 5), 42), "RCPT-20240105-000042");
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        for amount in [0, -1] {
            let err = Payment::record(
                PaymentId::new(),
                TenantId::new(),
                "RCPT-1".into(),
                cash(StudentId::new(), amount),
                UserId::new(),
                date(2024, 1, 10),
                Utc::now(),
            )
            .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)));
        }
    }

    #[test]
    fn refund_twice_is_already_refunded() {
        let mut p = recorded(StudentId::new(), 9_000);
        p.refund(UserId::new(), Utc::now()).unwrap();
        assert_eq!(p.status, PaymentStatus::Refunded);
        assert_eq!(p.version, 2);
        let err = p.refund(UserId::new(), Utc::now()).unwrap_err();
        assert_eq!(err, LedgerError::AlreadyRefunded(p.id));
        assert_eq!(p.version, 2);
    }

    #[test]
    fn non_cash_methods_settle_to_bank() {
        assert_eq!(PaymentMethod::Cash.channel(), SettlementChannel::Cash);
        for m in [PaymentMethod::BankTransfer, PaymentMethod::Card, PaymentMethod::Cheque] {
            assert_eq!(m.channel(), SettlementChannel::Bank);
        }
    }
}
