use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use bursar_billing::{Payment, SettlementChannel};
use bursar_core::{LedgerResult, Money};

/// What the ledger says should have come in on a day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTotals {
    pub cash: Money,
    pub bank: Money,
}

impl ExpectedTotals {
    /// Sum of non-refunded payments dated `close_date`, bucketed by channel.
    /// Card and cheque settle through the bank.
    pub fn from_payments<'a>(
        close_date: NaiveDate,
        payments: impl IntoIterator<Item = &'a Payment>,
    ) -> LedgerResult<Self> {
        let mut totals = Self::default();
        for payment in payments {
            if payment.payment_date != close_date || payment.is_refunded() {
                continue;
            }
            match payment.method.channel() {
                SettlementChannel::Cash => totals.cash = totals.cash.checked_add(payment.amount)?,
                SettlementChannel::Bank => totals.bank = totals.bank.checked_add(payment.amount)?,
            }
        }
        Ok(totals)
    }

    pub fn total(&self) -> LedgerResult<Money> {
        self.cash.checked_add(self.bank)
    }
}

/// `(actual cash + actual bank) − (expected cash + expected bank)`.
///
/// Positive is a surplus, negative a shortage.
pub fn variance(expected: ExpectedTotals, actual_cash: Money, actual_bank: Money) -> LedgerResult<Money> {
    actual_cash.checked_add(actual_bank)?.checked_sub(expected.total()?)
}
