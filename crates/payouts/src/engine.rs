//! Payout arithmetic.
//!
//! Every tier contributes `amount × basis points` to one `i128` numerator,
//! which is divided by 10 000 and rounded half-up exactly once.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use bursar_billing::PaymentAllocation;
use bursar_core::money::BASIS_POINTS_PER_WHOLE;
use bursar_core::{LedgerError, LedgerResult, Money, TeacherId, round_half_up};

use crate::rule::{PayoutRule, RateSchedule, RuleSelection};

/// Inclusive reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PayoutPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> LedgerResult<Self> {
        if start > end {
            return Err(LedgerError::validation(format!(
                "period start {start} is after period end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Cash-basis revenue: active allocations that took effect inside the period.
///
/// Callers pass only allocations on invoices for the teacher's classes.
pub fn revenue_base<'a>(
    period: PayoutPeriod,
    allocations: impl IntoIterator<Item = &'a PaymentAllocation>,
) -> LedgerResult<Money> {
    allocations
        .into_iter()
        .filter(|a| a.is_active() && period.contains(a.allocated_on))
        .try_fold(Money::ZERO, |acc, a| acc.checked_add(a.amount))
}

pub fn compute_payout(schedule: &RateSchedule, revenue_base: Money) -> LedgerResult<Money> {
    if revenue_base.is_negative() {
        return Err(LedgerError::invariant(format!(
            "revenue base {revenue_base} is negative"
        )));
    }
    let base = i128::from(revenue_base.minor_units());
    let numerator = match *schedule {
        RateSchedule::Fixed { percentage } => base * i128::from(percentage.get()),
        RateSchedule::Tiered {
            tier1_percentage,
            tier1_threshold,
            tier2_percentage,
        } => {
            let threshold = i128::from(tier1_threshold.minor_units());
            let lower = base.min(threshold);
            let upper = (base - threshold).max(0);
            lower * i128::from(tier1_percentage.get()) + upper * i128::from(tier2_percentage.get())
        }
    };
    let payout = round_half_up(numerator, i128::from(BASIS_POINTS_PER_WHOLE));
    i64::try_from(payout)
        .map(Money::new)
        .map_err(|_| LedgerError::invariant("payout overflows the money range"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutStatement {
    pub teacher_id: TeacherId,
    pub period: PayoutPeriod,
    pub revenue_base: Money,
    pub rule_applied: PayoutRule,
    pub payout: Money,
    pub warnings: Vec<String>,
}

impl PayoutStatement {
    /// Price `revenue_base` with the selected rule. Overlapping rules become a
    /// warning, or an error when `reject_ambiguous` is set.
    pub fn build(
        teacher_id: TeacherId,
        period: PayoutPeriod,
        revenue_base: Money,
        selection: RuleSelection,
        reject_ambiguous: bool,
    ) -> LedgerResult<Self> {
        let mut warnings = Vec::new();
        if selection.is_ambiguous() {
            let ambiguity = LedgerError::AmbiguousPayoutRule {
                teacher_id,
                candidates: selection.candidates(),
            };
            if reject_ambiguous {
                return Err(ambiguity);
            }
            warnings.push(format!(
                "{ambiguity}; applied the most recently created rule {}",
                selection.rule.id
            ));
        }
        let payout = compute_payout(&selection.rule.schedule, revenue_base)?;
        Ok(Self {
            teacher_id,
            period,
            revenue_base,
            rule_applied: selection.rule,
            payout,
            warnings,
        })
    }
}
