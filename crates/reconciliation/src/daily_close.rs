//! The per-date close record and its `NoRecord → Draft → Locked` lifecycle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bursar_core::{Entity, LedgerError, LedgerResult, Money, TenantId, UserId};

use crate::expected::{ExpectedTotals, variance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyCloseState {
    NoRecord,
    Draft,
    Locked,
}

impl DailyCloseState {
    pub fn as_str(self) -> &'static str {
        match self {
            DailyCloseState::NoRecord => "no_record",
            DailyCloseState::Draft => "draft",
            DailyCloseState::Locked => "locked",
        }
    }
}

/// Staff-entered figures for a save or lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEntry {
    pub actual_cash: Money,
    pub actual_bank: Money,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CloseEntry {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.actual_cash.is_negative() || self.actual_bank.is_negative() {
            return Err(LedgerError::invalid_amount(
                "actual cash and bank totals must not be negative",
            ));
        }
        Ok(())
    }
}

/// Closing a day that has not happened yet is refused.
pub fn check_close_date(close_date: NaiveDate, today: NaiveDate) -> LedgerResult<()> {
    if close_date > today {
        return Err(LedgerError::FutureDate {
            date: close_date,
            today,
        });
    }
    Ok(())
}

/// One row per `(tenant, close_date)`. Immutable once `is_locked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyClose {
    pub tenant_id: TenantId,
    pub close_date: NaiveDate,
    pub expected_cash: Money,
    pub expected_bank: Money,
    pub actual_cash: Money,
    pub actual_bank: Money,
    pub variance: Money,
    pub is_locked: bool,
    pub saved_by: UserId,
    pub closed_by: Option<UserId>,
    pub closed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One record per tenant and date, so the date is the identity.
impl Entity for DailyClose {
    type Id = NaiveDate;

    fn id(&self) -> &Self::Id {
        &self.close_date
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl DailyClose {
    /// First save for a date.
    pub fn open_draft(
        tenant_id: TenantId,
        close_date: NaiveDate,
        entry: CloseEntry,
        expected: ExpectedTotals,
        saved_by: UserId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        check_close_date(close_date, today)?;
        entry.validate()?;
        Ok(Self {
            tenant_id,
            close_date,
            expected_cash: expected.cash,
            expected_bank: expected.bank,
            actual_cash: entry.actual_cash,
            actual_bank: entry.actual_bank,
            variance: variance(expected, entry.actual_cash, entry.actual_bank)?,
            is_locked: false,
            saved_by,
            closed_by: None,
            closed_at: None,
            notes: entry.notes,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn state(&self) -> DailyCloseState {
        if self.is_locked {
            DailyCloseState::Locked
        } else {
            DailyCloseState::Draft
        }
    }

    pub fn expected(&self) -> ExpectedTotals {
        ExpectedTotals {
            cash: self.expected_cash,
            bank: self.expected_bank,
        }
    }

    fn ensure_unlocked(&self) -> LedgerResult<()> {
        if self.is_locked {
            return Err(LedgerError::AlreadyFinalized(self.close_date));
        }
        Ok(())
    }

    /// Draft → Draft: overwrite actuals and recompute against fresh expected totals.
    pub fn revise(
        &mut self,
        entry: CloseEntry,
        expected: ExpectedTotals,
        saved_by: UserId,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.ensure_unlocked()?;
        entry.validate()?;
        let variance = variance(expected, entry.actual_cash, entry.actual_bank)?;
        self.expected_cash = expected.cash;
        self.expected_bank = expected.bank;
        self.actual_cash = entry.actual_cash;
        self.actual_bank = entry.actual_bank;
        self.variance = variance;
        self.notes = entry.notes;
        self.saved_by = saved_by;
        self.version += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Draft → Locked. Expected figures are frozen at the values passed in.
    pub fn finalize(
        &mut self,
        entry: CloseEntry,
        expected: ExpectedTotals,
        closed_by: UserId,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.revise(entry, expected, closed_by, now)?;
        self.is_locked = true;
        self.closed_by = Some(closed_by);
        self.closed_at = Some(now);
        Ok(())
    }

    /// Drafts show live expected totals on read; locked records never move.
    /// Returns whether anything changed. Does not bump the version.
    pub fn refresh_expected(&mut self, expected: ExpectedTotals) -> LedgerResult<bool> {
        if self.is_locked || self.expected() == expected {
            return Ok(false);
        }
        self.variance = variance(expected, self.actual_cash, self.actual_bank)?;
        self.expected_cash = expected.cash;
        self.expected_bank = expected.bank;
        Ok(true)
    }
}

/// What a read of a date returns, record or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCloseView {
    pub close_date: NaiveDate,
    pub state: DailyCloseState,
    pub expected: ExpectedTotals,
    pub record: Option<DailyClose>,
}

impl DailyCloseView {
    pub fn preview(close_date: NaiveDate, expected: ExpectedTotals) -> Self {
        Self {
            close_date,
            state: DailyCloseState::NoRecord,
            expected,
            record: None,
        }
    }

    pub fn of(record: DailyClose) -> Self {
        Self {
            close_date: record.close_date,
            state: record.state(),
            expected: record.expected(),
            record: Some(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn entry(cash: i64, bank: i64) -> CloseEntry {
        CloseEntry {
            actual_cash: Money::new(cash),
            actual_bank: Money::new(bank),
            notes: None,
        }
    }

    fn expected(cash: i64, bank: i64) -> ExpectedTotals {
        ExpectedTotals {
            cash: Money::new(cash),
            bank: Money::new(bank),
        }
    }

    fn draft() -> DailyClose {
        DailyClose::open_draft(
            TenantId::new(),
            day(5),
            entry(9_800, 0),
            expected(10_000, 0),
            UserId::new(),
            day(5),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn shortage_then_lock_then_immutable() {
        let mut close = draft();
        assert_eq!(close.variance, Money::new(-200));
        assert_eq!(close.state(), DailyCloseState::Draft);

        let clerk = UserId::new();
        close
            .finalize(entry(9_800, 0), expected(10_000, 0), clerk, Utc::now())
            .unwrap();
        assert_eq!(close.state(), DailyCloseState::Locked);
        assert_eq!(close.closed_by, Some(clerk));

        let frozen = close.clone();
        let err = close
            .revise(entry(10_000, 0), expected(10_000, 0), UserId::new(), Utc::now())
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyFinalized(day(5)));
        let err = close
            .finalize(entry(10_000, 0), expected(10_000, 0), UserId::new(), Utc::now())
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyFinalized(day(5)));
        assert!(!close.refresh_expected(expected(50_000, 0)).unwrap());
        assert_eq!(close, frozen);
    }

    #[test]
    fn revising_a_draft_overwrites_actuals_and_bumps_version() {
        let mut close = draft();
        close
            .revise(entry(10_000, 0), expected(10_000, 0), UserId::new(), Utc::now())
            .unwrap();
        assert!(close.variance.is_zero());
        assert_eq!(close.version, 2);
    }

    #[test]
    fn future_dates_are_rejected() {
        let err = DailyClose::open_draft(
            TenantId::new(),
            day(6),
            entry(0, 0),
            expected(0, 0),
            UserId::new(),
            day(5),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::FutureDate { .. }));
    }

    #[test]
    fn negative_actuals_are_rejected() {
        let mut close = draft();
        let err = close
            .revise(entry(-1, 0), expected(0, 0), UserId::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(close.version, 1);
    }

    #[test]
    fn draft_refreshes_expected_on_read() {
        let mut close = draft();
        assert!(close.refresh_expected(expected(10_000, 500)).unwrap());
        assert_eq!(close.variance, Money::new(-700));
        assert_eq!(close.version, 1);
    }
}
