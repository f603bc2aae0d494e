//! Money in integer minor units, percentage rates in basis points.
//!
//! No binary floating point touches a stored amount. Presentation layers turn
//! minor units into decimal display strings at the edge.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Basis points per whole (100%).
pub const BASIS_POINTS_PER_WHOLE: u32 = 10_000;

/// Amount in the smallest currency unit (e.g. cents). Signed, so adjustments
/// and variances can be expressed directly.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_abs(self) -> LedgerResult<Money> {
        self.0
            .checked_abs()
            .map(Money)
            .ok_or_else(|| LedgerError::invariant("money magnitude overflow"))
    }

    pub fn checked_add(self, rhs: Money) -> LedgerResult<Money> {
        self.0
            .checked_add(rhs.0)
            .map(Money)
            .ok_or_else(|| LedgerError::invariant("money addition overflow"))
    }

    pub fn checked_sub(self, rhs: Money) -> LedgerResult<Money> {
        self.0
            .checked_sub(rhs.0)
            .map(Money)
            .ok_or_else(|| LedgerError::invariant("money subtraction overflow"))
    }

    /// `quantity × unit price`, overflow-checked.
    pub fn checked_mul(self, quantity: i64) -> LedgerResult<Money> {
        self.0
            .checked_mul(quantity)
            .map(Money)
            .ok_or_else(|| LedgerError::invariant("money multiplication overflow"))
    }

    /// Overflow-checked total. There is no unchecked `Sum`: every ledger
    /// total goes through here.
    pub fn try_sum<I: IntoIterator<Item = Money>>(amounts: I) -> LedgerResult<Money> {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }

    /// Apply a rate, rounding half-up to the nearest minor unit.
    pub fn percentage(self, rate: BasisPoints) -> Money {
        let numerator = i128::from(self.0) * i128::from(rate.get());
        Money(round_half_up(numerator, i128::from(BASIS_POINTS_PER_WHOLE)) as i64)
    }
}

impl fmt::Display for Money {
    /// Two-decimal rendering (`9000` → `90.00`, `-200` → `-2.00`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Rate in hundredths of a percent: 7000 bp = 70%, 6250 bp = 62.5%.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisPoints(u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);

    /// Rates above 100% are rejected: a payout never exceeds the revenue it is drawn from.
    pub fn new(bp: u32) -> LedgerResult<Self> {
        if bp > BASIS_POINTS_PER_WHOLE {
            return Err(LedgerError::validation(format!(
                "rate {bp}bp exceeds 100%"
            )));
        }
        Ok(Self(bp))
    }

    pub fn from_whole_percent(percent: u32) -> LedgerResult<Self> {
        let bp = percent
            .checked_mul(100)
            .ok_or_else(|| LedgerError::validation("rate overflow"))?;
        Self::new(bp)
    }

    /// Boundary conversion from a decimal percentage (e.g. JSON `62.5`).
    pub fn from_percent(percent: f64) -> LedgerResult<Self> {
        if !percent.is_finite() || percent < 0.0 {
            return Err(LedgerError::validation(
                "percentage must be a finite, non-negative number",
            ));
        }
        let bp = (percent * 100.0).round();
        if bp > f64::from(BASIS_POINTS_PER_WHOLE) {
            return Err(LedgerError::validation(format!(
                "percentage {percent} exceeds 100"
            )));
        }
        Ok(Self(bp as u32))
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Display-side percentage (`6250` → `62.5`).
    pub fn as_percent(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Integer division rounding half away from zero (half-up for the
/// non-negative amounts the ledger deals in).
///
/// `denominator` must be positive.
pub fn round_half_up(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0);
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        -((-numerator + denominator / 2) / denominator)
    }
}
