//! Teacher payouts: rate rules, their history, and the payout arithmetic.
//!
//! Pure domain logic. Revenue data and rules are loaded by infra.

pub mod engine;
pub mod rule;

pub use engine::{PayoutPeriod, PayoutStatement, compute_payout, revenue_base};
pub use rule::{NewPayoutRule, PayoutRule, RateSchedule, RuleSelection, select_rule, supersede_rules};
