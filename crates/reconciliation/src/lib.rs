//! Daily close: reconciling a business day's recorded payments against the
//! cash and bank totals staff actually counted.
//!
//! Pure domain logic. Persistence (including the atomic lock) lives in infra.

pub mod daily_close;
pub mod expected;

pub use daily_close::{CloseEntry, DailyClose, DailyCloseState, DailyCloseView, check_close_date};
pub use expected::{ExpectedTotals, variance};
