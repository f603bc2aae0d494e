//! Deployment configuration for the ledger, read from the environment.

use std::env;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;
use tracing::warn;

use bursar_billing::{DEFAULT_MAX_CHAIN_LEN, OverpaymentPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required when USE_PERSISTENT_STORES is enabled")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub overpayment_policy: OverpaymentPolicy,
    pub max_invoice_chain_len: usize,
    pub reject_ambiguous_payout_rules: bool,
    /// Minutes east of UTC used to decide which calendar day "today" is.
    pub business_utc_offset_minutes: i32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            overpayment_policy: OverpaymentPolicy::Strict,
            max_invoice_chain_len: DEFAULT_MAX_CHAIN_LEN,
            reject_ambiguous_payout_rules: false,
            business_utc_offset_minutes: 0,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            overpayment_policy: parse_var("OVERPAYMENT_POLICY", defaults.overpayment_policy),
            max_invoice_chain_len: parse_var("MAX_INVOICE_CHAIN_LEN", defaults.max_invoice_chain_len),
            reject_ambiguous_payout_rules: parse_flag(
                "REJECT_AMBIGUOUS_PAYOUT_RULES",
                defaults.reject_ambiguous_payout_rules,
            ),
            business_utc_offset_minutes: parse_var(
                "BUSINESS_UTC_OFFSET_MINUTES",
                defaults.business_utc_offset_minutes,
            ),
        }
    }

    /// The business day `now` falls on.
    pub fn business_date(&self, now: DateTime<Utc>) -> NaiveDate {
        (now + Duration::minutes(i64::from(self.business_utc_offset_minutes))).date_naive()
    }
}

/// Which store implementation the process runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Postgres { database_url: String },
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        if !parse_flag("USE_PERSISTENT_STORES", false) {
            return Ok(StoreConfig::InMemory);
        }
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        Ok(StoreConfig::Postgres { database_url })
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, default = ?default, "unparsable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(variable = name, value = %raw, default, "unparsable config flag, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn business_date_applies_offset() {
        let config = LedgerConfig {
            business_utc_offset_minutes: 300,
            ..LedgerConfig::default()
        };
        let late_evening_utc = Utc.with_ymd_and_hms(2024, 1, 5, 21, 0, 0).unwrap();
        assert_eq!(
            config.business_date(late_evening_utc),
            NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()
        );
        assert_eq!(
            LedgerConfig::default().business_date(late_evening_utc),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
    }

    #[test]
    fn defaults_are_strict_and_permissive_on_rule_overlap() {
        let config = LedgerConfig::default();
        assert_eq!(config.overpayment_policy, OverpaymentPolicy::Strict);
        assert_eq!(config.max_invoice_chain_len, 240);
        assert!(!config.reject_ambiguous_payout_rules);
    }
}
