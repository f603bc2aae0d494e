//! Tracing subscriber configuration.
//!
//! Output is JSON by default so ledger events (receipts, refunds, locks) can
//! be shipped as structured records. `LOG_FORMAT=pretty` switches to the
//! human-readable formatter for local runs.

use std::str::FromStr;

use ::tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    pub format: LogFormat,
    /// Directive string in `RUST_LOG` syntax.
    pub filter: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("RUST_LOG").ok().as_deref(),
            std::env::var("LOG_FORMAT").ok().as_deref(),
        )
    }

    fn from_values(rust_log: Option<&str>, log_format: Option<&str>) -> Self {
        let filter = rust_log
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_FILTER)
            .to_string();
        let format = log_format
            .and_then(|f| f.parse().ok())
            .unwrap_or_default();
        Self { format, filter }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: TracingConfig) {
    let (filter, rejected) = match EnvFilter::try_new(&config.filter) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    if installed.is_err() {
        return;
    }

    if let Some(e) = rejected {
        warn!(filter = %config.filter, error = %e, fallback = DEFAULT_FILTER, "invalid log filter");
    }
    info!(format = ?config.format, "tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_defaults() {
        assert_eq!(TracingConfig::from_values(None, None), TracingConfig::default());
        assert_eq!(
            TracingConfig::from_values(Some("  "), Some("xml")),
            TracingConfig::default()
        );
    }

    #[test]
    fn reads_filter_and_format() {
        let config = TracingConfig::from_values(Some("debug,bursar_infra=trace"), Some("Pretty"));
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.filter, "debug,bursar_infra=trace");
    }

    #[test]
    fn init_twice_is_harmless() {
        init(TracingConfig {
            format: LogFormat::Pretty,
            filter: "bursar_infra=[".to_string(),
        });
        init(TracingConfig::default());
        info!("still logging");
    }
}
