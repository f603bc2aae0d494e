//! Infrastructure layer: ledger persistence, configuration and the service
//! objects that run each ledger operation inside one store transaction.

pub mod config;
pub mod services;
pub mod store;

mod integration_tests;

pub use config::{ConfigError, LedgerConfig, StoreConfig};
pub use services::{DailyCloseService, LedgerService, OperationContext, PayoutService};
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore};
