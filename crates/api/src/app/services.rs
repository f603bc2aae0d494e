use std::sync::Arc;

use anyhow::Context;

use bursar_infra::{
    DailyCloseService, InMemoryLedgerStore, LedgerConfig, LedgerService, LedgerStore, PayoutService,
    PostgresLedgerStore, StoreConfig,
};

/// Shared state behind every handler: one store and the services that run
/// operations against it.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn LedgerStore>,
    pub ledger: LedgerService,
    pub daily_close: DailyCloseService,
    pub payouts: PayoutService,
}

impl AppServices {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            ledger: LedgerService::new(config.clone()),
            daily_close: DailyCloseService::new(config.clone()),
            payouts: PayoutService::new(config),
        }
    }

    /// In-memory wiring (dev/test).
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::new(Arc::new(InMemoryLedgerStore::new()), config)
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }
}

pub async fn build_services(config: LedgerConfig, store: StoreConfig) -> anyhow::Result<AppServices> {
    match store {
        StoreConfig::InMemory => {
            tracing::warn!("USE_PERSISTENT_STORES not set; ledger data lives in memory only");
            Ok(AppServices::in_memory(config))
        }
        StoreConfig::Postgres { database_url } => {
            let store = PostgresLedgerStore::connect(&database_url)
                .await
                .context("failed to connect to postgres")?;
            store.migrate().await.context("failed to apply ledger migrations")?;
            tracing::info!("using postgres ledger store");
            Ok(AppServices::new(Arc::new(store), config))
        }
    }
}
