use std::sync::Arc;

use anyhow::Context;

use bursar_infra::{LedgerConfig, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bursar_observability::init();

    let config = LedgerConfig::from_env();
    let store_config = StoreConfig::from_env()?;
    let services = bursar_api::app::services::build_services(config, store_config).await?;
    let app = bursar_api::app::build_app(Arc::new(services));

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
