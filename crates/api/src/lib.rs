//! HTTP API: router, request context and JSON mapping over the ledger services.

pub mod app;
pub mod context;
pub mod middleware;
