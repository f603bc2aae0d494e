use axum::Router;

pub mod classes;
pub mod daily_close;
pub mod invoices;
pub mod payments;
pub mod payouts;
pub mod students;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/invoices", invoices::router())
        .nest("/payments", payments::router())
        .nest("/students", students::router())
        .nest("/daily-close", daily_close::router())
        .nest("/payouts", payouts::router())
        .nest("/classes", classes::router())
}
