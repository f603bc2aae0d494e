use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};

use bursar_core::PaymentId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new()
        .route("/", post(record_payment))
        .route("/:id", get(get_payment))
        .route("/:id/refund", post(refund_payment))
}

pub async fn record_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    payload: Result<Json<dto::RecordPaymentRequest>, JsonRejection>,
) -> Response {
    let body = match errors::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .record_payment(services.store(), operation(tenant, actor), body.into())
        .await;
    errors::respond(StatusCode::CREATED, result)
}

pub async fn get_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let payment_id: PaymentId = match errors::parse_param(&id, "payment id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .get_payment(services.store(), operation(tenant, actor), payment_id)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn refund_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let payment_id: PaymentId = match errors::parse_param(&id, "payment id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .refund_payment(services.store(), operation(tenant, actor), payment_id)
        .await;
    errors::respond(StatusCode::OK, result)
}
