use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};

use bursar_core::InvoiceId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route("/overdue/refresh", post(refresh_overdue))
        .route("/:id", get(get_invoice))
        .route("/:id/chain", get(invoice_chain))
        .route("/:id/issue", post(issue_invoice))
        .route("/:id/adjustments", post(apply_adjustment))
}

pub async fn create_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    payload: Result<Json<dto::CreateInvoiceRequest>, JsonRejection>,
) -> Response {
    let cmd = match errors::body(payload).map(dto::CreateInvoiceRequest::into_command) {
        Ok(Ok(cmd)) => cmd,
        Ok(Err(e)) => return errors::ledger_error_to_response(e),
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .create_invoice(services.store(), operation(tenant, actor), cmd)
        .await;
    errors::respond(StatusCode::CREATED, result)
}

pub async fn list_invoices(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    query: Result<Query<dto::ListInvoicesQuery>, QueryRejection>,
) -> Response {
    let query = match errors::query(query) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .list_invoices(services.store(), operation(tenant, actor), query.student_id)
        .await
        .map(|items| serde_json::json!({ "items": items }));
    errors::respond(StatusCode::OK, result)
}

pub async fn get_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let invoice_id: InvoiceId = match errors::parse_param(&id, "invoice id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .get_invoice(services.store(), operation(tenant, actor), invoice_id)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn invoice_chain(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let invoice_id: InvoiceId = match errors::parse_param(&id, "invoice id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .invoice_chain(services.store(), operation(tenant, actor), invoice_id)
        .await
        .map(|items| serde_json::json!({ "items": items }));
    errors::respond(StatusCode::OK, result)
}

pub async fn issue_invoice(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let invoice_id: InvoiceId = match errors::parse_param(&id, "invoice id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .issue_invoice(services.store(), operation(tenant, actor), invoice_id)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn apply_adjustment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
    payload: Result<Json<dto::AdjustmentRequest>, JsonRejection>,
) -> Response {
    let invoice_id: InvoiceId = match errors::parse_param(&id, "invoice id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = match errors::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .apply_adjustment(services.store(), operation(tenant, actor), invoice_id, body.into())
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn refresh_overdue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
) -> Response {
    let result = services
        .ledger
        .refresh_overdue(services.store(), operation(tenant, actor))
        .await
        .map(|items| serde_json::json!({ "changed": items }));
    errors::respond(StatusCode::OK, result)
}
