use std::sync::Arc;

use axum::{
    Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};

use bursar_core::StudentId;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new()
        .route("/:id/credit", get(student_credit))
        .route("/:id/credit/apply", post(apply_student_credit))
}

pub async fn student_credit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let student_id: StudentId = match errors::parse_param(&id, "student id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .student_credit(services.store(), operation(tenant, actor), student_id)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn apply_student_credit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(id): Path<String>,
) -> Response {
    let student_id: StudentId = match errors::parse_param(&id, "student id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .ledger
        .apply_student_credit(services.store(), operation(tenant, actor), student_id)
        .await;
    errors::respond(StatusCode::OK, result)
}
