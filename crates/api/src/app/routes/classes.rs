use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::Response,
    routing::put,
};

use bursar_core::ClassId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new().route("/:class_id/teacher", put(assign_teacher))
}

/// Called by the scheduling system whenever a class changes hands.
pub async fn assign_teacher(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(class_id): Path<String>,
    payload: Result<Json<dto::AssignTeacherRequest>, JsonRejection>,
) -> Response {
    let class_id: ClassId = match errors::parse_param(&class_id, "class id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = match errors::body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let result = services
        .payouts
        .assign_class_teacher(services.store(), operation(tenant, actor), class_id, body.teacher_id)
        .await
        .map(|()| serde_json::json!({ "class_id": class_id, "teacher_id": body.teacher_id }));
    errors::respond(StatusCode::OK, result)
}
