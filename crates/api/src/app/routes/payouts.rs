use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
    response::Response,
    routing::get,
};

use bursar_core::TeacherId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new()
        .route("/:teacher_id", get(get_payout))
        .route("/:teacher_id/rules", get(list_rules).post(upsert_rule))
}

pub async fn get_payout(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(teacher_id): Path<String>,
    query: Result<Query<dto::PayoutQuery>, QueryRejection>,
) -> Response {
    let teacher_id: TeacherId = match errors::parse_param(&teacher_id, "teacher id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let query = match errors::query(query) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let result = services
        .payouts
        .get_payout(
            services.store(),
            operation(tenant, actor),
            teacher_id,
            query.period_start,
            query.period_end,
        )
        .await
        .map(dto::PayoutResponse::from);
    errors::respond(StatusCode::OK, result)
}

pub async fn list_rules(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(teacher_id): Path<String>,
) -> Response {
    let teacher_id: TeacherId = match errors::parse_param(&teacher_id, "teacher id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = services
        .payouts
        .payout_rules(services.store(), operation(tenant, actor), teacher_id)
        .await
        .map(|rules| {
            let items: Vec<dto::PayoutRuleResponse> = rules.iter().map(Into::into).collect();
            serde_json::json!({ "items": items })
        });
    errors::respond(StatusCode::OK, result)
}

pub async fn upsert_rule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(teacher_id): Path<String>,
    payload: Result<Json<dto::PayoutRuleRequest>, JsonRejection>,
) -> Response {
    let teacher_id: TeacherId = match errors::parse_param(&teacher_id, "teacher id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cmd = match errors::body(payload).map(|b| b.into_command(teacher_id)) {
        Ok(Ok(cmd)) => cmd,
        Ok(Err(e)) => return errors::ledger_error_to_response(e),
        Err(resp) => return resp,
    };
    let result = services
        .payouts
        .upsert_payout_rule(services.store(), operation(tenant, actor), cmd)
        .await
        .map(|rule| dto::PayoutRuleResponse::from(&rule));
    errors::respond(StatusCode::CREATED, result)
}
