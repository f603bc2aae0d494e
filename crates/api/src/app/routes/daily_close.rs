use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use chrono::NaiveDate;

use bursar_reconciliation::CloseEntry;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{ActorContext, TenantContext, operation};

pub fn router() -> Router {
    Router::new()
        .route("/:date", get(get_daily_close).put(save_daily_close))
        .route("/:date/lock", post(lock_daily_close))
}

fn close_date(raw: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_date",
            "close date must be YYYY-MM-DD",
        )
    })
}

pub async fn get_daily_close(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(date): Path<String>,
) -> Response {
    let date = match close_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let result = services
        .daily_close
        .get(services.store(), operation(tenant, actor), date)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn save_daily_close(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(date): Path<String>,
    payload: Result<Json<CloseEntry>, JsonRejection>,
) -> Response {
    let date = match close_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let entry = match errors::body(payload) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    let result = services
        .daily_close
        .save(services.store(), operation(tenant, actor), date, entry)
        .await;
    errors::respond(StatusCode::OK, result)
}

pub async fn lock_daily_close(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(actor): Extension<ActorContext>,
    Path(date): Path<String>,
    payload: Result<Json<CloseEntry>, JsonRejection>,
) -> Response {
    let date = match close_date(&date) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let entry = match errors::body(payload) {
        Ok(e) => e,
        Err(resp) => return resp,
    };
    let result = services
        .daily_close
        .lock(services.store(), operation(tenant, actor), date, entry)
        .await;
    errors::respond(StatusCode::OK, result)
}
