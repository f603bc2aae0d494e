use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use bursar_core::{TenantId, UserId};

use crate::app::errors::json_error;
use crate::context::{ActorContext, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

/// Reads the identity headers set by the auth gateway in front of this
/// service and attaches them as request extensions.
pub async fn context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id: TenantId = header_id(req.headers(), TENANT_HEADER)?;
    let user_id: UserId = header_id(req.headers(), USER_HEADER)?;

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    req.extensions_mut().insert(ActorContext::new(user_id));

    Ok(next.run(req).await)
}

fn header_id<T: std::str::FromStr>(headers: &HeaderMap, name: &'static str) -> Result<T, Response> {
    let unauthorized = |message: String| json_error(StatusCode::UNAUTHORIZED, "unauthorized", message);

    let value = headers
        .get(name)
        .ok_or_else(|| unauthorized(format!("missing {name} header")))?;
    let value = value
        .to_str()
        .map_err(|_| unauthorized(format!("{name} is not valid ASCII")))?;

    value
        .trim()
        .parse()
        .map_err(|_| unauthorized(format!("{name} is not a valid id")))
}
