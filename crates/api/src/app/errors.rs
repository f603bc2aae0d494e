use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use bursar_core::{ErrorKind, LedgerError, LedgerResult};

pub fn ledger_error_to_response(err: LedgerError) -> Response {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Concurrency => StatusCode::CONFLICT,
        ErrorKind::Persistence | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, code = err.code(), "request failed");
    }
    error_body(status, err.code(), err.to_string(), err.is_retryable())
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    error_body(status, code, message.into(), false)
}

fn error_body(status: StatusCode, code: &'static str, message: String, retryable: bool) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message,
            "retryable": retryable,
        })),
    )
        .into_response()
}

/// Serialize a service result, or map its error.
pub fn respond<T: Serialize>(status: StatusCode, result: LedgerResult<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => ledger_error_to_response(e),
    }
}

/// Malformed JSON bodies are client errors, not 422s.
pub fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))
}

pub fn query<T>(query: Result<axum::extract::Query<T>, QueryRejection>) -> Result<T, Response> {
    query
        .map(|axum::extract::Query(v)| v)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_query", e.body_text()))
}

/// Parse a path segment into a typed id or date.
pub fn parse_param<T>(raw: &str, what: &'static str) -> Result<T, Response>
where
    T: std::str::FromStr,
{
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bursar_core::{InvoiceId, Money};

    #[test]
    fn maps_kinds_to_status_codes() {
        let cases = [
            (LedgerError::validation("x"), StatusCode::BAD_REQUEST),
            (LedgerError::not_found("invoice", InvoiceId::new()), StatusCode::NOT_FOUND),
            (
                LedgerError::Overpayment {
                    amount: Money::new(2),
                    allocatable: Money::new(1),
                },
                StatusCode::CONFLICT,
            ),
            (LedgerError::concurrency("lost"), StatusCode::CONFLICT),
            (LedgerError::invariant("bug"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ledger_error_to_response(err).status(), status);
        }
    }
}
