use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use outreach_core::DomainError;
use outreach_infra::store::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        StoreError::Domain(DomainError::InvalidTransition(msg)) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", msg)
        }
        StoreError::Domain(e) => json_error(StatusCode::BAD_REQUEST, "domain_error", e.to_string()),
        StoreError::Corrupt(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "corrupt_data", msg),
        StoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
