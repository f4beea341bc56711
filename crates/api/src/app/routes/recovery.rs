//! `POST /sync-recovery`: detect, resume or reset stuck syncs.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::{dto, services::AppServices};

pub async fn run_recovery(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let request = match dto::parse_recovery_request(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    if request.action.is_read_only() {
        let report = services
            .recovery
            .detect_report(request.platform.as_deref())
            .await;
        let status = if report.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return (status, Json(report)).into_response();
    }

    let report = services.recovery.recover(&request).await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}
