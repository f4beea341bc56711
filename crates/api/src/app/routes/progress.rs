//! Progress read path for pollers, write path for workers.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use outreach_core::{DataSourceId, EngagementId};
use outreach_sync::ProgressUpdate;

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/:data_source_id", get(list_progress))
        .route("/:data_source_id/:engagement_id/start", post(start_run))
        .route("/:data_source_id/:engagement_id/update", post(record_progress))
        .route("/:data_source_id/:engagement_id/error", post(record_error))
        .route("/:data_source_id/:engagement_id/finish", post(finish_run))
}

fn parse_key(
    data_source_id: &str,
    engagement_id: &str,
) -> Result<(DataSourceId, EngagementId), axum::response::Response> {
    Ok((
        dto::parse_id(data_source_id, "data source id")?,
        dto::parse_id(engagement_id, "engagement id")?,
    ))
}

fn record_response(
    status: StatusCode,
    result: Result<outreach_sync::ProgressRecord, outreach_infra::store::StoreError>,
) -> axum::response::Response {
    match result {
        Ok(record) => (status, Json(dto::ProgressView::from(record))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(data_source_id): Path<String>,
) -> axum::response::Response {
    let id: DataSourceId = match dto::parse_id(&data_source_id, "data source id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.stores.progress.list_for_source(id).await {
        Ok(records) => {
            let runs: Vec<dto::ProgressView> = records.into_iter().map(Into::into).collect();
            Json(serde_json::json!({
                "data_source_id": id,
                "runs": runs,
            }))
            .into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn start_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path((data_source_id, engagement_id)): Path<(String, String)>,
    Json(body): Json<dto::StartRunRequest>,
) -> axum::response::Response {
    let (ds, eng) = match parse_key(&data_source_id, &engagement_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = services
        .stores
        .progress
        .start_run(ds, eng, body.total_units, Utc::now())
        .await;
    record_response(StatusCode::CREATED, result)
}

pub async fn record_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path((data_source_id, engagement_id)): Path<(String, String)>,
    Json(body): Json<ProgressUpdate>,
) -> axum::response::Response {
    let (ds, eng) = match parse_key(&data_source_id, &engagement_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = services
        .stores
        .progress
        .record_progress(ds, eng, body, Utc::now())
        .await;
    record_response(StatusCode::OK, result)
}

pub async fn record_error(
    Extension(services): Extension<Arc<AppServices>>,
    Path((data_source_id, engagement_id)): Path<(String, String)>,
    Json(body): Json<dto::RecordErrorRequest>,
) -> axum::response::Response {
    let (ds, eng) = match parse_key(&data_source_id, &engagement_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = services
        .stores
        .progress
        .record_error(ds, eng, &body.error, Utc::now())
        .await;
    record_response(StatusCode::OK, result)
}

pub async fn finish_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path((data_source_id, engagement_id)): Path<(String, String)>,
    Json(body): Json<dto::FinishRunRequest>,
) -> axum::response::Response {
    let (ds, eng) = match parse_key(&data_source_id, &engagement_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let result = services
        .stores
        .progress
        .finish_run(ds, eng, body.status, Utc::now())
        .await;
    record_response(StatusCode::OK, result)
}
