//! Retry queue: worker enqueue, operator views, processing and cancel.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use outreach_core::RetryItemId;
use outreach_infra::store::RetryFilter;
use outreach_sync::{RetryItemStatus, RetryQueueItem};

use crate::app::{dto, errors, services::AppServices};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_items).post(enqueue))
        .route("/stats", get(stats))
        .route("/process", post(process_due))
        .route("/:id/cancel", post(cancel))
}

pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::RetryListQuery>,
) -> axum::response::Response {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RetryItemStatus>)
        .transpose();
    let status = match status {
        Ok(v) => v,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", format!("{e}")),
    };
    let data_source_id = match query.data_source_id.as_deref() {
        Some(raw) => match dto::parse_id(raw, "data source id") {
            Ok(v) => Some(v),
            Err(resp) => return resp,
        },
        None => None,
    };

    let filter = RetryFilter {
        data_source_id,
        status,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match services.stores.retry_queue.list(&filter, limit).await {
        Ok(items) => Json(serde_json::json!({ "items": items })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueRetryRequest>,
) -> axum::response::Response {
    let item = RetryQueueItem::new(
        body.data_source_id,
        body.engagement_id,
        body.payload,
        body.error,
        services.retry_policy(),
        Utc::now(),
    );

    match services.stores.retry_queue.enqueue(&item).await {
        Ok(_) => (StatusCode::CREATED, Json(item)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.stores.retry_queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn process_due(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.retry_processor.process_due(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: RetryItemId = match dto::parse_id(&id, "retry item id") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.stores.retry_queue.cancel(id, Utc::now()).await {
        Ok(item) => Json(item).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
