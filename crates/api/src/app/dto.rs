use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use outreach_core::{DataSourceId, EngagementId};
use outreach_infra::recovery::RecoveryRequest;
use outreach_sync::{ProgressRecord, ProgressStatus};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub total_units: u64,
}

#[derive(Debug, Deserialize)]
pub struct RecordErrorRequest {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct FinishRunRequest {
    pub status: ProgressStatus,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRetryRequest {
    pub data_source_id: DataSourceId,
    pub engagement_id: Option<EngagementId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryListQuery {
    pub status: Option<String>,
    pub data_source_id: Option<String>,
    pub limit: Option<usize>,
}

/// Parse the recovery body. An empty body means `{"action": "auto"}`.
pub fn parse_recovery_request(body: &[u8]) -> Result<RecoveryRequest, axum::response::Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RecoveryRequest::default());
    }

    serde_json::from_slice(body).map_err(|e| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid recovery request: {e}"),
        )
    })
}

pub fn parse_id<T>(raw: &str, what: &'static str) -> Result<T, axum::response::Response>
where
    T: core::str::FromStr,
{
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what}")))
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ProgressView {
    #[serde(flatten)]
    pub record: ProgressRecord,
    pub percent_complete: Option<f64>,
}

impl From<ProgressRecord> for ProgressView {
    fn from(record: ProgressRecord) -> Self {
        Self {
            percent_complete: record.percent_complete(),
            record,
        }
    }
}
