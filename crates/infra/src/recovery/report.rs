//! Request and response shapes of a recovery run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::DataSourceId;
use outreach_sync::{RecoveryMode, StuckSync, SyncStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryRequest {
    #[serde(default)]
    pub action: RecoveryMode,
    /// Restrict the run to one platform.
    #[serde(default)]
    pub platform: Option<String>,
    /// In auto mode, resume even when the guards would reset.
    #[serde(default)]
    pub force_resume: bool,
}

/// A stuck job as reported by `detect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckSyncView {
    pub data_source_id: DataSourceId,
    pub platform: String,
    pub status: SyncStatus,
    pub stuck_minutes: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Attempts within the last hour.
    pub recovery_attempts: usize,
}

impl From<&StuckSync> for StuckSyncView {
    fn from(stuck: &StuckSync) -> Self {
        Self {
            data_source_id: stuck.state.id,
            platform: stuck.state.source_type.clone(),
            status: stuck.state.status,
            stuck_minutes: stuck.stuck_minutes(),
            last_heartbeat: stuck.state.config.heartbeat,
            last_updated: stuck.state.updated_at,
            recovery_attempts: stuck.recent_attempts.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectReport {
    pub success: bool,
    pub stuck_syncs: Vec<StuckSyncView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What recovery did to one job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    Resume,
    Reset,
    ResetAfterFailedResume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub data_source_id: DataSourceId,
    pub platform: String,
    pub action: OutcomeAction,
    pub stuck_duration_minutes: i64,
    pub success: bool,
    pub message: String,
}

impl JobOutcome {
    pub fn new(
        stuck: &StuckSync,
        action: OutcomeAction,
        success: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            data_source_id: stuck.state.id,
            platform: stuck.state.source_type.clone(),
            action,
            stuck_duration_minutes: stuck.stuck_minutes(),
            success,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `false` only when detection itself failed.
    pub success: bool,
    pub stuck_count: usize,
    pub results: Vec<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
