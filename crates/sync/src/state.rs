//! Persisted sync state of one integration instance.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use outreach_core::{DataSourceId, DomainError};

/// Lifecycle status of an integration's sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Partial,
    Completed,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Partial => "partial",
            SyncStatus::Completed => "completed",
            SyncStatus::Error => "error",
        }
    }

    /// Active jobs are the only ones eligible for stuck detection.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Syncing | SyncStatus::Partial)
    }
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "partial" => Ok(SyncStatus::Partial),
            "completed" => Ok(SyncStatus::Completed),
            "error" => Ok(SyncStatus::Error),
            other => Err(DomainError::validation(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Structured continuation state written by the platform worker.
///
/// Known keys are typed; anything else the worker stores is kept in `extra`
/// and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Liveness timestamp, written independently of row updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_chunk_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u64>,
    /// Set by a reset so an operator can start a fresh sync.
    #[serde(default)]
    pub can_retry: bool,
    /// Set while a recovery pass is handing the job back to its worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_claimed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sync state row (one per integration instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: DataSourceId,
    /// Platform identifier (e.g. `smartlead`).
    pub source_type: String,
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub config: SyncConfig,
    /// Bumped by every write; doubles as the optimistic-concurrency token.
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(id: DataSourceId, source_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source_type: source_type.into(),
            status: SyncStatus::Idle,
            last_sync_at: None,
            last_sync_error: None,
            config: SyncConfig::default(),
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Latest observed sign of life: the heartbeat or the row write, whichever is newer.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.config.heartbeat {
            Some(hb) if hb > self.updated_at => hb,
            _ => self.updated_at,
        }
    }

    /// Terminal reset: the job is marked failed and unblocked for a fresh sync.
    pub fn apply_reset(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = SyncStatus::Error;
        self.last_sync_error = Some(error.into());
        self.config.can_retry = true;
        self.config.resume_claimed_at = None;
        self.updated_at = now;
    }

    /// Take the job for a resume before calling the worker. The new
    /// `updated_at` is the token every later write of this pass is checked against.
    pub fn claim_resume(&mut self, now: DateTime<Utc>) {
        self.config.heartbeat = Some(now);
        self.config.resume_claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Record that a continuation was handed to the worker.
    pub fn apply_resume(&mut self, now: DateTime<Utc>) {
        self.config.heartbeat = Some(now);
        self.config.resume_claimed_at = None;
        self.updated_at = now;
    }
}
