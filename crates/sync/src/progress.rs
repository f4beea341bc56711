//! Per-run progress records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{DataSourceId, DomainError, DomainResult, EngagementId};

/// Most recent error messages kept on a progress record.
pub const MAX_PROGRESS_ERRORS: usize = 50;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

impl FromStr for ProgressStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ProgressStatus::Running),
            "completed" => Ok(ProgressStatus::Completed),
            "failed" => Ok(ProgressStatus::Failed),
            "partial" => Ok(ProgressStatus::Partial),
            other => Err(DomainError::validation(format!("unknown progress status '{other}'"))),
        }
    }
}

/// Incremental update reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub processed_units: Option<u64>,
    pub total_units: Option<u64>,
    #[serde(default)]
    pub records_synced_delta: u64,
    pub phase_label: Option<String>,
}

/// Progress of one sync run, keyed by (data source, engagement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub data_source_id: DataSourceId,
    pub engagement_id: EngagementId,
    pub status: ProgressStatus,
    pub total_units: u64,
    pub processed_units: u64,
    pub current_phase_label: Option<String>,
    pub records_synced: u64,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn start(
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
        total_units: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            data_source_id,
            engagement_id,
            status: ProgressStatus::Running,
            total_units,
            processed_units: 0,
            current_phase_label: None,
            records_synced: 0,
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProgressStatus::Running
    }

    pub fn percent_complete(&self) -> Option<f64> {
        if self.total_units == 0 {
            return None;
        }
        Some((self.processed_units as f64 / self.total_units as f64 * 100.0).min(100.0))
    }

    pub fn apply_update(&mut self, update: ProgressUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_running("update progress")?;

        let total = update.total_units.unwrap_or(self.total_units);
        let processed = update.processed_units.unwrap_or(self.processed_units);
        if total > 0 && processed > total {
            return Err(DomainError::validation(format!(
                "processed units ({processed}) exceed total units ({total})"
            )));
        }

        self.total_units = total;
        self.processed_units = processed;
        self.records_synced = self.records_synced.saturating_add(update.records_synced_delta);
        if update.phase_label.is_some() {
            self.current_phase_label = update.phase_label;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Append an error, dropping the oldest beyond [`MAX_PROGRESS_ERRORS`].
    pub fn push_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.errors.push(error.into());
        if self.errors.len() > MAX_PROGRESS_ERRORS {
            let overflow = self.errors.len() - MAX_PROGRESS_ERRORS;
            self.errors.drain(..overflow);
        }
        self.updated_at = now;
    }

    /// Worker-driven completion into a terminal status.
    pub fn finish(&mut self, status: ProgressStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !status.is_terminal() {
            return Err(DomainError::validation("cannot finish a run as running"));
        }
        self.ensure_running("finish")?;

        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Recovery-driven failure. Returns `false` if the run had already ended.
    pub fn force_fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.push_error(reason, now);
        self.status = ProgressStatus::Failed;
        self.completed_at = Some(now);
        true
    }

    fn ensure_running(&self, op: &str) -> DomainResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot {op} a {} run",
                self.status.as_str()
            )))
        }
    }
}
