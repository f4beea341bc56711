//! Stuck-job detection.
//!
//! A read-only scan over active sync states. A job is stuck when its last sign
//! of life (heartbeat or row write) is older than the threshold for its status.
//! Very recent row writes are treated as proof of liveness even if the
//! heartbeat lags.

use chrono::{DateTime, Duration, Utc};

use crate::attempt::{attempts_within, RecoveryAttempt};
use crate::state::{SyncState, SyncStatus};

/// Inactivity thresholds used by [`StuckDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionThresholds {
    /// Inactivity allowed for `syncing` jobs.
    pub syncing: Duration,
    /// Inactivity allowed for `partial` jobs (they pause between phases).
    pub partial: Duration,
    /// Rows written more recently than this are never stuck.
    pub debounce: Duration,
    /// Window used to report recent recovery attempts.
    pub attempt_window: Duration,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            syncing: Duration::minutes(5),
            partial: Duration::minutes(10),
            debounce: Duration::minutes(2),
            attempt_window: Duration::hours(1),
        }
    }
}

/// An active sync state together with its bounded recovery history.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSync {
    pub state: SyncState,
    /// Most recent attempts first, at most `ATTEMPT_HISTORY_LIMIT`.
    pub attempts: Vec<RecoveryAttempt>,
}

/// A job flagged by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckSync {
    pub state: SyncState,
    pub last_activity: DateTime<Utc>,
    pub stuck_for: Duration,
    /// Attempts inside the detector's attempt window.
    pub recent_attempts: Vec<RecoveryAttempt>,
}

impl StuckSync {
    pub fn stuck_minutes(&self) -> i64 {
        self.stuck_for.num_minutes()
    }

    /// `updated_at` as seen during detection; the token for conditional writes.
    pub fn observed_updated_at(&self) -> DateTime<Utc> {
        self.state.updated_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct StuckDetector {
    thresholds: DetectionThresholds,
}

impl StuckDetector {
    pub fn new(thresholds: DetectionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &DetectionThresholds {
        &self.thresholds
    }

    /// Inactivity threshold for a status, `None` for inactive statuses.
    pub fn threshold_for(&self, status: SyncStatus) -> Option<Duration> {
        match status {
            SyncStatus::Syncing => Some(self.thresholds.syncing),
            SyncStatus::Partial => Some(self.thresholds.partial),
            _ => None,
        }
    }

    /// Evaluate a single job.
    pub fn evaluate(&self, active: &ActiveSync, now: DateTime<Utc>) -> Option<StuckSync> {
        let state = &active.state;
        let threshold = self.threshold_for(state.status)?;

        if now - state.updated_at < self.thresholds.debounce {
            return None;
        }

        let last_activity = state.last_activity();
        let stuck_for = now - last_activity;
        if stuck_for <= threshold {
            return None;
        }

        Some(StuckSync {
            state: state.clone(),
            last_activity,
            stuck_for,
            recent_attempts: attempts_within(&active.attempts, self.thresholds.attempt_window, now),
        })
    }

    /// Scan all active jobs, returning the stuck subset in input order.
    pub fn scan(&self, active: &[ActiveSync], now: DateTime<Utc>) -> Vec<StuckSync> {
        active.iter().filter_map(|a| self.evaluate(a, now)).collect()
    }
}
