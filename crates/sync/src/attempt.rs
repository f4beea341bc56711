//! Recovery attempt log entries.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::DomainError;

/// Number of attempts returned by a bounded history read.
pub const ATTEMPT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Resume,
    Reset,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Resume => "resume",
            RecoveryAction::Reset => "reset",
        }
    }
}

impl FromStr for RecoveryAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resume" => Ok(RecoveryAction::Resume),
            "reset" => Ok(RecoveryAction::Reset),
            other => Err(DomainError::validation(format!("unknown recovery action '{other}'"))),
        }
    }
}

/// One entry of the append-only recovery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub action: RecoveryAction,
    pub success: bool,
    pub message: String,
}

impl RecoveryAttempt {
    pub fn new(
        action: RecoveryAction,
        success: bool,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            action,
            success,
            message: message.into(),
        }
    }

    pub fn is_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now - self.timestamp <= window
    }
}

/// Attempts inside the trailing window, preserving input order.
pub fn attempts_within(
    attempts: &[RecoveryAttempt],
    window: Duration,
    now: DateTime<Utc>,
) -> Vec<RecoveryAttempt> {
    attempts
        .iter()
        .filter(|a| a.is_within(window, now))
        .cloned()
        .collect()
}

/// Keep the `limit` most recent attempts, newest first.
pub fn bounded_history(mut attempts: Vec<RecoveryAttempt>, limit: usize) -> Vec<RecoveryAttempt> {
    attempts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    attempts.truncate(limit);
    attempts
}
