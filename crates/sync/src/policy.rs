//! Resume-vs-reset decision policy.
//!
//! The guards bound how long a job can loop through automated resumes: a hard
//! age ceiling and an hourly budget of resume attempts. Once either trips the
//! job is reset and left for an operator.

use core::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use outreach_core::DomainError;

use crate::attempt::RecoveryAction;
use crate::detector::StuckSync;

/// Mode requested by the caller of the recovery endpoint.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    #[default]
    Auto,
    /// Read-only: report stuck jobs, act on none.
    Detect,
    Resume,
    Reset,
}

impl RecoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryMode::Auto => "auto",
            RecoveryMode::Detect => "detect",
            RecoveryMode::Resume => "resume",
            RecoveryMode::Reset => "reset",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, RecoveryMode::Detect)
    }
}

impl FromStr for RecoveryMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RecoveryMode::Auto),
            "detect" => Ok(RecoveryMode::Detect),
            "resume" => Ok(RecoveryMode::Resume),
            "reset" => Ok(RecoveryMode::Reset),
            other => Err(DomainError::validation(format!(
                "action must be one of: auto, detect, resume, reset (got '{other}')"
            ))),
        }
    }
}

/// Termination guards for automatic recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    /// Jobs stuck longer than this are reset without another resume.
    pub max_stuck: Duration,
    /// Resume attempts allowed inside the attempt window before resetting.
    pub max_resume_attempts: usize,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self {
            max_stuck: Duration::minutes(30),
            max_resume_attempts: 3,
        }
    }
}

/// Why a job is being reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    Requested,
    StuckTooLong { minutes: i64 },
    TooManyAttempts { attempts: usize },
}

impl ResetReason {
    pub fn message(&self) -> String {
        match self {
            ResetReason::Requested => "Sync reset by operator request".to_string(),
            ResetReason::StuckTooLong { minutes } => {
                format!("Sync stuck for {minutes} minutes with no progress; reset for a fresh sync")
            }
            ResetReason::TooManyAttempts { attempts } => format!(
                "Sync reset after {attempts} resume attempts in the last hour without recovering"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Resume,
    Reset(ResetReason),
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    limits: RecoveryLimits,
}

impl RecoveryPolicy {
    pub fn new(limits: RecoveryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RecoveryLimits {
        &self.limits
    }

    /// Decide what to do with a stuck job. `None` for the read-only mode.
    pub fn decide(&self, mode: RecoveryMode, force_resume: bool, stuck: &StuckSync) -> Option<Decision> {
        match mode {
            RecoveryMode::Detect => None,
            RecoveryMode::Reset => Some(Decision::Reset(ResetReason::Requested)),
            RecoveryMode::Resume => Some(Decision::Resume),
            RecoveryMode::Auto if force_resume => Some(Decision::Resume),
            RecoveryMode::Auto => {
                if stuck.stuck_for > self.limits.max_stuck {
                    return Some(Decision::Reset(ResetReason::StuckTooLong {
                        minutes: stuck.stuck_minutes(),
                    }));
                }

                let resumes = stuck
                    .recent_attempts
                    .iter()
                    .filter(|a| a.action == RecoveryAction::Resume)
                    .count();
                if resumes >= self.limits.max_resume_attempts {
                    return Some(Decision::Reset(ResetReason::TooManyAttempts { attempts: resumes }));
                }

                Some(Decision::Resume)
            }
        }
    }
}
