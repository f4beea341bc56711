//! Retry queue items and their backoff policy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{DataSourceId, DomainError, DomainResult, EngagementId, RetryItemId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryItemStatus {
    /// Waiting for `next_retry_at`.
    Pending,
    /// Claimed by a scheduler.
    Processing,
    Completed,
    /// Retry budget exhausted; surfaced to operators, never scheduled again.
    Failed,
    Cancelled,
}

impl RetryItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryItemStatus::Pending => "pending",
            RetryItemStatus::Processing => "processing",
            RetryItemStatus::Completed => "completed",
            RetryItemStatus::Failed => "failed",
            RetryItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryItemStatus::Completed | RetryItemStatus::Failed | RetryItemStatus::Cancelled
        )
    }
}

impl FromStr for RetryItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RetryItemStatus::Pending),
            "processing" => Ok(RetryItemStatus::Processing),
            "completed" => Ok(RetryItemStatus::Completed),
            "failed" => Ok(RetryItemStatus::Failed),
            "cancelled" => Ok(RetryItemStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown retry status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    /// base * 2^(retry - 1)
    #[default]
    Exponential,
}

/// How often and how far apart a failed unit is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before retry number `retry` (1-indexed), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One individually failed unit of work awaiting a scheduled retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: RetryItemId,
    pub data_source_id: DataSourceId,
    pub engagement_id: Option<EngagementId>,
    /// Opaque description of the unit (e.g. campaign id, batch number).
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub status: RetryItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryQueueItem {
    /// Queue a unit that just failed for the first time.
    pub fn new(
        data_source_id: DataSourceId,
        engagement_id: Option<EngagementId>,
        payload: serde_json::Value,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, next_retry_at) = if policy.max_retries == 0 {
            (RetryItemStatus::Failed, now)
        } else {
            (RetryItemStatus::Pending, after(now, policy.delay_for_retry(1)))
        };

        Self {
            id: RetryItemId::new(),
            data_source_id,
            engagement_id,
            payload,
            retry_count: 0,
            max_retries: policy.max_retries,
            last_error: Some(error.into()),
            next_retry_at,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryItemStatus::Pending && self.next_retry_at <= now
    }

    /// A `processing` claim older than `lease` whose scheduler never reported back.
    pub fn lease_expired(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        self.status == RetryItemStatus::Processing && after(self.updated_at, lease) <= now
    }

    /// Due, or abandoned by an earlier pass.
    pub fn is_claimable(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        self.is_due(now) || self.lease_expired(lease, now)
    }

    /// Take over an abandoned claim; the item stays `processing` under a fresh lease.
    pub fn reclaim(&mut self, lease: Duration, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.lease_expired(lease, now) {
            return Err(DomainError::invalid_transition(format!(
                "cannot reclaim a {} retry item holding a live claim",
                self.status.as_str()
            )));
        }
        self.updated_at = now;
        Ok(())
    }

    /// pending → processing. Callers must hold exclusive access to the item.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != RetryItemStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "cannot claim a {} retry item",
                self.status.as_str()
            )));
        }
        self.status = RetryItemStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_processing("complete")?;
        self.status = RetryItemStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// A retry attempt failed: schedule the next one or give up.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_processing("fail")?;

        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = Some(error.into());
        self.updated_at = now;

        if self.retry_count >= self.max_retries {
            self.status = RetryItemStatus::Failed;
        } else {
            self.status = RetryItemStatus::Pending;
            self.next_retry_at = after(now, policy.delay_for_retry(self.retry_count + 1));
        }
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "cannot cancel a {} retry item",
                self.status.as_str()
            )));
        }
        self.status = RetryItemStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_processing(&self, op: &str) -> DomainResult<()> {
        if self.status == RetryItemStatus::Processing {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot {op} a {} retry item",
                self.status.as_str()
            )))
        }
    }
}
