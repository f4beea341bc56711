//! Storage boundaries for sync state, run progress and the retry queue.
//!
//! Each boundary has an in-memory implementation (tests/dev) and a Postgres
//! implementation. The recovery attempt log lives with the sync state so a
//! recovery action and its log entry commit together.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use outreach_core::{DataSourceId, DomainError, EngagementId, RetryItemId};
use outreach_sync::{
    ProgressRecord, ProgressStatus, ProgressUpdate, RecoveryAttempt, RetryItemStatus,
    RetryQueueItem, SyncState,
};

pub use in_memory::{InMemoryProgressLedger, InMemoryRetryQueue, InMemorySyncStateStore};
pub use postgres::PostgresStore;

/// Storage error shared by all boundaries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

/// A recovery action to commit against a sync state row.
#[derive(Debug, Clone)]
pub struct RecoveryCommit {
    /// Row contents after the action (its `updated_at` is the new token).
    pub state: SyncState,
    /// `updated_at` observed during detection. The write only applies if the
    /// row still carries it.
    pub expected_updated_at: DateTime<Utc>,
    pub attempt: RecoveryAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The row moved on since detection; nothing was written.
    Conflict,
}

/// Sync state rows plus their append-only recovery log.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get(&self, id: DataSourceId) -> Result<Option<SyncState>, StoreError>;

    /// Insert or replace a row as given. Callers stamp `updated_at`.
    async fn upsert(&self, state: &SyncState) -> Result<(), StoreError>;

    /// Rows in `syncing` or `partial`, optionally restricted to one platform.
    async fn list_active(&self, platform: Option<&str>) -> Result<Vec<SyncState>, StoreError>;

    /// Most recent attempts first, at most `limit`.
    async fn recent_attempts(
        &self,
        id: DataSourceId,
        limit: usize,
    ) -> Result<Vec<RecoveryAttempt>, StoreError>;

    /// Replace the row with `state` only if it still carries
    /// `expected_updated_at`. Logs no attempt.
    async fn claim(
        &self,
        state: &SyncState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Conditionally write the new row and append the attempt, atomically.
    async fn commit_recovery(&self, commit: &RecoveryCommit) -> Result<CommitOutcome, StoreError>;

    /// Append an attempt without touching the row.
    async fn append_attempt(
        &self,
        id: DataSourceId,
        attempt: &RecoveryAttempt,
    ) -> Result<(), StoreError>;
}

/// Per-run progress records keyed by (data source, engagement).
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    async fn get(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
    ) -> Result<Option<ProgressRecord>, StoreError>;

    /// Insert or replace the record for its key.
    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    /// Newest run first.
    async fn list_for_source(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<Vec<ProgressRecord>, StoreError>;

    /// Mark every running record of the data source failed. Returns how many changed.
    async fn fail_running(
        &self,
        data_source_id: DataSourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Start (or restart) the run for a key.
    async fn start_run(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
        total_units: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        let record = ProgressRecord::start(data_source_id, engagement_id, total_units, now);
        self.save(&record).await?;
        Ok(record)
    }

    async fn record_progress(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
        update: ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        let mut record = self.require(data_source_id, engagement_id).await?;
        record.apply_update(update, now)?;
        self.save(&record).await?;
        Ok(record)
    }

    async fn record_error(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        let mut record = self.require(data_source_id, engagement_id).await?;
        record.push_error(error, now);
        self.save(&record).await?;
        Ok(record)
    }

    async fn finish_run(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
        status: ProgressStatus,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StoreError> {
        let mut record = self.require(data_source_id, engagement_id).await?;
        record.finish(status, now)?;
        self.save(&record).await?;
        Ok(record)
    }

    async fn require(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
    ) -> Result<ProgressRecord, StoreError> {
        self.get(data_source_id, engagement_id).await?.ok_or_else(|| {
            StoreError::not_found(format!("progress for {data_source_id}/{engagement_id}"))
        })
    }
}

/// Filter for listing retry items.
#[derive(Debug, Clone, Default)]
pub struct RetryFilter {
    pub data_source_id: Option<DataSourceId>,
    pub status: Option<RetryItemStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryQueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RetryQueueStats {
    pub fn count(&mut self, status: RetryItemStatus) {
        match status {
            RetryItemStatus::Pending => self.pending += 1,
            RetryItemStatus::Processing => self.processing += 1,
            RetryItemStatus::Completed => self.completed += 1,
            RetryItemStatus::Failed => self.failed += 1,
            RetryItemStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Durable queue of individually failed units awaiting retry.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn enqueue(&self, item: &RetryQueueItem) -> Result<RetryItemId, StoreError>;

    async fn get(&self, id: RetryItemId) -> Result<Option<RetryQueueItem>, StoreError>;

    /// Persist a state change of an existing item.
    async fn update(&self, item: &RetryQueueItem) -> Result<(), StoreError>;

    /// Claim up to `limit` items: due `pending` ones, plus `processing` ones
    /// whose claim is older than `lease`. A live claim is never handed to a
    /// second caller.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError>;

    /// Oldest first.
    async fn list(
        &self,
        filter: &RetryFilter,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError>;

    async fn stats(&self) -> Result<RetryQueueStats, StoreError>;

    async fn cancel(&self, id: RetryItemId, now: DateTime<Utc>) -> Result<RetryQueueItem, StoreError>;
}
