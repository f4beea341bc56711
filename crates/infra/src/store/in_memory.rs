//! In-memory stores for tests/dev. Not optimized for performance.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use outreach_core::{DataSourceId, EngagementId, RetryItemId};
use outreach_sync::{ProgressRecord, RecoveryAttempt, RetryItemStatus, RetryQueueItem, SyncState};

use super::{
    CommitOutcome, ProgressLedger, RecoveryCommit, RetryFilter, RetryQueue, RetryQueueStats,
    StoreError, SyncStateStore,
};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
}

#[derive(Debug, Default)]
struct SyncRow {
    state: Option<SyncState>,
    attempts: Vec<RecoveryAttempt>,
}

/// Sync states and recovery logs behind one lock, so commits are atomic.
#[derive(Debug, Default)]
pub struct InMemorySyncStateStore {
    rows: RwLock<HashMap<DataSourceId, SyncRow>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get(&self, id: DataSourceId) -> Result<Option<SyncState>, StoreError> {
        let rows = read(&self.rows)?;
        Ok(rows.get(&id).and_then(|r| r.state.clone()))
    }

    async fn upsert(&self, state: &SyncState) -> Result<(), StoreError> {
        let mut rows = write(&self.rows)?;
        rows.entry(state.id).or_default().state = Some(state.clone());
        Ok(())
    }

    async fn list_active(&self, platform: Option<&str>) -> Result<Vec<SyncState>, StoreError> {
        let rows = read(&self.rows)?;
        let mut active: Vec<SyncState> = rows
            .values()
            .filter_map(|r| r.state.as_ref())
            .filter(|s| s.is_active())
            .filter(|s| platform.is_none_or(|p| s.source_type == p))
            .cloned()
            .collect();
        active.sort_by_key(|s| (s.updated_at, s.id));
        Ok(active)
    }

    async fn recent_attempts(
        &self,
        id: DataSourceId,
        limit: usize,
    ) -> Result<Vec<RecoveryAttempt>, StoreError> {
        let rows = read(&self.rows)?;
        let attempts = rows.get(&id).map(|r| r.attempts.clone()).unwrap_or_default();
        Ok(outreach_sync::attempt::bounded_history(attempts, limit))
    }

    async fn claim(
        &self,
        state: &SyncState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut rows = write(&self.rows)?;
        let Some(row) = rows.get_mut(&state.id) else {
            return Ok(CommitOutcome::Conflict);
        };
        match &row.state {
            Some(current) if current.updated_at == expected_updated_at => {}
            _ => return Ok(CommitOutcome::Conflict),
        }

        row.state = Some(state.clone());
        Ok(CommitOutcome::Applied)
    }

    async fn commit_recovery(&self, commit: &RecoveryCommit) -> Result<CommitOutcome, StoreError> {
        let mut rows = write(&self.rows)?;
        let Some(row) = rows.get_mut(&commit.state.id) else {
            return Ok(CommitOutcome::Conflict);
        };
        match &row.state {
            Some(current) if current.updated_at == commit.expected_updated_at => {}
            _ => return Ok(CommitOutcome::Conflict),
        }

        row.state = Some(commit.state.clone());
        row.attempts.push(commit.attempt.clone());
        Ok(CommitOutcome::Applied)
    }

    async fn append_attempt(
        &self,
        id: DataSourceId,
        attempt: &RecoveryAttempt,
    ) -> Result<(), StoreError> {
        let mut rows = write(&self.rows)?;
        rows.entry(id).or_default().attempts.push(attempt.clone());
        Ok(())
    }
}

/// Progress records, on a lock separate from sync state.
#[derive(Debug, Default)]
pub struct InMemoryProgressLedger {
    records: RwLock<HashMap<(DataSourceId, EngagementId), ProgressRecord>>,
}

impl InMemoryProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressLedger for InMemoryProgressLedger {
    async fn get(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let records = read(&self.records)?;
        Ok(records.get(&(data_source_id, engagement_id)).cloned())
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let mut records = write(&self.records)?;
        records.insert((record.data_source_id, record.engagement_id), record.clone());
        Ok(())
    }

    async fn list_for_source(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let records = read(&self.records)?;
        let mut out: Vec<ProgressRecord> = records
            .values()
            .filter(|r| r.data_source_id == data_source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(out)
    }

    async fn fail_running(
        &self,
        data_source_id: DataSourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut records = write(&self.records)?;
        let failed = records
            .values_mut()
            .filter(|r| r.data_source_id == data_source_id)
            .map(|r| r.force_fail(reason, now))
            .filter(|changed| *changed)
            .count();
        Ok(failed)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRetryQueue {
    items: RwLock<HashMap<RetryItemId, RetryQueueItem>>,
}

impl InMemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn enqueue(&self, item: &RetryQueueItem) -> Result<RetryItemId, StoreError> {
        let mut items = write(&self.items)?;
        if items.contains_key(&item.id) {
            return Err(StoreError::Storage(format!("retry item already exists: {}", item.id)));
        }
        items.insert(item.id, item.clone());
        Ok(item.id)
    }

    async fn get(&self, id: RetryItemId) -> Result<Option<RetryQueueItem>, StoreError> {
        let items = read(&self.items)?;
        Ok(items.get(&id).cloned())
    }

    async fn update(&self, item: &RetryQueueItem) -> Result<(), StoreError> {
        let mut items = write(&self.items)?;
        match items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(StoreError::not_found(format!("retry item {}", item.id))),
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError> {
        let mut items = write(&self.items)?;
        let mut due: Vec<&mut RetryQueueItem> = items
            .values_mut()
            .filter(|i| i.is_claimable(lease, now))
            .collect();
        due.sort_by_key(|i| (i.next_retry_at, i.id));

        let mut claimed = Vec::new();
        for item in due.into_iter().take(limit) {
            if item.status == RetryItemStatus::Processing {
                item.reclaim(lease, now)?;
            } else {
                item.claim(now)?;
            }
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn list(
        &self,
        filter: &RetryFilter,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError> {
        let items = read(&self.items)?;
        let mut out: Vec<RetryQueueItem> = items
            .values()
            .filter(|i| filter.data_source_id.is_none_or(|ds| i.data_source_id == ds))
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|i| (i.created_at, i.id));
        out.truncate(limit);
        Ok(out)
    }

    async fn stats(&self) -> Result<RetryQueueStats, StoreError> {
        let items = read(&self.items)?;
        let mut stats = RetryQueueStats::default();
        for item in items.values() {
            stats.count(item.status);
        }
        Ok(stats)
    }

    async fn cancel(&self, id: RetryItemId, now: DateTime<Utc>) -> Result<RetryQueueItem, StoreError> {
        let mut items = write(&self.items)?;
        let item = items
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("retry item {id}")))?;
        item.cancel(now)?;
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use outreach_sync::{ProgressStatus, RecoveryAction, RetryPolicy, SyncStatus};
    use serde_json::json;

    const LEASE: std::time::Duration = std::time::Duration::from_secs(60);

    fn syncing(platform: &str, now: DateTime<Utc>) -> SyncState {
        let mut s = SyncState::new(DataSourceId::new(), platform, now);
        s.status = SyncStatus::Syncing;
        s
    }

    #[tokio::test]
    async fn list_active_filters_status_and_platform() {
        let store = InMemorySyncStateStore::new();
        let now = Utc::now();

        let a = syncing("smartlead", now);
        let b = syncing("replyio", now);
        let mut idle = syncing("smartlead", now);
        idle.status = SyncStatus::Completed;
        for s in [&a, &b, &idle] {
            store.upsert(s).await.unwrap();
        }

        assert_eq!(store.list_active(None).await.unwrap().len(), 2);
        let only = store.list_active(Some("replyio")).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, b.id);
    }

    #[tokio::test]
    async fn commit_applies_only_on_matching_token() {
        let store = InMemorySyncStateStore::new();
        let then = Utc::now() - Duration::minutes(7);
        let state = syncing("smartlead", then);
        store.upsert(&state).await.unwrap();

        let now = Utc::now();
        let mut reset = state.clone();
        reset.apply_reset("stuck", now);
        let commit = RecoveryCommit {
            state: reset,
            expected_updated_at: then,
            attempt: RecoveryAttempt::new(RecoveryAction::Reset, true, "stuck", now),
        };

        assert_eq!(store.commit_recovery(&commit).await.unwrap(), CommitOutcome::Applied);
        // token moved: a second identical commit is a conflict and logs nothing
        assert_eq!(store.commit_recovery(&commit).await.unwrap(), CommitOutcome::Conflict);

        let stored = store.get(state.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Error);
        assert_eq!(store.recent_attempts(state.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_moves_the_token_without_logging() {
        let store = InMemorySyncStateStore::new();
        let then = Utc::now() - Duration::minutes(7);
        let state = syncing("smartlead", then);
        store.upsert(&state).await.unwrap();

        let mut claimed = state.clone();
        claimed.claim_resume(Utc::now());
        assert_eq!(store.claim(&claimed, then).await.unwrap(), CommitOutcome::Applied);
        assert_eq!(store.claim(&claimed, then).await.unwrap(), CommitOutcome::Conflict);

        let stored = store.get(state.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, claimed.updated_at);
        assert!(stored.config.resume_claimed_at.is_some());
        assert!(store.recent_attempts(state.id, 10).await.unwrap().is_empty());

        let unknown = syncing("replyio", then);
        assert_eq!(store.claim(&unknown, then).await.unwrap(), CommitOutcome::Conflict);
    }

    #[tokio::test]
    async fn attempt_history_is_bounded_newest_first() {
        let store = InMemorySyncStateStore::new();
        let id = DataSourceId::new();
        let now = Utc::now();
        for i in 0..15 {
            let at = now - Duration::minutes(15 - i);
            store
                .append_attempt(id, &RecoveryAttempt::new(RecoveryAction::Resume, true, format!("#{i}"), at))
                .await
                .unwrap();
        }

        let history = store.recent_attempts(id, 10).await.unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].message, "#14");
        assert_eq!(history[9].message, "#5");
    }

    #[tokio::test]
    async fn fail_running_only_touches_running_records_of_the_source() {
        let ledger = InMemoryProgressLedger::new();
        let ds = DataSourceId::new();
        let now = Utc::now();

        let running = ledger.start_run(ds, EngagementId::new(), 10, now).await.unwrap();
        let done = ledger.start_run(ds, EngagementId::new(), 10, now).await.unwrap();
        ledger
            .finish_run(ds, done.engagement_id, ProgressStatus::Completed, now)
            .await
            .unwrap();
        let other = ledger
            .start_run(DataSourceId::new(), EngagementId::new(), 10, now)
            .await
            .unwrap();

        assert_eq!(ledger.fail_running(ds, "reset", now).await.unwrap(), 1);
        let rec = ledger.get(ds, running.engagement_id).await.unwrap().unwrap();
        assert_eq!(rec.status, ProgressStatus::Failed);
        let untouched = ledger
            .get(other.data_source_id, other.engagement_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, ProgressStatus::Running);
    }

    #[tokio::test]
    async fn progress_ops_require_an_existing_run() {
        let ledger = InMemoryProgressLedger::new();
        let err = ledger
            .record_error(DataSourceId::new(), EngagementId::new(), "boom", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn claimed_items_are_not_claimed_twice() {
        let queue = InMemoryRetryQueue::new();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(3, std::time::Duration::from_secs(1));
        for n in 0..3 {
            let item = RetryQueueItem::new(DataSourceId::new(), None, json!({"batch": n}), "429", &policy, now);
            queue.enqueue(&item).await.unwrap();
        }

        let later = now + Duration::seconds(5);
        let first = queue.claim_due(later, LEASE, 2).await.unwrap();
        let second = queue.claim_due(later, LEASE, 10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|i| i.id != second[0].id));
        assert!(queue.claim_due(later, LEASE, 10).await.unwrap().is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processing, 3);
    }

    #[tokio::test]
    async fn abandoned_claims_are_handed_out_again_after_the_lease() {
        let queue = InMemoryRetryQueue::new();
        let now = Utc::now();
        let policy = RetryPolicy::fixed(3, std::time::Duration::from_secs(1));
        let item = RetryQueueItem::new(DataSourceId::new(), None, json!({}), "429", &policy, now);
        queue.enqueue(&item).await.unwrap();

        let claimed_at = now + Duration::seconds(5);
        assert_eq!(queue.claim_due(claimed_at, LEASE, 10).await.unwrap().len(), 1);

        // still inside the lease: nobody else gets it
        let inside = claimed_at + Duration::seconds(59);
        assert!(queue.claim_due(inside, LEASE, 10).await.unwrap().is_empty());

        let expired = claimed_at + Duration::seconds(60);
        let reclaimed = queue.claim_due(expired, LEASE, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, item.id);
        assert_eq!(reclaimed[0].status, RetryItemStatus::Processing);
        assert_eq!(reclaimed[0].updated_at, expired);
        assert!(queue.claim_due(expired, LEASE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_items() {
        let queue = InMemoryRetryQueue::new();
        let now = Utc::now();
        let item = RetryQueueItem::new(
            DataSourceId::new(),
            None,
            json!({}),
            "timeout",
            &RetryPolicy::default(),
            now,
        );
        queue.enqueue(&item).await.unwrap();

        let cancelled = queue.cancel(item.id, now).await.unwrap();
        assert_eq!(cancelled.status, RetryItemStatus::Cancelled);
        assert!(matches!(queue.cancel(item.id, now).await, Err(StoreError::Domain(_))));
        assert!(matches!(
            queue.cancel(RetryItemId::new(), now).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
