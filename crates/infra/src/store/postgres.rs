//! Postgres-backed stores.
//!
//! One pool serves all three boundaries. Recovery commits run in a transaction
//! that updates the sync state row conditionally on its `updated_at` and
//! appends the attempt; a row that moved on since detection rolls back. A
//! resume claim is the same conditional update without the attempt.
//!
//! Retry claims use `FOR UPDATE SKIP LOCKED`, so concurrent schedulers never
//! receive the same item.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use outreach_core::{DataSourceId, EngagementId, RetryItemId};
use outreach_sync::{
    ProgressRecord, ProgressStatus, RecoveryAction, RecoveryAttempt, RetryItemStatus,
    RetryQueueItem, SyncConfig, SyncState, SyncStatus,
};

use super::{
    CommitOutcome, ProgressLedger, RecoveryCommit, RetryFilter, RetryQueue, RetryQueueStats,
    StoreError, SyncStateStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_states (
        id UUID PRIMARY KEY,
        source_type TEXT NOT NULL,
        status TEXT NOT NULL,
        last_sync_at TIMESTAMPTZ,
        last_sync_error TEXT,
        config JSONB NOT NULL DEFAULT '{}'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_states_active
        ON sync_states (status)
        WHERE status IN ('syncing', 'partial')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_recovery_attempts (
        id BIGSERIAL PRIMARY KEY,
        data_source_id UUID NOT NULL,
        attempted_at TIMESTAMPTZ NOT NULL,
        action TEXT NOT NULL,
        success BOOLEAN NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_recovery_attempts_source
        ON sync_recovery_attempts (data_source_id, attempted_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_progress (
        data_source_id UUID NOT NULL,
        engagement_id UUID NOT NULL,
        status TEXT NOT NULL,
        total_units BIGINT NOT NULL,
        processed_units BIGINT NOT NULL,
        current_phase_label TEXT,
        records_synced BIGINT NOT NULL,
        errors JSONB NOT NULL DEFAULT '[]'::jsonb,
        started_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        PRIMARY KEY (data_source_id, engagement_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_retry_queue (
        id UUID PRIMARY KEY,
        data_source_id UUID NOT NULL,
        engagement_id UUID,
        payload JSONB NOT NULL,
        retry_count INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        last_error TEXT,
        next_retry_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_retry_queue_due
        ON sync_retry_queue (next_retry_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_retry_queue_claims
        ON sync_retry_queue (updated_at)
        WHERE status = 'processing'
    "#,
];

const STATE_COLUMNS: &str =
    "id, source_type, status, last_sync_at, last_sync_error, config, updated_at";

const PROGRESS_COLUMNS: &str = "data_source_id, engagement_id, status, total_units, processed_units, \
     current_phase_label, records_synced, errors, started_at, updated_at, completed_at";

const RETRY_COLUMNS: &str = "id, data_source_id, engagement_id, payload, retry_count, max_retries, \
     last_error, next_retry_at, status, created_at, updated_at";

/// Postgres implementation of [`SyncStateStore`], [`ProgressLedger`] and [`RetryQueue`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("sync schema ready");
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for PostgresStore {
    #[instrument(skip(self), fields(data_source_id = %id), err)]
    async fn get(&self, id: DataSourceId) -> Result<Option<SyncState>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STATE_COLUMNS} FROM sync_states WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_sync_state", e))?;

        row.as_ref().map(state_from_row).transpose()
    }

    #[instrument(skip(self, state), fields(data_source_id = %state.id), err)]
    async fn upsert(&self, state: &SyncState) -> Result<(), StoreError> {
        let config = config_to_json(&state.config)?;
        sqlx::query(
            r#"
            INSERT INTO sync_states (id, source_type, status, last_sync_at, last_sync_error, config, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                source_type = EXCLUDED.source_type,
                status = EXCLUDED.status,
                last_sync_at = EXCLUDED.last_sync_at,
                last_sync_error = EXCLUDED.last_sync_error,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.id.as_uuid())
        .bind(&state.source_type)
        .bind(state.status.as_str())
        .bind(state.last_sync_at)
        .bind(&state.last_sync_error)
        .bind(config)
        .bind(state.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_sync_state", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_active(&self, platform: Option<&str>) -> Result<Vec<SyncState>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM sync_states \
             WHERE status IN ('syncing', 'partial') AND ($1::TEXT IS NULL OR source_type = $1) \
             ORDER BY updated_at ASC, id ASC"
        ))
        .bind(platform)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active", e))?;

        rows.iter().map(state_from_row).collect()
    }

    #[instrument(skip(self), fields(data_source_id = %id), err)]
    async fn recent_attempts(
        &self,
        id: DataSourceId,
        limit: usize,
    ) -> Result<Vec<RecoveryAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT attempted_at, action, success, message
            FROM sync_recovery_attempts
            WHERE data_source_id = $1
            ORDER BY attempted_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i64(limit as u64)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_attempts", e))?;

        rows.iter().map(attempt_from_row).collect()
    }

    #[instrument(skip(self, state), fields(data_source_id = %state.id), err)]
    async fn claim(
        &self,
        state: &SyncState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let updated = conditional_update(&*self.pool, state, expected_updated_at).await?;
        Ok(if updated == 0 {
            CommitOutcome::Conflict
        } else {
            CommitOutcome::Applied
        })
    }

    #[instrument(
        skip(self, commit),
        fields(
            data_source_id = %commit.state.id,
            action = commit.attempt.action.as_str()
        ),
        err
    )]
    async fn commit_recovery(&self, commit: &RecoveryCommit) -> Result<CommitOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated =
            conditional_update(&mut *tx, &commit.state, commit.expected_updated_at).await?;

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
            return Ok(CommitOutcome::Conflict);
        }

        insert_attempt(&mut *tx, commit.state.id, &commit.attempt).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CommitOutcome::Applied)
    }

    #[instrument(skip(self, attempt), fields(data_source_id = %id), err)]
    async fn append_attempt(
        &self,
        id: DataSourceId,
        attempt: &RecoveryAttempt,
    ) -> Result<(), StoreError> {
        insert_attempt(&*self.pool, id, attempt).await
    }
}

/// Replace a sync state row if it still carries `expected_updated_at`.
/// Returns the number of rows written.
async fn conditional_update<'e, E>(
    executor: E,
    state: &SyncState,
    expected_updated_at: DateTime<Utc>,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let config = config_to_json(&state.config)?;
    let updated = sqlx::query(
        r#"
        UPDATE sync_states
        SET status = $2,
            last_sync_at = $3,
            last_sync_error = $4,
            config = $5,
            updated_at = $6
        WHERE id = $1 AND updated_at = $7
        "#,
    )
    .bind(state.id.as_uuid())
    .bind(state.status.as_str())
    .bind(state.last_sync_at)
    .bind(&state.last_sync_error)
    .bind(config)
    .bind(state.updated_at)
    .bind(expected_updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("conditional_update", e))?;
    Ok(updated.rows_affected())
}

async fn insert_attempt<'e, E>(
    executor: E,
    id: DataSourceId,
    attempt: &RecoveryAttempt,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO sync_recovery_attempts (data_source_id, attempted_at, action, success, message)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id.as_uuid())
    .bind(attempt.timestamp)
    .bind(attempt.action.as_str())
    .bind(attempt.success)
    .bind(&attempt.message)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("append_attempt", e))?;
    Ok(())
}

#[async_trait]
impl ProgressLedger for PostgresStore {
    #[instrument(skip(self), fields(data_source_id = %data_source_id, engagement_id = %engagement_id), err)]
    async fn get(
        &self,
        data_source_id: DataSourceId,
        engagement_id: EngagementId,
    ) -> Result<Option<ProgressRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress \
             WHERE data_source_id = $1 AND engagement_id = $2"
        ))
        .bind(data_source_id.as_uuid())
        .bind(engagement_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_progress", e))?;

        row.as_ref().map(progress_from_row).transpose()
    }

    #[instrument(
        skip(self, record),
        fields(data_source_id = %record.data_source_id, engagement_id = %record.engagement_id),
        err
    )]
    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        save_progress(&*self.pool, record).await
    }

    #[instrument(skip(self), fields(data_source_id = %data_source_id), err)]
    async fn list_for_source(
        &self,
        data_source_id: DataSourceId,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress \
             WHERE data_source_id = $1 ORDER BY started_at DESC"
        ))
        .bind(data_source_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_progress", e))?;

        rows.iter().map(progress_from_row).collect()
    }

    #[instrument(skip(self, reason), fields(data_source_id = %data_source_id), err)]
    async fn fail_running(
        &self,
        data_source_id: DataSourceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM sync_progress \
             WHERE data_source_id = $1 AND status = 'running' FOR UPDATE"
        ))
        .bind(data_source_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_running", e))?;

        let mut failed = 0;
        for row in &rows {
            let mut record = progress_from_row(row)?;
            if record.force_fail(reason, now) {
                save_progress(&mut *tx, &record).await?;
                failed += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(failed)
    }
}

async fn save_progress<'e, E>(executor: E, record: &ProgressRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let errors = serde_json::to_value(&record.errors)
        .map_err(|e| StoreError::Corrupt(format!("progress errors: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO sync_progress (
            data_source_id, engagement_id, status, total_units, processed_units,
            current_phase_label, records_synced, errors, started_at, updated_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (data_source_id, engagement_id) DO UPDATE SET
            status = EXCLUDED.status,
            total_units = EXCLUDED.total_units,
            processed_units = EXCLUDED.processed_units,
            current_phase_label = EXCLUDED.current_phase_label,
            records_synced = EXCLUDED.records_synced,
            errors = EXCLUDED.errors,
            started_at = EXCLUDED.started_at,
            updated_at = EXCLUDED.updated_at,
            completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(record.data_source_id.as_uuid())
    .bind(record.engagement_id.as_uuid())
    .bind(record.status.as_str())
    .bind(to_i64(record.total_units)?)
    .bind(to_i64(record.processed_units)?)
    .bind(&record.current_phase_label)
    .bind(to_i64(record.records_synced)?)
    .bind(errors)
    .bind(record.started_at)
    .bind(record.updated_at)
    .bind(record.completed_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("save_progress", e))?;
    Ok(())
}

#[async_trait]
impl RetryQueue for PostgresStore {
    #[instrument(skip(self, item), fields(retry_item_id = %item.id), err)]
    async fn enqueue(&self, item: &RetryQueueItem) -> Result<RetryItemId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_retry_queue (
                id, data_source_id, engagement_id, payload, retry_count, max_retries,
                last_error, next_retry_at, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.data_source_id.as_uuid())
        .bind(item.engagement_id.map(Uuid::from))
        .bind(&item.payload)
        .bind(to_i32(item.retry_count)?)
        .bind(to_i32(item.max_retries)?)
        .bind(&item.last_error)
        .bind(item.next_retry_at)
        .bind(item.status.as_str())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_retry", e))?;
        Ok(item.id)
    }

    #[instrument(skip(self), fields(retry_item_id = %id), err)]
    async fn get(&self, id: RetryItemId) -> Result<Option<RetryQueueItem>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RETRY_COLUMNS} FROM sync_retry_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_retry", e))?;

        row.as_ref().map(retry_from_row).transpose()
    }

    #[instrument(skip(self, item), fields(retry_item_id = %item.id), err)]
    async fn update(&self, item: &RetryQueueItem) -> Result<(), StoreError> {
        update_retry(&*self.pool, item).await
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError> {
        // Claims taken at or before this instant have expired.
        let stale_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows = sqlx::query(&format!(
            r#"
            UPDATE sync_retry_queue
            SET status = 'processing', updated_at = $1
            WHERE id IN (
                SELECT id FROM sync_retry_queue
                WHERE (status = 'pending' AND next_retry_at <= $1)
                   OR (status = 'processing' AND updated_at <= $3)
                ORDER BY next_retry_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RETRY_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(to_i64(limit as u64)?)
        .bind(stale_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut items = rows
            .iter()
            .map(retry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by_key(|i| (i.next_retry_at, i.id));
        Ok(items)
    }

    #[instrument(skip(self, filter), err)]
    async fn list(
        &self,
        filter: &RetryFilter,
        limit: usize,
    ) -> Result<Vec<RetryQueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RETRY_COLUMNS} FROM sync_retry_queue \
             WHERE ($1::UUID IS NULL OR data_source_id = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $3"
        ))
        .bind(filter.data_source_id.map(Uuid::from))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(to_i64(limit as u64)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_retry", e))?;

        rows.iter().map(retry_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<RetryQueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_retry_queue GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("retry_stats", e))?;

        let mut stats = RetryQueueStats::default();
        for row in &rows {
            let status: RetryItemStatus = parse_column(row, "status")?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let n = usize::try_from(n).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            match status {
                RetryItemStatus::Pending => stats.pending = n,
                RetryItemStatus::Processing => stats.processing = n,
                RetryItemStatus::Completed => stats.completed = n,
                RetryItemStatus::Failed => stats.failed = n,
                RetryItemStatus::Cancelled => stats.cancelled = n,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(retry_item_id = %id), err)]
    async fn cancel(&self, id: RetryItemId, now: DateTime<Utc>) -> Result<RetryQueueItem, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {RETRY_COLUMNS} FROM sync_retry_queue WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_retry", e))?
        .ok_or_else(|| StoreError::not_found(format!("retry item {id}")))?;

        let mut item = retry_from_row(&row)?;
        item.cancel(now)?;
        update_retry(&mut *tx, &item).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(item)
    }
}

async fn update_retry<'e, E>(executor: E, item: &RetryQueueItem) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE sync_retry_queue
        SET retry_count = $2,
            last_error = $3,
            next_retry_at = $4,
            status = $5,
            updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(item.id.as_uuid())
    .bind(to_i32(item.retry_count)?)
    .bind(&item.last_error)
    .bind(item.next_retry_at)
    .bind(item.status.as_str())
    .bind(item.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("update_retry", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found(format!("retry item {}", item.id)));
    }
    Ok(())
}

fn state_from_row(row: &PgRow) -> Result<SyncState, StoreError> {
    let config: serde_json::Value = row.try_get("config").map_err(corrupt)?;
    let config: SyncConfig = serde_json::from_value(config)
        .map_err(|e| StoreError::Corrupt(format!("sync config: {e}")))?;

    Ok(SyncState {
        id: DataSourceId::from_uuid(row.try_get("id").map_err(corrupt)?),
        source_type: row.try_get("source_type").map_err(corrupt)?,
        status: parse_column::<SyncStatus>(row, "status")?,
        last_sync_at: row.try_get("last_sync_at").map_err(corrupt)?,
        last_sync_error: row.try_get("last_sync_error").map_err(corrupt)?,
        config,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<RecoveryAttempt, StoreError> {
    Ok(RecoveryAttempt {
        timestamp: row.try_get("attempted_at").map_err(corrupt)?,
        action: parse_column::<RecoveryAction>(row, "action")?,
        success: row.try_get("success").map_err(corrupt)?,
        message: row.try_get("message").map_err(corrupt)?,
    })
}

fn progress_from_row(row: &PgRow) -> Result<ProgressRecord, StoreError> {
    let errors: serde_json::Value = row.try_get("errors").map_err(corrupt)?;
    let errors: Vec<String> = serde_json::from_value(errors)
        .map_err(|e| StoreError::Corrupt(format!("progress errors: {e}")))?;

    Ok(ProgressRecord {
        data_source_id: DataSourceId::from_uuid(row.try_get("data_source_id").map_err(corrupt)?),
        engagement_id: EngagementId::from_uuid(row.try_get("engagement_id").map_err(corrupt)?),
        status: parse_column::<ProgressStatus>(row, "status")?,
        total_units: from_i64(row.try_get("total_units").map_err(corrupt)?)?,
        processed_units: from_i64(row.try_get("processed_units").map_err(corrupt)?)?,
        current_phase_label: row.try_get("current_phase_label").map_err(corrupt)?,
        records_synced: from_i64(row.try_get("records_synced").map_err(corrupt)?)?,
        errors,
        started_at: row.try_get("started_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        completed_at: row.try_get("completed_at").map_err(corrupt)?,
    })
}

fn retry_from_row(row: &PgRow) -> Result<RetryQueueItem, StoreError> {
    let engagement_id: Option<Uuid> = row.try_get("engagement_id").map_err(corrupt)?;

    Ok(RetryQueueItem {
        id: RetryItemId::from_uuid(row.try_get("id").map_err(corrupt)?),
        data_source_id: DataSourceId::from_uuid(row.try_get("data_source_id").map_err(corrupt)?),
        engagement_id: engagement_id.map(EngagementId::from_uuid),
        payload: row.try_get("payload").map_err(corrupt)?,
        retry_count: from_i32(row.try_get("retry_count").map_err(corrupt)?)?,
        max_retries: from_i32(row.try_get("max_retries").map_err(corrupt)?)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        next_retry_at: row.try_get("next_retry_at").map_err(corrupt)?,
        status: parse_column::<RetryItemStatus>(row, "status")?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = outreach_core::DomainError>,
{
    let raw: String = row.try_get(column).map_err(corrupt)?;
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn config_to_json(config: &SyncConfig) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(config).map_err(|e| StoreError::Corrupt(format!("sync config: {e}")))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("value out of range: {value}")))
}

fn from_i64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter: {value}")))
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("value out of range: {value}")))
}

fn from_i32(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative counter: {value}")))
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique violation
                Some("23505") => StoreError::Storage(format!("duplicate key ({msg})")),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
