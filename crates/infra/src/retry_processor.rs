//! Processes due retry-queue items.
//!
//! Each pass claims due items, hands each to a [`RetryHandler`] and records
//! the outcome: success completes the item, failure reschedules it with
//! backoff or, once the budget is spent, marks it failed for operators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use outreach_sync::{ContinuationRegistry, RetryItemStatus, RetryPolicy, RetryQueueItem};

use crate::store::{RetryQueue, StoreError, SyncStateStore};
use crate::worker::PlatformWorkerClient;

/// Executes one retry of a failed unit.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, item: &RetryQueueItem) -> Result<(), String>;
}

/// Re-sends a failed unit to its platform worker.
pub struct WorkerRetryHandler {
    states: Arc<dyn SyncStateStore>,
    worker: Arc<dyn PlatformWorkerClient>,
    registry: Arc<ContinuationRegistry>,
}

impl WorkerRetryHandler {
    pub fn new(
        states: Arc<dyn SyncStateStore>,
        worker: Arc<dyn PlatformWorkerClient>,
        registry: Arc<ContinuationRegistry>,
    ) -> Self {
        Self {
            states,
            worker,
            registry,
        }
    }

    fn payload(item: &RetryQueueItem) -> Value {
        json!({
            "dataSourceId": item.data_source_id,
            "engagementId": item.engagement_id,
            "isRetry": true,
            "retryCount": item.retry_count,
            "unit": item.payload,
        })
    }
}

#[async_trait]
impl RetryHandler for WorkerRetryHandler {
    async fn retry(&self, item: &RetryQueueItem) -> Result<(), String> {
        let state = self
            .states
            .get(item.data_source_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no sync state for data source {}", item.data_source_id))?;

        let builder = self
            .registry
            .get(&state.source_type)
            .ok_or_else(|| format!("no worker registered for platform '{}'", state.source_type))?;

        self.worker
            .send(builder.endpoint(), &Self::payload(item))
            .await
            .map_err(|e| e.to_string())
    }
}

/// Outcome counts of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Items whose outcome could not be stored; they are reclaimed once their lease expires.
    pub unrecorded: usize,
}

/// Where one retried item ended up.
enum Settled {
    Completed,
    Rescheduled,
    Exhausted(String),
}

/// Default time a claimed item may stay `processing` before it is reclaimed.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
pub struct RetryProcessor {
    queue: Arc<dyn RetryQueue>,
    handler: Arc<dyn RetryHandler>,
    policy: RetryPolicy,
    batch_size: usize,
    claim_lease: Duration,
}

impl RetryProcessor {
    pub fn new(queue: Arc<dyn RetryQueue>, handler: Arc<dyn RetryHandler>, policy: RetryPolicy) -> Self {
        Self {
            queue,
            handler,
            policy,
            batch_size: 25,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Must outlast one full batch, or a slow pass loses its items to the next one.
    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim and process every item due at `now`, up to one batch.
    ///
    /// Only the claim itself can fail the pass. A per-item store error is
    /// logged and the rest of the batch still runs.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<ProcessSummary, StoreError> {
        let claimed = self
            .queue
            .claim_due(now, self.claim_lease, self.batch_size)
            .await?;
        let mut summary = ProcessSummary {
            claimed: claimed.len(),
            ..ProcessSummary::default()
        };

        for mut item in claimed {
            let at = Utc::now().max(now);
            let settled = match self.handler.retry(&item).await {
                Ok(()) => item.complete(at).map(|()| Settled::Completed),
                Err(e) => item.record_failure(&e, &self.policy, at).map(|()| {
                    if item.status == RetryItemStatus::Failed {
                        Settled::Exhausted(e)
                    } else {
                        Settled::Rescheduled
                    }
                }),
            };

            let stored = match settled {
                Ok(settled) => self.queue.update(&item).await.map(|()| settled),
                Err(e) => Err(StoreError::from(e)),
            };
            let settled = match stored {
                Ok(settled) => settled,
                Err(e) => {
                    summary.unrecorded += 1;
                    error!(retry_item_id = %item.id, error = %e, "failed to record retry outcome");
                    continue;
                }
            };

            match settled {
                Settled::Completed => {
                    summary.completed += 1;
                    debug!(retry_item_id = %item.id, "retry succeeded");
                }
                Settled::Rescheduled => {
                    summary.rescheduled += 1;
                    debug!(retry_item_id = %item.id, next_retry_at = %item.next_retry_at, "retry rescheduled");
                }
                Settled::Exhausted(e) => {
                    summary.failed += 1;
                    warn!(
                        retry_item_id = %item.id,
                        data_source_id = %item.data_source_id,
                        retry_count = item.retry_count,
                        error = %e,
                        "retry budget exhausted"
                    );
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                completed = summary.completed,
                rescheduled = summary.rescheduled,
                failed = summary.failed,
                unrecorded = summary.unrecorded,
                "retry pass finished"
            );
        }
        Ok(summary)
    }

    /// Run [`Self::process_due`] every `interval` until the handle is shut down.
    pub fn spawn(self, interval: Duration) -> RetryPollerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_due(Utc::now()).await {
                            error!(error = %e, "retry pass failed");
                        }
                    }
                }
            }
            debug!("retry poller stopped");
        });

        RetryPollerHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running retry poller.
#[derive(Debug)]
pub struct RetryPollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RetryPollerHandle {
    /// Stop polling and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use outreach_core::{DataSourceId, RetryItemId};
    use outreach_sync::SyncState;

    use crate::store::{InMemoryRetryQueue, InMemorySyncStateStore, RetryFilter, RetryQueueStats};
    use crate::worker::WorkerError;

    struct ScriptedHandler {
        results: Mutex<Vec<Result<(), String>>>,
    }

    #[async_trait]
    impl RetryHandler for ScriptedHandler {
        async fn retry(&self, _item: &RetryQueueItem) -> Result<(), String> {
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    fn scripted(results: Vec<Result<(), String>>) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            results: Mutex::new(results),
        })
    }

    async fn queue_with_item(policy: &RetryPolicy, now: DateTime<Utc>) -> (Arc<InMemoryRetryQueue>, RetryQueueItem) {
        let queue = Arc::new(InMemoryRetryQueue::new());
        let item = RetryQueueItem::new(DataSourceId::new(), None, json!({"campaignId": 7}), "HTTP 429", policy, now);
        queue.enqueue(&item).await.unwrap();
        (queue, item)
    }

    #[tokio::test]
    async fn successful_retry_completes_the_item() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
        let now = Utc::now();
        let (queue, item) = queue_with_item(&policy, now).await;
        let processor = RetryProcessor::new(queue.clone(), scripted(vec![Ok(())]), policy);

        let summary = processor.process_due(now + ChronoDuration::seconds(11)).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.completed, 1);
        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RetryItemStatus::Completed);
    }

    #[tokio::test]
    async fn items_not_yet_due_are_left_alone() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        let now = Utc::now();
        let (queue, item) = queue_with_item(&policy, now).await;
        let processor = RetryProcessor::new(queue.clone(), scripted(vec![]), policy);

        let summary = processor.process_due(now).await.unwrap();
        assert_eq!(summary, ProcessSummary::default());
        assert_eq!(queue.get(item.id).await.unwrap().unwrap().status, RetryItemStatus::Pending);
    }

    #[tokio::test]
    async fn failures_back_off_then_exhaust_the_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(10));
        let now = Utc::now();
        let (queue, item) = queue_with_item(&policy, now).await;
        let handler = scripted(vec![Err("still 429".to_string()), Err("429 again".to_string())]);
        let processor = RetryProcessor::new(queue.clone(), handler, policy);

        let first = processor.process_due(now + ChronoDuration::seconds(11)).await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RetryItemStatus::Pending);
        assert_eq!(stored.retry_count, 1);

        let second = processor.process_due(stored.next_retry_at).await.unwrap();
        assert_eq!(second.failed, 1);
        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RetryItemStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);

        // never scheduled again
        let later = processor.process_due(now + ChronoDuration::days(1)).await.unwrap();
        assert_eq!(later.claimed, 0);
    }

    /// Queue whose first `update` fails, as if the database dropped mid-pass.
    struct FirstUpdateFails {
        inner: InMemoryRetryQueue,
        failed_once: Mutex<bool>,
    }

    #[async_trait]
    impl RetryQueue for FirstUpdateFails {
        async fn enqueue(&self, item: &RetryQueueItem) -> Result<RetryItemId, StoreError> {
            self.inner.enqueue(item).await
        }

        async fn get(&self, id: RetryItemId) -> Result<Option<RetryQueueItem>, StoreError> {
            self.inner.get(id).await
        }

        async fn update(&self, item: &RetryQueueItem) -> Result<(), StoreError> {
            {
                let mut failed_once = self.failed_once.lock().unwrap();
                if !*failed_once {
                    *failed_once = true;
                    return Err(StoreError::Storage("connection reset".to_string()));
                }
            }
            self.inner.update(item).await
        }

        async fn claim_due(
            &self,
            now: DateTime<Utc>,
            lease: Duration,
            limit: usize,
        ) -> Result<Vec<RetryQueueItem>, StoreError> {
            self.inner.claim_due(now, lease, limit).await
        }

        async fn list(&self, filter: &RetryFilter, limit: usize) -> Result<Vec<RetryQueueItem>, StoreError> {
            self.inner.list(filter, limit).await
        }

        async fn stats(&self) -> Result<RetryQueueStats, StoreError> {
            self.inner.stats().await
        }

        async fn cancel(&self, id: RetryItemId, now: DateTime<Utc>) -> Result<RetryQueueItem, StoreError> {
            self.inner.cancel(id, now).await
        }
    }

    #[tokio::test]
    async fn a_failed_write_back_does_not_strand_the_batch() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
        let now = Utc::now();
        let queue = Arc::new(FirstUpdateFails {
            inner: InMemoryRetryQueue::new(),
            failed_once: Mutex::new(false),
        });
        for n in 0..3 {
            let item = RetryQueueItem::new(DataSourceId::new(), None, json!({"batch": n}), "HTTP 429", &policy, now);
            queue.enqueue(&item).await.unwrap();
        }
        let processor = RetryProcessor::new(queue.clone(), scripted(vec![]), policy)
            .with_claim_lease(Duration::from_secs(300));

        let first = processor.process_due(now + ChronoDuration::seconds(11)).await.unwrap();
        assert_eq!(first.claimed, 3);
        assert_eq!(first.completed, 2);
        assert_eq!(first.unrecorded, 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.completed, stats.processing), (2, 1));

        // the unrecorded item is held until its lease runs out, then retried
        let held = processor.process_due(now + ChronoDuration::minutes(2)).await.unwrap();
        assert_eq!(held.claimed, 0);

        let reclaimed = processor.process_due(now + ChronoDuration::days(30)).await.unwrap();
        assert_eq!(reclaimed.claimed, 1);
        assert_eq!(reclaimed.completed, 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.completed, stats.processing, stats.pending), (3, 0, 0));
    }

    struct RecordingWorker {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl PlatformWorkerClient for RecordingWorker {
        async fn send(&self, endpoint: &str, payload: &Value) -> Result<(), WorkerError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_handler_routes_by_platform() {
        let states = Arc::new(InMemorySyncStateStore::new());
        let state = SyncState::new(DataSourceId::new(), "replyio", Utc::now());
        states.upsert(&state).await.unwrap();
        let worker = Arc::new(RecordingWorker {
            calls: Mutex::new(Vec::new()),
        });
        let handler = WorkerRetryHandler::new(
            states,
            worker.clone(),
            Arc::new(ContinuationRegistry::with_defaults()),
        );

        let item = RetryQueueItem::new(state.id, None, json!({"batch": 4}), "timeout", &RetryPolicy::default(), Utc::now());
        handler.retry(&item).await.unwrap();

        let calls = worker.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "replyio-sync");
        assert_eq!(calls[0].1["isRetry"], json!(true));
        assert_eq!(calls[0].1["unit"], json!({"batch": 4}));

        let orphan = RetryQueueItem::new(DataSourceId::new(), None, json!({}), "x", &RetryPolicy::default(), Utc::now());
        assert!(handler.retry(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let queue = Arc::new(InMemoryRetryQueue::new());
        let processor = RetryProcessor::new(queue, scripted(vec![]), RetryPolicy::default());
        let handle = processor.spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
