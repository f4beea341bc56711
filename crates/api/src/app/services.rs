//! Infrastructure wiring: stores, worker client, orchestrator, retry processor.

use std::sync::Arc;

use outreach_infra::config::AppConfig;
use outreach_infra::recovery::RecoveryOrchestrator;
use outreach_infra::retry_processor::{RetryProcessor, WorkerRetryHandler};
use outreach_infra::store::{
    InMemoryProgressLedger, InMemoryRetryQueue, InMemorySyncStateStore, PostgresStore,
    ProgressLedger, RetryQueue, StoreError, SyncStateStore,
};
use outreach_infra::worker::{HttpWorkerClient, PlatformWorkerClient, WorkerError};
use outreach_sync::{ContinuationRegistry, RecoveryPolicy, RetryPolicy, StuckDetector};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("worker client setup failed: {0}")]
    Worker(#[from] WorkerError),
}

/// The three storage boundaries, possibly backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub states: Arc<dyn SyncStateStore>,
    pub progress: Arc<dyn ProgressLedger>,
    pub retry_queue: Arc<dyn RetryQueue>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            states: Arc::new(InMemorySyncStateStore::new()),
            progress: Arc::new(InMemoryProgressLedger::new()),
            retry_queue: Arc::new(InMemoryRetryQueue::new()),
        }
    }

    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            states: store.clone(),
            progress: store.clone(),
            retry_queue: store,
        }
    }
}

#[derive(Clone)]
pub struct AppServices {
    pub stores: Stores,
    pub recovery: RecoveryOrchestrator,
    pub retry_processor: RetryProcessor,
}

impl AppServices {
    pub fn new(stores: Stores, worker: Arc<dyn PlatformWorkerClient>, config: &AppConfig) -> Self {
        let registry = ContinuationRegistry::with_defaults();

        let retry_handler = Arc::new(WorkerRetryHandler::new(
            stores.states.clone(),
            worker.clone(),
            Arc::new(registry.clone()),
        ));
        let retry_processor = RetryProcessor::new(
            stores.retry_queue.clone(),
            retry_handler,
            config.retry.policy.clone(),
        )
        .with_claim_lease(config.retry.claim_lease);

        let recovery = RecoveryOrchestrator::new(
            stores.states.clone(),
            stores.progress.clone(),
            worker,
            registry,
        )
        .with_detector(StuckDetector::new(config.recovery.thresholds))
        .with_policy(RecoveryPolicy::new(config.recovery.limits))
        .with_resume_timeout(config.worker.timeout);

        Self {
            stores,
            recovery,
            retry_processor,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry_processor.policy()
    }
}

/// Build services from config: Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    let stores = match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.ensure_schema().await?;
            tracing::info!("using postgres stores");
            Stores::postgres(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    if config.worker.base_url.is_none() {
        tracing::warn!("SYNC_WORKER_BASE_URL not set; every resume will fall back to a reset");
    }
    let worker = Arc::new(HttpWorkerClient::new(
        config.worker.base_url.clone(),
        config.worker.token.clone(),
        config.worker.timeout,
    )?);

    Ok(AppServices::new(stores, worker, config))
}
