//! Detect → decide → act over all stuck sync jobs.
//!
//! Every write is conditional on the `updated_at` observed at detection, so a
//! worker that recovers on its own always wins the race: the recovery action
//! for that job silently becomes a no-op. A resume first claims the row (new
//! token, fresh heartbeat, resume marker) and only then calls the worker, so
//! overlapping passes deliver at most one continuation per detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use tracing::{debug, error, info, warn};

use outreach_sync::{
    ActiveSync, ContinuationRegistry, ContinuationRequest, Decision, RecoveryAction,
    RecoveryAttempt, RecoveryPolicy, StuckDetector, StuckSync, SyncState, ATTEMPT_HISTORY_LIMIT,
};

use crate::store::{CommitOutcome, ProgressLedger, RecoveryCommit, StoreError, SyncStateStore};
use crate::worker::{PlatformWorkerClient, WorkerError};

use super::report::{
    DetectReport, JobOutcome, OutcomeAction, RecoveryReport, RecoveryRequest, StuckSyncView,
};

const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RecoveryOrchestrator {
    states: Arc<dyn SyncStateStore>,
    progress: Arc<dyn ProgressLedger>,
    worker: Arc<dyn PlatformWorkerClient>,
    registry: Arc<ContinuationRegistry>,
    detector: StuckDetector,
    policy: RecoveryPolicy,
    resume_timeout: Duration,
}

impl RecoveryOrchestrator {
    pub fn new(
        states: Arc<dyn SyncStateStore>,
        progress: Arc<dyn ProgressLedger>,
        worker: Arc<dyn PlatformWorkerClient>,
        registry: ContinuationRegistry,
    ) -> Self {
        Self {
            states,
            progress,
            worker,
            registry: Arc::new(registry),
            detector: StuckDetector::default(),
            policy: RecoveryPolicy::default(),
            resume_timeout: DEFAULT_RESUME_TIMEOUT,
        }
    }

    pub fn with_detector(mut self, detector: StuckDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upper bound on one continuation call, on top of the HTTP client timeout.
    pub fn with_resume_timeout(mut self, timeout: Duration) -> Self {
        self.resume_timeout = timeout;
        self
    }

    /// Read-only scan. Any storage failure fails the whole scan.
    pub async fn detect(
        &self,
        platform: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StuckSync>, StoreError> {
        let states = self.states.list_active(platform).await?;
        let mut active = Vec::with_capacity(states.len());
        for state in states {
            let attempts = self
                .states
                .recent_attempts(state.id, ATTEMPT_HISTORY_LIMIT)
                .await?;
            active.push(ActiveSync { state, attempts });
        }
        Ok(self.detector.scan(&active, now))
    }

    pub async fn detect_report(&self, platform: Option<&str>) -> DetectReport {
        match self.detect(platform, Utc::now()).await {
            Ok(stuck) => DetectReport {
                success: true,
                stuck_syncs: stuck.iter().map(StuckSyncView::from).collect(),
                error: None,
            },
            Err(e) => {
                error!(error = %e, "stuck detection failed");
                DetectReport {
                    success: false,
                    stuck_syncs: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn recover(&self, request: &RecoveryRequest) -> RecoveryReport {
        self.recover_at(request, Utc::now()).await
    }

    /// Run one recovery pass. Stuck jobs are handled concurrently; results
    /// keep detection order and omit jobs that recovered on their own.
    pub async fn recover_at(&self, request: &RecoveryRequest, now: DateTime<Utc>) -> RecoveryReport {
        let stuck = match self.detect(request.platform.as_deref(), now).await {
            Ok(stuck) => stuck,
            Err(e) => {
                error!(error = %e, "stuck detection failed; no recovery attempted");
                return RecoveryReport {
                    success: false,
                    stuck_count: 0,
                    results: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let stuck_count = stuck.len();
        info!(
            stuck_count,
            mode = request.action.as_str(),
            force_resume = request.force_resume,
            "recovery pass started"
        );

        let mut tasks = Vec::with_capacity(stuck_count);
        for job in stuck {
            let Some(decision) = self.policy.decide(request.action, request.force_resume, &job)
            else {
                continue;
            };
            let planned = match decision {
                Decision::Resume => OutcomeAction::Resume,
                Decision::Reset(_) => OutcomeAction::Reset,
            };
            let this = self.clone();
            let task_job = job.clone();
            let handle = tokio::spawn(async move { this.apply(&task_job, decision, now).await });
            tasks.push((job, planned, handle));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (job, planned, handle) in tasks {
            match handle.await {
                Ok(Some(outcome)) => results.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    error!(data_source_id = %job.state.id, error = %e, "recovery task aborted");
                    results.push(JobOutcome::new(
                        &job,
                        planned,
                        false,
                        format!("recovery task aborted: {e}"),
                    ));
                }
            }
        }

        RecoveryReport {
            success: true,
            stuck_count,
            results,
            error: None,
        }
    }

    async fn apply(
        &self,
        job: &StuckSync,
        decision: Decision,
        detected_at: DateTime<Utc>,
    ) -> Option<JobOutcome> {
        match decision {
            Decision::Reset(reason) => {
                self.reset(job, reason.message(), OutcomeAction::Reset, detected_at)
                    .await
            }
            Decision::Resume => self.resume(job, detected_at).await,
        }
    }

    async fn resume(&self, job: &StuckSync, detected_at: DateTime<Utc>) -> Option<JobOutcome> {
        let id = job.state.id;

        let request = match self.registry.build(&job.state) {
            Ok(request) => request,
            Err(e) => {
                let message = format!(
                    "Cannot resume ({e}); sync reset after {} minutes stuck",
                    job.stuck_minutes()
                );
                return self
                    .reset(job, message, OutcomeAction::Reset, detected_at)
                    .await;
            }
        };

        // Only the pass whose claim lands talks to the worker.
        let mut claimed = job.state.clone();
        claimed.claim_resume(next_token(job.observed_updated_at(), detected_at));
        match self.states.claim(&claimed, job.observed_updated_at()).await {
            Ok(CommitOutcome::Applied) => {}
            Ok(CommitOutcome::Conflict) => {
                debug!(data_source_id = %id, "sync state changed since detection; resume skipped");
                return None;
            }
            Err(e) => {
                warn!(data_source_id = %id, error = %e, "failed to claim sync for resume");
                return Some(JobOutcome::new(
                    job,
                    OutcomeAction::Resume,
                    false,
                    format!("failed to claim sync for resume: {e}"),
                ));
            }
        }

        match self.send(&request).await {
            Ok(()) => Some(self.record_resume(job, claimed, &request, detected_at).await),
            Err(e) => {
                warn!(data_source_id = %id, platform = %request.platform, error = %e, "resume failed");
                let message = format!(
                    "Resume failed ({e}); sync reset after {} minutes stuck",
                    job.stuck_minutes()
                );
                self.reset_from(
                    job,
                    &claimed,
                    message,
                    OutcomeAction::ResetAfterFailedResume,
                    detected_at,
                )
                .await
            }
        }
    }

    async fn send(&self, request: &ContinuationRequest) -> Result<(), WorkerError> {
        let call = self.worker.send(&request.endpoint, &request.payload);
        match tokio::time::timeout(self.resume_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(self.resume_timeout)),
        }
    }

    /// Commit a delivered continuation against the claim token.
    async fn record_resume(
        &self,
        job: &StuckSync,
        claimed: SyncState,
        request: &ContinuationRequest,
        detected_at: DateTime<Utc>,
    ) -> JobOutcome {
        let id = job.state.id;
        let expected_updated_at = claimed.updated_at;
        let now = next_token(expected_updated_at, detected_at);
        let mut message = format!(
            "Resumed {} sync after {} minutes stuck",
            request.platform,
            job.stuck_minutes()
        );
        let attempt = RecoveryAttempt::new(RecoveryAction::Resume, true, &message, now);

        let mut state = claimed;
        state.apply_resume(now);
        let commit = RecoveryCommit {
            state,
            expected_updated_at,
            attempt,
        };

        match self.states.commit_recovery(&commit).await {
            Ok(CommitOutcome::Applied) => {}
            Ok(CommitOutcome::Conflict) => {
                // Worker already wrote its own progress; keep it and only log the attempt.
                debug!(data_source_id = %id, "worker wrote before resume commit");
                if let Err(e) = self.states.append_attempt(id, &commit.attempt).await {
                    warn!(data_source_id = %id, error = %e, "failed to log resume attempt");
                    message.push_str(&format!(" (attempt not logged: {e})"));
                }
            }
            Err(e) => {
                warn!(data_source_id = %id, error = %e, "failed to record resume");
                message.push_str(&format!(" (attempt not logged: {e})"));
            }
        }

        info!(data_source_id = %id, platform = %request.platform, "sync resumed");
        JobOutcome::new(job, OutcomeAction::Resume, true, message)
    }

    async fn reset(
        &self,
        job: &StuckSync,
        message: String,
        action: OutcomeAction,
        detected_at: DateTime<Utc>,
    ) -> Option<JobOutcome> {
        self.reset_from(job, &job.state, message, action, detected_at)
            .await
    }

    /// Reset `job`, conditional on the row still being `current`.
    async fn reset_from(
        &self,
        job: &StuckSync,
        current: &SyncState,
        message: String,
        action: OutcomeAction,
        detected_at: DateTime<Utc>,
    ) -> Option<JobOutcome> {
        let id = job.state.id;
        let now = next_token(current.updated_at, detected_at);

        let mut state = current.clone();
        state.apply_reset(&message, now);
        let commit = RecoveryCommit {
            state,
            expected_updated_at: current.updated_at,
            attempt: RecoveryAttempt::new(RecoveryAction::Reset, true, &message, now),
        };

        match self.states.commit_recovery(&commit).await {
            Ok(CommitOutcome::Applied) => {
                match self.progress.fail_running(id, &message, now).await {
                    Ok(0) => {}
                    Ok(failed) => debug!(data_source_id = %id, failed, "running progress marked failed"),
                    Err(e) => warn!(data_source_id = %id, error = %e, "failed to close running progress"),
                }
                info!(data_source_id = %id, platform = %job.state.source_type, "sync reset");
                Some(JobOutcome::new(job, action, true, message))
            }
            Ok(CommitOutcome::Conflict) => {
                debug!(data_source_id = %id, "sync state changed since detection; reset skipped");
                None
            }
            Err(e) => {
                error!(data_source_id = %id, error = %e, "failed to reset sync");
                Some(JobOutcome::new(job, action, false, format!("failed to reset sync: {e}")))
            }
        }
    }
}

/// Token for a recovery write replacing `previous`. Strictly later than it and
/// never earlier than detection; microsecond precision so it survives a
/// round-trip through `timestamptz`.
fn next_token(previous: DateTime<Utc>, detected_at: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now()
        .max(detected_at)
        .max(previous + ChronoDuration::microseconds(1))
        .trunc_subsecs(6)
}
