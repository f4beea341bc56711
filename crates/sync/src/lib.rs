//! Sync-job lifecycle domain: state, progress, retry items, stuck detection and
//! the resume-vs-reset policy.
//!
//! Everything in this crate is deterministic and takes `now` explicitly
//! (no IO, no HTTP, no storage). Persistence and the orchestration loop live in
//! `outreach-infra`.

pub mod attempt;
pub mod continuation;
pub mod detector;
pub mod policy;
pub mod progress;
pub mod retry;
pub mod state;

pub use attempt::{RecoveryAction, RecoveryAttempt, ATTEMPT_HISTORY_LIMIT};
pub use continuation::{
    BatchCursorBuilder, ContinuationBuilder, ContinuationError, ContinuationRegistry,
    ContinuationRequest, PhasedBackfillBuilder,
};
pub use detector::{ActiveSync, DetectionThresholds, StuckDetector, StuckSync};
pub use policy::{Decision, RecoveryLimits, RecoveryMode, RecoveryPolicy, ResetReason};
pub use progress::{ProgressRecord, ProgressStatus, ProgressUpdate, MAX_PROGRESS_ERRORS};
pub use retry::{BackoffStrategy, RetryItemStatus, RetryPolicy, RetryQueueItem};
pub use state::{SyncConfig, SyncState, SyncStatus};
