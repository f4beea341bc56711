//! Stuck sync recovery: detection, the resume/reset decision and the
//! conditional writes that carry it out.

pub mod orchestrator;
pub mod report;

pub use orchestrator::RecoveryOrchestrator;
pub use report::{
    DetectReport, JobOutcome, OutcomeAction, RecoveryReport, RecoveryRequest, StuckSyncView,
};
