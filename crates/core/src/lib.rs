//! `outreach-core`: shared building blocks for the sync recovery workspace.
//!
//! Identifiers and the domain error model. No infrastructure concerns live here.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{DataSourceId, EngagementId, RetryItemId};
