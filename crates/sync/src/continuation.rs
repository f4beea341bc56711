//! Platform-specific continuation payloads.
//!
//! A continuation tells a platform worker where to pick up an interrupted sync.
//! Builders only echo positions the worker itself stored; a missing position is
//! an error, never a guess, so the caller can reset instead of re-ingesting.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::state::SyncState;

/// Platform identifier of the phased backfill integration.
pub const SMARTLEAD: &str = "smartlead";
/// Platform identifier of the batch cursor integration.
pub const REPLYIO: &str = "replyio";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContinuationError {
    #[error("no safe resume point for {platform}: {reason}")]
    NoResumePoint { platform: String, reason: String },

    #[error("no continuation builder registered for platform '{0}'")]
    UnknownPlatform(String),
}

impl ContinuationError {
    fn no_resume_point(platform: &str, reason: impl Into<String>) -> Self {
        Self::NoResumePoint {
            platform: platform.to_string(),
            reason: reason.into(),
        }
    }
}

/// A ready-to-send continuation for one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuationRequest {
    pub platform: String,
    /// Worker endpoint name, appended to the worker base URL.
    pub endpoint: String,
    pub payload: Value,
}

/// Builds the continuation payload for one platform.
pub trait ContinuationBuilder: Send + Sync {
    fn platform(&self) -> &str;

    fn endpoint(&self) -> &str;

    fn build(&self, state: &SyncState) -> Result<Value, ContinuationError>;
}

/// Phased backfill: a historical phase walked in chunks, then a campaigns phase
/// walked by offset.
#[derive(Debug, Clone)]
pub struct PhasedBackfillBuilder {
    platform: String,
    endpoint: String,
}

impl PhasedBackfillBuilder {
    pub fn new(platform: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for PhasedBackfillBuilder {
    fn default() -> Self {
        Self::new(SMARTLEAD, "smartlead-sync")
    }
}

impl ContinuationBuilder for PhasedBackfillBuilder {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build(&self, state: &SyncState) -> Result<Value, ContinuationError> {
        let config = &state.config;
        match config.phase.as_deref() {
            Some("historical") => {
                let chunk = config.historical_chunk_index.ok_or_else(|| {
                    ContinuationError::no_resume_point(
                        &self.platform,
                        "historical phase without historicalChunkIndex",
                    )
                })?;
                Ok(json!({
                    "dataSourceId": state.id,
                    "isContinuation": true,
                    "phase": "historical",
                    "historicalChunkIndex": chunk,
                }))
            }
            Some("campaigns") => {
                let offset = config.campaign_offset.ok_or_else(|| {
                    ContinuationError::no_resume_point(
                        &self.platform,
                        "campaigns phase without campaignOffset",
                    )
                })?;
                Ok(json!({
                    "dataSourceId": state.id,
                    "isContinuation": true,
                    "phase": "campaigns",
                    "campaignOffset": offset,
                }))
            }
            Some(other) => Err(ContinuationError::no_resume_point(
                &self.platform,
                format!("unknown phase '{other}'"),
            )),
            None => Err(ContinuationError::no_resume_point(&self.platform, "no phase recorded")),
        }
    }
}

/// Batch cursor: the worker processes numbered batches and auto-continues.
#[derive(Debug, Clone)]
pub struct BatchCursorBuilder {
    platform: String,
    endpoint: String,
}

impl BatchCursorBuilder {
    pub fn new(platform: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl Default for BatchCursorBuilder {
    fn default() -> Self {
        Self::new(REPLYIO, "replyio-sync")
    }
}

impl ContinuationBuilder for BatchCursorBuilder {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build(&self, state: &SyncState) -> Result<Value, ContinuationError> {
        let last = state.config.batch_number.ok_or_else(|| {
            ContinuationError::no_resume_point(&self.platform, "no batchNumber recorded")
        })?;
        let next = last.checked_add(1).ok_or_else(|| {
            ContinuationError::no_resume_point(&self.platform, "batchNumber overflow")
        })?;

        Ok(json!({
            "dataSourceId": state.id,
            "isContinuation": true,
            "autoContinue": true,
            "batchNumber": next,
        }))
    }
}

/// Platform identifier → builder.
///
/// Adding a platform means registering a builder; the orchestrator does not
/// branch on platform names.
#[derive(Clone, Default)]
pub struct ContinuationRegistry {
    builders: HashMap<String, Arc<dyn ContinuationBuilder>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in platforms.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PhasedBackfillBuilder::default());
        registry.register(BatchCursorBuilder::default());
        registry
    }

    pub fn register<B>(&mut self, builder: B)
    where
        B: ContinuationBuilder + 'static,
    {
        self.builders
            .insert(builder.platform().to_string(), Arc::new(builder));
    }

    pub fn get(&self, platform: &str) -> Option<&Arc<dyn ContinuationBuilder>> {
        self.builders.get(platform)
    }

    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, state: &SyncState) -> Result<ContinuationRequest, ContinuationError> {
        let builder = self
            .get(&state.source_type)
            .ok_or_else(|| ContinuationError::UnknownPlatform(state.source_type.clone()))?;

        Ok(ContinuationRequest {
            platform: builder.platform().to_string(),
            endpoint: builder.endpoint().to_string(),
            payload: builder.build(state)?,
        })
    }
}

impl core::fmt::Debug for ContinuationRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContinuationRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
