//! Configuration loading and representation.
//!
//! Everything comes from environment variables (a `.env` file is loaded first
//! if present). Unparseable numbers are errors rather than silent defaults.

use std::time::Duration;

use outreach_sync::{BackoffStrategy, DetectionThresholds, RecoveryLimits, RetryPolicy};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {key}: '{value}' ({reason})")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Base URL of the platform workers; `None` makes every resume fail into a reset.
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub thresholds: DetectionThresholds,
    pub limits: RecoveryLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub policy: RetryPolicy,
    /// `None` disables the background poller.
    pub poll_interval: Option<Duration>,
    /// How long a claimed item may stay `processing` before another pass takes it over.
    pub claim_lease: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    /// `None` selects the in-memory stores.
    pub database_url: Option<String>,
    /// Bearer token required on the API when set.
    pub api_token: Option<String>,
    pub worker: WorkerConfig,
    pub recovery: RecoveryConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let thresholds = DetectionThresholds::default();
        let limits = RecoveryLimits::default();
        let policy = RetryPolicy::default();

        Ok(Self {
            bind_addr: env
                .opt("BIND_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: env.opt("DATABASE_URL"),
            api_token: env.opt("RECOVERY_API_TOKEN"),
            worker: WorkerConfig {
                base_url: env.opt("SYNC_WORKER_BASE_URL"),
                token: env.opt("SYNC_WORKER_TOKEN"),
                timeout: Duration::from_secs(env.positive("SYNC_WORKER_TIMEOUT_SECS", 30)?),
            },
            recovery: RecoveryConfig {
                thresholds: DetectionThresholds {
                    syncing: env.minutes("RECOVERY_SYNCING_THRESHOLD_MINS", thresholds.syncing)?,
                    partial: env.minutes("RECOVERY_PARTIAL_THRESHOLD_MINS", thresholds.partial)?,
                    debounce: env.minutes("RECOVERY_DEBOUNCE_MINS", thresholds.debounce)?,
                    attempt_window: thresholds.attempt_window,
                },
                limits: RecoveryLimits {
                    max_stuck: env.minutes("RECOVERY_MAX_STUCK_MINS", limits.max_stuck)?,
                    max_resume_attempts: env
                        .positive("RECOVERY_MAX_ATTEMPTS_PER_HOUR", limits.max_resume_attempts as u64)?
                        as usize,
                },
            },
            retry: RetryConfig {
                policy: RetryPolicy {
                    max_retries: env.number("RETRY_MAX_RETRIES", u64::from(policy.max_retries))?
                        .min(u64::from(u32::MAX)) as u32,
                    base_delay: Duration::from_secs(
                        env.number("RETRY_BASE_DELAY_SECS", policy.base_delay.as_secs())?,
                    ),
                    max_delay: Duration::from_secs(
                        env.number("RETRY_MAX_DELAY_SECS", policy.max_delay.as_secs())?,
                    ),
                    strategy: BackoffStrategy::Exponential,
                },
                poll_interval: match env.number("RETRY_POLL_INTERVAL_SECS", 60)? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                claim_lease: Duration::from_secs(env.positive("RETRY_CLAIM_LEASE_SECS", 900)?),
            },
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.opt(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.number(key, default)? {
            0 => Err(ConfigError {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            n => Ok(n),
        }
    }

    fn minutes(&self, key: &str, default: chrono::Duration) -> Result<chrono::Duration, ConfigError> {
        let mins = self.number(key, default.num_minutes().max(0) as u64)?;
        let mins = i64::try_from(mins).map_err(|e| ConfigError {
            key: key.to_string(),
            value: mins.to_string(),
            reason: e.to_string(),
        })?;
        chrono::Duration::try_minutes(mins).ok_or_else(|| ConfigError {
            key: key.to_string(),
            value: mins.to_string(),
            reason: "out of range".to_string(),
        })
    }
}
