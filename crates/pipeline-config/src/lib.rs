//! Recognized environment configuration (§6).
//!
//! Parsed with `envy` from a flat set of environment variables, the way
//! `tandem-core::config::ConfigStore` resolves its env layer before merging
//! project/global config files — this process has no file layers, so the
//! env layer is the whole story.

use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Flat view of every environment variable recognized by §6. `envy`
/// upper-cases each field name to find its source var, e.g. `database_url`
/// -> `DATABASE_URL`, `pool_min` -> `POOL_MIN`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub database_url: String,
    #[serde(default = "default_event_bus_project_id")]
    pub event_bus_project_id: String,
    pub event_bus_emulator_host: Option<String>,

    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub pool_acquire_timeout_ms: u64,
    #[serde(default = "default_slow_query_ms")]
    pub pool_slow_query_ms: u64,
    #[serde(default = "default_leak_warn_secs")]
    pub pool_leak_warn_secs: u64,

    #[serde(default = "default_error_threshold")]
    pub breaker_error_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,

    #[serde(default = "default_stall_timeout_ms")]
    pub lifecycle_stall_timeout_ms: u64,
    #[serde(default = "default_reclaim_interval_ms")]
    pub lifecycle_reclaim_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_safety_retries")]
    pub worker_safety_retries: u32,
    #[serde(default = "default_rate_limit_retry_cap")]
    pub worker_rate_limit_retry_cap: u32,
    #[serde(default = "default_claim_poll_backoff_ms")]
    pub worker_claim_poll_backoff_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub worker_heartbeat_interval_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub worker_default_job_timeout_ms: u64,
    #[serde(default = "default_video_job_timeout_ms")]
    pub worker_video_job_timeout_ms: u64,
}

fn default_event_bus_project_id() -> String {
    "local".to_string()
}
fn default_pool_min() -> u32 {
    1
}
fn default_pool_max() -> u32 {
    10
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_slow_query_ms() -> u64 {
    250
}
fn default_leak_warn_secs() -> u64 {
    30
}
fn default_error_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_stall_timeout_ms() -> u64 {
    2 * 60_000
}
fn default_reclaim_interval_ms() -> u64 {
    15_000
}
fn default_max_retries() -> i32 {
    3
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_safety_retries() -> u32 {
    2
}
fn default_rate_limit_retry_cap() -> u32 {
    5
}
fn default_claim_poll_backoff_ms() -> u64 {
    200
}
fn default_heartbeat_interval_ms() -> u64 {
    15_000
}
fn default_job_timeout_ms() -> u64 {
    5 * 60_000
}
fn default_video_job_timeout_ms() -> u64 {
    15 * 60_000
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub acquire_timeout_ms: u64,
    pub slow_query_ms: u64,
    pub leak_warn_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub error_threshold: u32,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub stall_timeout_ms: u64,
    pub reclaim_interval_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub safety_retries: u32,
    pub rate_limit_retry_cap: u32,
    pub claim_poll_backoff_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub default_job_timeout_ms: u64,
    pub video_job_timeout_ms: u64,
}

impl OrchestratorConfig {
    /// Loads configuration from process environment variables. Fails fast
    /// on missing required values (`DATABASE_URL`), matching §6's
    /// "required" column.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = envy::from_env().map_err(|e| ConfigError::Invalid(format!("{e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("DATABASE_URL must not be empty".into()));
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::Invalid("POOL_MIN must be <= POOL_MAX".into()));
        }
        Ok(())
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            min: self.pool_min,
            max: self.pool_max,
            acquire_timeout_ms: self.pool_acquire_timeout_ms,
            slow_query_ms: self.pool_slow_query_ms,
            leak_warn_secs: self.pool_leak_warn_secs,
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            error_threshold: self.breaker_error_threshold,
            reset_timeout_ms: self.breaker_reset_timeout_ms,
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            stall_timeout_ms: self.lifecycle_stall_timeout_ms,
            reclaim_interval_ms: self.lifecycle_reclaim_interval_ms,
        }
    }

    pub fn worker(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.worker_concurrency,
            safety_retries: self.worker_safety_retries,
            rate_limit_retry_cap: self.worker_rate_limit_retry_cap,
            claim_poll_backoff_ms: self.worker_claim_poll_backoff_ms,
            heartbeat_interval_ms: self.worker_heartbeat_interval_ms,
            default_job_timeout_ms: self.worker_default_job_timeout_ms,
            video_job_timeout_ms: self.worker_video_job_timeout_ms,
        }
    }

    #[cfg(test)]
    fn test_default(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            event_bus_project_id: default_event_bus_project_id(),
            event_bus_emulator_host: None,
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            pool_acquire_timeout_ms: default_acquire_timeout_ms(),
            pool_slow_query_ms: default_slow_query_ms(),
            pool_leak_warn_secs: default_leak_warn_secs(),
            breaker_error_threshold: default_error_threshold(),
            breaker_reset_timeout_ms: default_reset_timeout_ms(),
            lifecycle_stall_timeout_ms: default_stall_timeout_ms(),
            lifecycle_reclaim_interval_ms: default_reclaim_interval_ms(),
            default_max_retries: default_max_retries(),
            worker_concurrency: default_worker_concurrency(),
            worker_safety_retries: default_safety_retries(),
            worker_rate_limit_retry_cap: default_rate_limit_retry_cap(),
            worker_claim_poll_backoff_ms: default_claim_poll_backoff_ms(),
            worker_heartbeat_interval_ms: default_heartbeat_interval_ms(),
            worker_default_job_timeout_ms: default_job_timeout_ms(),
            worker_video_job_timeout_ms: default_video_job_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_database_url() {
        let config = OrchestratorConfig::test_default("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut config = OrchestratorConfig::test_default("postgres://localhost/test");
        config.pool_min = 20;
        config.pool_max = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_defaults_applied_when_unset() {
        let config = OrchestratorConfig::test_default("postgres://localhost/test");
        let pool = config.pool();
        assert_eq!(pool.min, 1);
        assert_eq!(pool.max, 10);
    }

    #[test]
    fn worker_defaults_applied_when_unset() {
        let config = OrchestratorConfig::test_default("postgres://localhost/test");
        let worker = config.worker();
        assert_eq!(worker.concurrency, 4);
        assert!(worker.video_job_timeout_ms > worker.default_job_timeout_ms);
    }
}
