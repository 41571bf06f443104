//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

/// Retry budget applied to steps that do not declare their own.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL connection URL (unused with the in-memory store)
    pub database_url: Option<String>,

    /// Max concurrent step executions within one resolution
    pub max_concurrent_executions: usize,

    /// Max concurrent step executions across the whole process
    pub global_max_executions: usize,

    /// Number of workers consuming the resolution submission channel
    pub engine_workers: usize,

    /// Capacity of the resolution submission channel
    pub submission_queue_size: usize,

    /// Named resource tags and their permit counts
    pub resource_limits: HashMap<String, usize>,

    /// How often the retry collector scans for eligible resolutions
    pub retry_collector_interval: Duration,

    /// How many resolutions one collector tick may submit
    pub collector_batch_size: i64,

    /// RUNNING resolutions older than this with a free lock are crashed
    pub liveness_window: Duration,

    /// Overall per-step execution timeout enforced by the scheduler
    pub step_execution_timeout: Duration,

    /// Grace period granted to in-flight runners on shutdown
    pub shutdown_grace: Duration,

    /// Refresh period of the task-state gauge
    pub metrics_refresh_interval: Duration,

    /// TTL of the per-resolution lock claim
    pub lock_ttl: Duration,

    /// How much one extend call raises a step's max_retries
    pub retry_extension_delta: u32,

    /// Upper bound max_retries can be extended to
    pub retry_extension_cap: u32,

    /// Identity of this engine instance
    pub instance_id: Uuid,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrent_executions: 100,
            global_max_executions: 1000,
            engine_workers: num_cpus::get().max(1) * 2,
            submission_queue_size: 1024,
            resource_limits: HashMap::new(),
            retry_collector_interval: Duration::from_secs(10),
            collector_batch_size: 100,
            liveness_window: Duration::from_secs(60),
            step_execution_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            metrics_refresh_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(300),
            retry_extension_delta: 10,
            retry_extension_cap: 100,
            instance_id: Uuid::new_v4(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").ok();

        let max_concurrent_executions = env_usize(
            "CAIRN_MAX_CONCURRENT_EXECUTIONS",
            defaults.max_concurrent_executions,
        );
        let global_max_executions =
            env_usize("CAIRN_GLOBAL_MAX_EXECUTIONS", defaults.global_max_executions);
        let engine_workers = env_usize("CAIRN_ENGINE_WORKERS", defaults.engine_workers);
        let submission_queue_size =
            env_usize("CAIRN_SUBMISSION_QUEUE_SIZE", defaults.submission_queue_size);

        let resource_limits = match std::env::var("CAIRN_RESOURCE_LIMITS") {
            Ok(raw) => parse_resource_limits(&raw)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            database_url,
            max_concurrent_executions,
            global_max_executions,
            engine_workers,
            submission_queue_size,
            resource_limits,
            retry_collector_interval: env_secs(
                "CAIRN_RETRY_COLLECTOR_INTERVAL_SECS",
                defaults.retry_collector_interval,
            ),
            collector_batch_size: env_i64(
                "CAIRN_COLLECTOR_BATCH_SIZE",
                defaults.collector_batch_size,
            ),
            liveness_window: env_secs("CAIRN_LIVENESS_WINDOW_SECS", defaults.liveness_window),
            step_execution_timeout: env_secs(
                "CAIRN_STEP_EXECUTION_TIMEOUT_SECS",
                defaults.step_execution_timeout,
            ),
            shutdown_grace: env_secs("CAIRN_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            metrics_refresh_interval: env_secs(
                "CAIRN_METRICS_REFRESH_SECS",
                defaults.metrics_refresh_interval,
            ),
            lock_ttl: env_secs("CAIRN_LOCK_TTL_SECS", defaults.lock_ttl),
            retry_extension_delta: env_u32(
                "CAIRN_RETRY_EXTENSION_DELTA",
                defaults.retry_extension_delta,
            ),
            retry_extension_cap: env_u32(
                "CAIRN_RETRY_EXTENSION_CAP",
                defaults.retry_extension_cap,
            ),
            instance_id: Uuid::new_v4(),
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Parse `socket:128,fork:16,url:api.example.com:8` into tag limits. The last
/// colon-separated field is the permit count; everything before it is the tag.
pub fn parse_resource_limits(raw: &str) -> anyhow::Result<HashMap<String, usize>> {
    let mut limits = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (tag, count) = entry
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid resource limit entry {entry:?}"))?;
        let count: usize = count
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid permit count in {entry:?}"))?;
        if tag.is_empty() {
            anyhow::bail!("invalid resource limit entry {entry:?}");
        }
        limits.insert(tag.to_string(), count);
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_limits_with_host_tags() {
        let limits =
            parse_resource_limits("socket:128, fork:16,url:api.example.com:8").expect("parse");
        assert_eq!(limits["socket"], 128);
        assert_eq!(limits["fork"], 16);
        assert_eq!(limits["url:api.example.com"], 8);
    }

    #[test]
    fn rejects_malformed_limits() {
        assert!(parse_resource_limits("socket").is_err());
        assert!(parse_resource_limits("socket:many").is_err());
        assert!(parse_resource_limits(":8").is_err());
    }

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_executions, 100);
        assert_eq!(config.retry_collector_interval, Duration::from_secs(10));
        assert_eq!(config.step_execution_timeout, Duration::from_secs(3600));
    }
}
