//! Environment-driven configuration with sensible defaults.

use std::time::Duration;

use crate::embed::EmbedConfig;
use crate::retry::{BreakerConfig, RetryPolicy};
use crate::transform::TransformConfig;
use crate::workers::WorkerPoolConfig;

/// Full runtime configuration for the enrichment service.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// HTTP bind address (`ENRICH_BIND`).
    pub bind_addr: String,
    /// Redis URL; `None` selects the in-memory store (`ENRICH_REDIS_URL`).
    pub redis_url: Option<String>,
    /// Job record retention window (`ENRICH_JOB_RETENTION_SECS`).
    pub job_retention: Duration,
    /// Dedupe entry TTL (`ENRICH_DEDUPE_TTL_SECS`).
    pub dedupe_ttl: Duration,
    /// Worker pool tuning (`ENRICH_WORKERS`, `ENRICH_POLL_TIMEOUT_MS`,
    /// `ENRICH_TRANSFORM_RETRIES`).
    pub pool: WorkerPoolConfig,
    /// Transformer subprocess settings (`ENRICH_TRANSFORM_BIN`,
    /// `ENRICH_TRANSFORM_SCRIPT`, `ENRICH_TRANSFORM_TIMEOUT_SECS`,
    /// `ENRICH_TRANSFORM_TESTING`).
    pub transform: TransformConfig,
    pub transform_breaker: BreakerConfig,
    /// Embedding client settings (`ENRICH_EMBED_ENABLED`, `ENRICH_EMBED_URL`,
    /// `ENRICH_EMBED_TOKEN`, `ENRICH_EMBED_TENANT_HEADER`,
    /// `ENRICH_EMBED_TIMEOUT_SECS`, `ENRICH_EMBED_RETRIES`).
    pub embed: EmbedConfig,
    pub embed_breaker: BreakerConfig,
    /// Upper bound for the `async=false` blocking wait
    /// (`ENRICH_SYNC_WAIT_MS`).
    pub sync_wait: Duration,
    /// Retry the store once on submission failure
    /// (`ENRICH_STORE_RETRY_ON_SUBMIT`).
    pub store_retry_on_submit: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            redis_url: None,
            job_retention: Duration::from_secs(24 * 60 * 60),
            dedupe_ttl: Duration::from_secs(600),
            pool: WorkerPoolConfig::default(),
            transform: TransformConfig::default(),
            transform_breaker: BreakerConfig::default(),
            embed: EmbedConfig::default(),
            embed_breaker: BreakerConfig {
                threshold: 5,
                cooldown: Duration::from_secs(20),
            },
            sync_wait: Duration::from_secs(10),
            store_retry_on_submit: false,
        }
    }
}

impl EnrichConfig {
    /// Read configuration from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(bind) = env_string("ENRICH_BIND") {
            config.bind_addr = bind;
        }
        config.redis_url = env_string("ENRICH_REDIS_URL");
        config.job_retention = secs_or(
            env_string("ENRICH_JOB_RETENTION_SECS"),
            config.job_retention,
        );
        config.dedupe_ttl = secs_or(env_string("ENRICH_DEDUPE_TTL_SECS"), config.dedupe_ttl);
        config.sync_wait = millis_or(env_string("ENRICH_SYNC_WAIT_MS"), config.sync_wait);
        config.store_retry_on_submit = bool_or(
            env_string("ENRICH_STORE_RETRY_ON_SUBMIT"),
            config.store_retry_on_submit,
        );

        config.pool.workers = parse_or(env_string("ENRICH_WORKERS"), config.pool.workers);
        config.pool.poll_timeout =
            millis_or(env_string("ENRICH_POLL_TIMEOUT_MS"), config.pool.poll_timeout);
        config.pool.transform_retry = RetryPolicy {
            limit: parse_or(
                env_string("ENRICH_TRANSFORM_RETRIES"),
                config.pool.transform_retry.limit,
            ),
            ..config.pool.transform_retry
        };

        config.transform.executable =
            env_string("ENRICH_TRANSFORM_BIN").unwrap_or(config.transform.executable);
        config.transform.script =
            env_string("ENRICH_TRANSFORM_SCRIPT").unwrap_or(config.transform.script);
        config.transform.job_timeout = secs_or(
            env_string("ENRICH_TRANSFORM_TIMEOUT_SECS"),
            config.transform.job_timeout,
        );
        config.transform.testing_flag = bool_or(
            env_string("ENRICH_TRANSFORM_TESTING"),
            config.transform.testing_flag,
        );

        config.embed.enabled = bool_or(env_string("ENRICH_EMBED_ENABLED"), config.embed.enabled);
        config.embed.endpoint = env_string("ENRICH_EMBED_URL").unwrap_or(config.embed.endpoint);
        config.embed.auth_token = env_string("ENRICH_EMBED_TOKEN").or(config.embed.auth_token);
        config.embed.tenant_header =
            env_string("ENRICH_EMBED_TENANT_HEADER").unwrap_or(config.embed.tenant_header);
        config.embed.call_timeout = secs_or(
            env_string("ENRICH_EMBED_TIMEOUT_SECS"),
            config.embed.call_timeout,
        );
        config.embed.retry = RetryPolicy {
            limit: parse_or(env_string("ENRICH_EMBED_RETRIES"), config.embed.retry.limit),
            ..config.embed.retry
        };

        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn secs_or(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn millis_or(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn bool_or(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or(Some("8".to_string()), 4usize), 8);
        assert_eq!(parse_or(Some("not a number".to_string()), 4usize), 4);
        assert_eq!(parse_or(None, 4usize), 4);
    }

    #[test]
    fn duration_helpers_parse_units() {
        assert_eq!(
            secs_or(Some("90".to_string()), Duration::from_secs(1)),
            Duration::from_secs(90)
        );
        assert_eq!(
            millis_or(Some("250".to_string()), Duration::from_millis(1)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn bool_helper_accepts_common_spellings() {
        assert!(bool_or(Some("true".to_string()), false));
        assert!(bool_or(Some("1".to_string()), false));
        assert!(!bool_or(Some("no".to_string()), true));
        assert!(bool_or(Some("whatever".to_string()), true));
        assert!(!bool_or(None, false));
    }

    #[test]
    fn defaults_are_reasonable() {
        let config = EnrichConfig::default();
        assert_eq!(config.pool.workers, 4);
        assert!(config.redis_url.is_none());
        assert!(!config.store_retry_on_submit);
        assert_eq!(config.sync_wait, Duration::from_secs(10));
    }
}
